// Jobs input parsing. The input is a CSV with one job per row; unknown
// columns ride along untouched so user spreadsheets survive a round trip
// through `make-dirs-csv` and hand edits.

use std::path::{Path, PathBuf};

use crate::PilotError;

pub const REQUIRED_COLUMNS: [&str; 7] = [
    "job_name",
    "directory",
    "command",
    "analysis_code",
    "analysis_version",
    "core_type",
    "walltime_hours",
];

#[derive(Debug, Clone)]
pub struct JobRow {
    /// 1-based, stable for the lifetime of the run.
    pub index: u32,
    pub name: String,
    pub directory: PathBuf,
    pub command: String,
    pub analysis_code: String,
    pub analysis_version: String,
    pub core_type: String,
    pub walltime_hours: f64,
    /// Already-uploaded input file ids, ';'-separated in the csv.
    pub extra_input_file_ids: Vec<String>,
    pub project_id: Option<String>,
    pub tags: Vec<String>,
    /// Unknown columns, preserved in csv order.
    pub extra: Vec<(String, String)>,
}

impl JobRow {
    /// Rows without a directory carry pre-uploaded inputs only and enter the
    /// pipeline at CREATE.
    pub fn needs_archive(&self) -> bool {
        !self.directory.as_os_str().is_empty()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(';').map(|s| s.trim()).filter(|s| !s.is_empty()).map(String::from).collect()
}

/// Parse the jobs csv. Missing required headers or unusable fields are
/// Validation errors naming the row, raised before any remote call.
pub fn read_jobs_csv(path: &Path) -> anyhow::Result<Vec<JobRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| PilotError::Validation(format!("无法读取任务表 {}: {}", path.display(), e)))?;
    let headers = rdr
        .headers()
        .map_err(|e| PilotError::Validation(format!("任务表表头损坏: {}", e)))?
        .clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    for required in REQUIRED_COLUMNS {
        if col(required).is_none() {
            return Err(
                PilotError::Validation(format!("任务表缺少必需列: {}", required)).into()
            );
        }
    }
    let known: Vec<usize> = REQUIRED_COLUMNS
        .iter()
        .chain(["extra_input_file_ids", "project_id", "tags"].iter())
        .filter_map(|n| col(n))
        .collect();

    let mut out = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let index = (i + 1) as u32;
        let rec = rec.map_err(|e| {
            PilotError::Validation(format!("任务表第 {} 行解析失败: {}", index, e))
        })?;
        let get = |name: &str| col(name).and_then(|j| rec.get(j)).unwrap_or("").to_string();

        let name = get("job_name");
        if name.is_empty() {
            return Err(
                PilotError::Validation(format!("第 {} 行 job_name 为空", index)).into()
            );
        }
        let directory = get("directory");
        let extra_ids = split_list(&get("extra_input_file_ids"));
        if directory.is_empty() && extra_ids.is_empty() {
            return Err(PilotError::Validation(format!(
                "第 {} 行 directory 与 extra_input_file_ids 至少要有一个",
                index
            ))
            .into());
        }
        let walltime_raw = get("walltime_hours");
        let walltime_hours = walltime_raw.parse::<f64>().map_err(|_| {
            PilotError::Validation(format!(
                "第 {} 行 walltime_hours 非法: {:?}",
                index, walltime_raw
            ))
        })?;
        if walltime_hours <= 0.0 {
            return Err(PilotError::Validation(format!(
                "第 {} 行 walltime_hours 必须为正数",
                index
            ))
            .into());
        }

        let project_raw = get("project_id");
        let extra: Vec<(String, String)> = headers
            .iter()
            .enumerate()
            .filter(|(j, _)| !known.contains(j))
            .map(|(j, h)| (h.to_string(), rec.get(j).unwrap_or("").to_string()))
            .collect();

        out.push(JobRow {
            index,
            name,
            directory: PathBuf::from(directory),
            command: get("command"),
            analysis_code: get("analysis_code"),
            analysis_version: get("analysis_version"),
            core_type: get("core_type"),
            walltime_hours,
            extra_input_file_ids: extra_ids,
            project_id: if project_raw.is_empty() { None } else { Some(project_raw) },
            tags: split_list(&get("tags")),
            extra,
        });
    }
    if out.is_empty() {
        return Err(PilotError::Validation("任务表没有数据行".to_string()).into());
    }
    Ok(out)
}

/// Generate a template csv with one row per immediate subdirectory of
/// `root`, ready for hand editing.
pub fn write_template_csv(root: &Path, out: &Path) -> anyhow::Result<usize> {
    if !root.is_dir() {
        return Err(
            PilotError::Validation(format!("目录不存在: {}", root.display())).into()
        );
    }
    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(root)
        .map_err(|e| PilotError::from_io(&e, "读取目录"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.path())
        .collect();
    subdirs.sort();
    if subdirs.is_empty() {
        return Err(
            PilotError::Validation(format!("{} 下没有子目录", root.display())).into()
        );
    }
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record([
        "job_name",
        "directory",
        "command",
        "analysis_code",
        "analysis_version",
        "core_type",
        "walltime_hours",
        "extra_input_file_ids",
    ])
    .map_err(|e| PilotError::Fatal(format!("写模板表头失败: {}", e)))?;
    for dir in &subdirs {
        let name = dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        w.write_record([
            name.as_str(),
            &dir.display().to_string(),
            "bash run.sh",
            "user_included",
            "0",
            "standard",
            "1.0",
            "",
        ])
        .map_err(|e| PilotError::Fatal(format!("写模板行失败: {}", e)))?;
    }
    let body =
        w.into_inner().map_err(|e| PilotError::Fatal(format!("刷写模板缓冲失败: {}", e)))?;
    crate::util::atomic_write(out, &body).map_err(|e| PilotError::from_io(&e, "写入模板文件"))?;
    Ok(subdirs.len())
}
