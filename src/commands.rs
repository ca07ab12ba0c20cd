// Command handlers: thin glue between the CLI surface and the engines. Every
// handler validates locally first; remote work happens through the Services
// bundle created once per invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};
use crossbeam_channel::unbounded;
use indicatif::ProgressBar;

use crate::PilotError;
use crate::api::{ApiClient, ComputeApi};
use crate::archive::{ArchiveOptions, Compression};
use crate::config::{Config, UploadCheck};
use crate::conflict::{ConflictAction, ConflictChoice, ConflictPolicy};
use crate::pipeline::engine::{self, PipelineOptions, PipelineOutcome};
use crate::pipeline::rows::{self, JobRow};
use crate::pipeline::state::read_state_file;
use crate::transfer::download::{DownloadRequest, download_file};
use crate::transfer::store::{HttpStore, StoreLike};
use crate::transfer::upload::{UploadRequest, upload_file};
use crate::transfer::TransferGovernor;
use crate::treeplan;

/// Process-wide collaborators, created at startup and passed into engines.
pub struct Services {
    pub api: ApiClient,
    pub store: HttpStore,
    pub governor: Arc<TransferGovernor>,
    pub config: Config,
}

impl Services {
    pub fn init(config: Config) -> Result<Services> {
        config.require_api_key()?;
        let api = ApiClient::new(&config.api_base_url, &config.api_key)?;
        let store = HttpStore::new()?;
        let governor = TransferGovernor::new(
            config.transfer_slots,
            config.max_threads,
            config.auto_scale,
        );
        Ok(Services { api, store, governor, config })
    }
}

// ---------------------------------------------------------------------------
// pur
// ---------------------------------------------------------------------------

pub struct PurRunArgs {
    pub csv: PathBuf,
    pub state: PathBuf,
    pub tar_workers: usize,
    pub upload_workers: usize,
    pub job_workers: usize,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub rm_tar_on_success: bool,
    pub dest_folder: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub flatten: bool,
    pub gzip: bool,
    pub json: bool,
}

fn validate_rows(rows: &[JobRow]) -> Result<()> {
    for row in rows {
        if row.needs_archive() && !row.directory.is_dir() {
            return Err(PilotError::Validation(format!(
                "第 {} 行任务目录不存在: {}",
                row.index,
                row.directory.display()
            ))
            .into());
        }
    }
    Ok(())
}

pub fn handle_pur_make_dirs_csv(root: &Path, out: &Path) -> Result<()> {
    let n = rows::write_template_csv(root, out)?;
    println!("已生成 {}（{} 行），请补全命令与硬件配置后运行 jp pur run", out.display(), n);
    Ok(())
}

pub fn handle_pur_plan(csv: &Path, state: Option<&Path>) -> Result<()> {
    let rows = rows::read_jobs_csv(csv)?;
    validate_rows(&rows)?;
    let existing = match state {
        Some(p) => read_state_file(p)?,
        None => Vec::new(),
    };
    print_plan(&rows, &existing);
    Ok(())
}

fn print_plan(rows: &[JobRow], existing: &[crate::pipeline::state::RowState]) {
    let planned = engine::plan(rows, existing);
    let title = vec![
        "Row".cell().bold(true),
        "Name".cell().bold(true),
        "Next Stage".cell().bold(true),
        "Pending Bytes".cell().bold(true),
    ];
    let mut table: Vec<Vec<CellStruct>> = Vec::new();
    let mut total_bytes = 0u64;
    for p in &planned {
        total_bytes += p.pending_bytes;
        table.push(vec![
            p.index.cell().justify(Justify::Right),
            p.name.clone().cell(),
            p.next.map(|s| s.label()).unwrap_or("done").cell(),
            crate::util::human_bytes(p.pending_bytes).cell().justify(Justify::Right),
        ]);
    }
    if let Err(e) = print_stdout(table.table().title(title)) {
        eprintln!("⚠️ 无法渲染表格: {}", e);
    }
    println!("共 {} 行，待传输约 {}", planned.len(), crate::util::human_bytes(total_bytes));
}

/// Shared by `pur run` and `pur resume` (a run over an existing state file is
/// a resume). Returns the process exit code.
pub fn handle_pur_run(svc: &Services, args: PurRunArgs) -> Result<i32> {
    let rows = rows::read_jobs_csv(&args.csv)?;
    validate_rows(&rows)?;

    if args.dry_run {
        let existing = read_state_file(&args.state)?;
        print_plan(&rows, &existing);
        return Ok(0);
    }

    let opts = PipelineOptions {
        state_path: args.state.clone(),
        tar_workers: args.tar_workers,
        upload_workers: args.upload_workers,
        job_workers: args.job_workers,
        continue_on_error: args.continue_on_error,
        rm_tar_on_success: args.rm_tar_on_success,
        archive: ArchiveOptions {
            include: args.include.clone(),
            exclude: args.exclude.clone(),
            flatten: args.flatten,
            compression: if args.gzip { Compression::Gzip } else { Compression::None },
        },
        dest_folder_id: args.dest_folder.clone(),
        max_retries: crate::transfer::DEFAULT_PART_RETRIES,
        quiet: args.json,
    };
    let outcome = engine::run_pipeline(&svc.api, &svc.store, &svc.governor, rows, opts)?;
    print_pipeline_summary(&outcome, &args.csv, &args.state, args.json);

    if outcome.fully_successful() {
        Ok(0)
    } else if args.continue_on_error {
        // 部分成功保留专用退出码
        Ok(3)
    } else {
        Ok(1)
    }
}

fn print_pipeline_summary(outcome: &PipelineOutcome, csv: &Path, state: &Path, json: bool) {
    println!(
        "行数: {} (已完成跳过 {}) | tar {}/{} | upload {}/{} | create {}/{} | submit {}/{} | 耗时 {:.1}s",
        outcome.rows_total,
        outcome.skipped_done,
        outcome.tar.success,
        outcome.tar.success + outcome.tar.failed,
        outcome.upload.success,
        outcome.upload.success + outcome.upload.failed,
        outcome.create.success,
        outcome.create.success + outcome.create.failed,
        outcome.submit.success,
        outcome.submit.success + outcome.submit.failed,
        outcome.elapsed_secs
    );
    if !outcome.failures.is_empty() {
        println!("失败 {} 行:", outcome.failures.len());
        for (index, name, err) in &outcome.failures {
            println!("  行 {} ({}): {}", index, name, err);
        }
        let failures: Vec<PilotError> = outcome
            .failures
            .iter()
            .map(|(_, name, err)| PilotError::Fatal(format!("{}: {}", name, err)))
            .collect();
        if let Some(p) = crate::util::write_failures_jsonl(&failures) {
            println!("失败清单已写入: {}", p.display());
        }
        println!(
            "可使用以下命令续跑: jp pur resume {} --state {}",
            csv.display(),
            state.display()
        );
    }
    if json {
        let obj = serde_json::json!({
            "rows": outcome.rows_total,
            "skipped_done": outcome.skipped_done,
            "tar_success": outcome.tar.success,
            "upload_success": outcome.upload.success,
            "create_success": outcome.create.success,
            "submit_success": outcome.submit.success,
            "failures": outcome.failures.len(),
            "elapsed_secs": outcome.elapsed_secs,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            println!("{}", line);
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn handle_pur_submit_existing(
    svc: &Services,
    csv: Option<&Path>,
    file_ids: &[String],
    name: Option<String>,
    command: Option<String>,
    analysis_code: Option<String>,
    analysis_version: Option<String>,
    core_type: Option<String>,
    walltime_hours: Option<f64>,
    state: &Path,
    continue_on_error: bool,
) -> Result<i32> {
    // 同时给 csv 与直接 id 视为歧义，拒绝执行
    if csv.is_some() && !file_ids.is_empty() {
        return Err(PilotError::Validation(
            "--csv 与 --file-id 不能同时使用，请只保留一种提交方式".to_string(),
        )
        .into());
    }
    let rows: Vec<JobRow> = if let Some(csv) = csv {
        let rows = rows::read_jobs_csv(csv)?;
        for row in &rows {
            if row.extra_input_file_ids.is_empty() {
                return Err(PilotError::Validation(format!(
                    "第 {} 行缺少 extra_input_file_ids，submit-existing 需要已上传的文件",
                    row.index
                ))
                .into());
            }
        }
        // 直接进入 CREATE，不再归档/上传
        rows.into_iter()
            .map(|mut r| {
                r.directory = PathBuf::new();
                r
            })
            .collect()
    } else if !file_ids.is_empty() {
        let missing = [
            ("--name", name.is_none()),
            ("--command", command.is_none()),
            ("--analysis-code", analysis_code.is_none()),
            ("--analysis-version", analysis_version.is_none()),
            ("--core-type", core_type.is_none()),
            ("--walltime-hours", walltime_hours.is_none()),
        ];
        let missing: Vec<&str> =
            missing.iter().filter(|(_, m)| *m).map(|(f, _)| *f).collect();
        if !missing.is_empty() {
            return Err(PilotError::Validation(format!(
                "直接提交缺少参数: {}",
                missing.join(", ")
            ))
            .into());
        }
        vec![JobRow {
            index: 1,
            name: name.unwrap_or_default(),
            directory: PathBuf::new(),
            command: command.unwrap_or_default(),
            analysis_code: analysis_code.unwrap_or_default(),
            analysis_version: analysis_version.unwrap_or_default(),
            core_type: core_type.unwrap_or_default(),
            walltime_hours: walltime_hours.unwrap_or(1.0),
            extra_input_file_ids: file_ids.to_vec(),
            project_id: None,
            tags: Vec::new(),
            extra: Vec::new(),
        }]
    } else {
        return Err(
            PilotError::Validation("需要 --csv 或至少一个 --file-id".to_string()).into()
        );
    };

    let opts = PipelineOptions {
        state_path: state.to_path_buf(),
        continue_on_error,
        ..PipelineOptions::default()
    };
    let outcome = engine::run_pipeline(&svc.api, &svc.store, &svc.governor, rows, opts)?;
    print_pipeline_summary(&outcome, state, state, false);
    if outcome.fully_successful() {
        Ok(0)
    } else if continue_on_error {
        Ok(3)
    } else {
        Ok(1)
    }
}

// ---------------------------------------------------------------------------
// files
// ---------------------------------------------------------------------------

pub fn handle_files_upload(
    svc: &Services,
    local: &Path,
    folder: Option<String>,
    on_conflict: Option<ConflictChoice>,
) -> Result<()> {
    // 上传默认 no-check；显式给出冲突策略时切换为 safe 预检
    let policy = on_conflict.map(|c| ConflictPolicy::fixed("upload", c));
    let check = if policy.is_some() { UploadCheck::Safe } else { svc.config.upload_check };
    let pb = ProgressBar::new(0);
    pb.set_style(crate::util::file_progress_style());
    pb.set_message(local.display().to_string());
    let file_id = upload_file(
        &svc.api,
        &svc.store,
        &svc.governor,
        UploadRequest {
            source: local,
            remote_name: None,
            folder_id: folder,
            check,
            policy: policy.as_ref(),
            max_retries: crate::transfer::DEFAULT_PART_RETRIES,
            progress: Some(pb),
            total_pb: None,
        },
    )?;
    println!("上传完成: {} -> file_id={}", local.display(), file_id);
    Ok(())
}

pub fn handle_files_download(
    svc: &Services,
    file_id: &str,
    out: Option<PathBuf>,
    skip_checksum: bool,
) -> Result<()> {
    let target = match out {
        Some(p) => p,
        None => {
            let meta = svc.api.file_meta(file_id)?;
            crate::util::validate_remote_name(&meta.name)?;
            PathBuf::from(meta.name)
        }
    };
    let pb = ProgressBar::new(0);
    pb.set_style(crate::util::file_progress_style());
    pb.set_message(target.display().to_string());
    let bytes = download_file(
        &svc.api,
        &svc.store,
        &svc.governor,
        DownloadRequest {
            file_id,
            target: &target,
            skip_checksum,
            max_retries: crate::transfer::DEFAULT_PART_RETRIES,
            progress: Some(pb),
            total_pb: None,
        },
    )?;
    println!("下载完成: {} ({} 字节)", target.display(), bytes);
    Ok(())
}

pub fn handle_files_list(svc: &Services, folder: Option<String>) -> Result<()> {
    let entries = svc.api.list_folder(folder.as_deref())?;
    let title = vec![
        "Id".cell().bold(true),
        "Name".cell().bold(true),
        "Type".cell().bold(true),
        "Size".cell().bold(true),
    ];
    let mut table: Vec<Vec<CellStruct>> = Vec::new();
    for e in entries {
        table.push(vec![
            e.id.cell(),
            e.name.cell(),
            if e.is_folder { "folder" } else { "file" }.cell(),
            crate::util::human_bytes(e.size).cell().justify(Justify::Right),
        ]);
    }
    if let Err(e) = print_stdout(table.table().title(title)) {
        eprintln!("⚠️ 无法渲染表格: {}", e);
    }
    Ok(())
}

pub fn handle_files_delete(svc: &Services, file_id: &str) -> Result<()> {
    svc.api.delete_file(file_id)?;
    println!("已删除文件 {}", file_id);
    Ok(())
}

// ---------------------------------------------------------------------------
// folders
// ---------------------------------------------------------------------------

pub fn handle_folders_create(svc: &Services, name: &str, parent: Option<String>) -> Result<()> {
    let id = svc.api.create_folder(name, parent.as_deref())?;
    println!("已创建目录 {} (id={})", name, id);
    Ok(())
}

pub fn handle_folders_list(svc: &Services, parent: Option<String>) -> Result<()> {
    handle_files_list(svc, parent)
}

pub fn handle_folders_delete(svc: &Services, folder_id: &str) -> Result<()> {
    svc.api.delete_folder(folder_id)?;
    println!("已删除目录 {}", folder_id);
    Ok(())
}

/// Create-or-reuse one remote folder; a Conflict means it already exists, so
/// look its id up in the parent listing (merge semantics).
fn ensure_remote_folder(
    api: &dyn ComputeApi,
    name: &str,
    parent: Option<&str>,
) -> Result<String> {
    match api.create_folder(name, parent) {
        Ok(id) => Ok(id),
        Err(e) => {
            let conflict = e
                .downcast_ref::<PilotError>()
                .map(|p| matches!(p, PilotError::Conflict(_)))
                .unwrap_or(false);
            if !conflict {
                return Err(e);
            }
            api.list_folder(parent)?
                .into_iter()
                .find(|entry| entry.is_folder && entry.name == name)
                .map(|entry| entry.id)
                .ok_or_else(|| {
                    PilotError::Fatal(format!("目录 {} 报告已存在但无法找到", name)).into()
                })
        }
    }
}

pub fn handle_folders_upload_dir(
    svc: &Services,
    local: &Path,
    folder: Option<String>,
    include_hidden: bool,
    on_conflict: Option<ConflictChoice>,
) -> Result<()> {
    let tree = treeplan::scan_local(local, include_hidden)?;
    for link in &tree.symlinks {
        eprintln!("⚠️ 跳过符号链接: {}", link.display());
    }

    // 目录结构先行：父目录在子目录之前创建
    let mut dir_ids: HashMap<PathBuf, String> = HashMap::new();
    for dir in &tree.dirs {
        crate::util::check_cancelled()?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| PilotError::Fatal(format!("无效目录项 {}", dir.display())))?;
        let parent_id = match dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => Some(
                dir_ids
                    .get(p)
                    .cloned()
                    .ok_or_else(|| PilotError::Fatal(format!("缺少父目录 {}", p.display())))?,
            ),
            _ => folder.clone(),
        };
        let id = ensure_remote_folder(&svc.api, &name, parent_id.as_deref())?;
        dir_ids.insert(dir.clone(), id);
    }

    // 文件上传：显式策略 -> safe 预检；未给策略按上传默认 no-check
    let policy = on_conflict.map(|c| ConflictPolicy::fixed("upload", c));
    let check = if policy.is_some() { UploadCheck::Safe } else { UploadCheck::Fast };
    let total_bytes: u64 = tree.files.iter().map(|(_, s)| s).sum();
    let total_style = crate::util::total_progress_style();
    let (mp, total_pb, header) = crate::util::init_progress_and_mp(false, total_bytes, &total_style);
    crate::util::set_startup_header(
        &header,
        "UploadDir",
        svc.config.transfer_slots,
        crate::util::get_backoff_ms(),
        crate::transfer::PART_SIZE as usize,
    );

    let (file_tx, file_rx) = unbounded::<(PathBuf, u64)>();
    for f in &tree.files {
        let _ = file_tx.send(f.clone());
    }
    drop(file_tx);
    let (failure_tx, failure_rx) = unbounded::<PilotError>();
    let workers = svc.config.transfer_slots.min(tree.files.len()).max(1);
    let policy_ref = policy.as_ref();
    let dir_ids = &dir_ids;
    let folder_ref = &folder;
    let start = Instant::now();
    let files_total = tree.files.len() as u64;

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let file_rx = file_rx.clone();
            let failure_tx = failure_tx.clone();
            let svc = &*svc;
            let mp = mp.clone();
            let total_pb = total_pb.clone();
            scope.spawn(move || {
                while let Ok((rel, size)) = file_rx.recv() {
                    if crate::util::is_cancelled() {
                        continue;
                    }
                    let parent_folder = match rel.parent() {
                        Some(p) if !p.as_os_str().is_empty() => dir_ids.get(p).cloned(),
                        _ => folder_ref.clone(),
                    };
                    let source = local.join(&rel);
                    let pb = mp.add(ProgressBar::new(size));
                    pb.set_style(crate::util::file_progress_style());
                    pb.set_message(rel.display().to_string());
                    let res = upload_file(
                        &svc.api,
                        &svc.store,
                        &svc.governor,
                        UploadRequest {
                            source: &source,
                            remote_name: None,
                            folder_id: parent_folder,
                            check,
                            policy: policy_ref,
                            max_retries: crate::transfer::DEFAULT_PART_RETRIES,
                            progress: Some(pb.clone()),
                            total_pb: Some(total_pb.clone()),
                        },
                    );
                    pb.finish_and_clear();
                    if let Err(e) = res {
                        let msg = format!("{}: {}", rel.display(), e);
                        let _ = failure_tx.send(PilotError::Transient(msg));
                    }
                }
            });
        }
    });
    drop(failure_tx);
    let failures: Vec<PilotError> = failure_rx.into_iter().collect();
    let _ = mp.clear();
    header.finish_and_clear();
    total_pb.finish_and_clear();
    crate::util::print_transfer_summary(
        total_bytes,
        start.elapsed().as_secs_f64(),
        files_total,
        failures.len() as u64,
    );
    if !failures.is_empty() {
        if let Some(p) = crate::util::write_failures_jsonl(&failures) {
            println!("失败清单已写入: {}", p.display());
        }
        return Err(PilotError::Fatal(format!("{} 个文件上传失败", failures.len())).into());
    }
    crate::util::check_cancelled()?;
    Ok(())
}

pub fn handle_folders_download_dir(
    svc: &Services,
    folder_id: &str,
    out: &Path,
    on_conflict: Option<ConflictChoice>,
) -> Result<()> {
    let tree = treeplan::scan_remote(&svc.api, folder_id)?;
    let (paths, warnings) = treeplan::collision_safe_paths(&tree.files, out)?;
    for w in &warnings {
        eprintln!("⚠️ {}", w);
    }
    for dir in &tree.folders {
        std::fs::create_dir_all(out.join(dir))
            .map_err(|e| PilotError::from_io(&e, "创建本地目录"))?;
    }

    let policy = match on_conflict {
        Some(c) => ConflictPolicy::fixed("download", c),
        None => ConflictPolicy::interactive("download")?,
    };

    let total_bytes: u64 = tree.files.iter().map(|f| f.size).sum();
    let total_style = crate::util::total_progress_style();
    let (mp, total_pb, header) = crate::util::init_progress_and_mp(false, total_bytes, &total_style);
    crate::util::set_startup_header(
        &header,
        "DownloadDir",
        svc.config.transfer_slots,
        crate::util::get_backoff_ms(),
        crate::transfer::PART_SIZE as usize,
    );

    let (file_tx, file_rx) = unbounded::<treeplan::RemoteTreeFile>();
    for f in &tree.files {
        let _ = file_tx.send(f.clone());
    }
    drop(file_tx);
    let (failure_tx, failure_rx) = unbounded::<PilotError>();
    let workers = svc.config.transfer_slots.min(tree.files.len()).max(1);
    let policy = &policy;
    let paths = &paths;
    let start = Instant::now();
    let files_total = tree.files.len() as u64;

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let file_rx = file_rx.clone();
            let failure_tx = failure_tx.clone();
            let svc = &*svc;
            let mp = mp.clone();
            let total_pb = total_pb.clone();
            scope.spawn(move || {
                while let Ok(f) = file_rx.recv() {
                    if crate::util::is_cancelled() {
                        continue;
                    }
                    let target = &paths[&f.id];
                    if target.exists() {
                        match policy.decide(&f.rel_path) {
                            Ok(ConflictAction::Skip) | Ok(ConflictAction::Merge) => {
                                total_pb.inc(f.size);
                                continue;
                            }
                            Ok(ConflictAction::Overwrite) => {
                                let _ = std::fs::remove_file(target);
                            }
                            Ok(ConflictAction::Resume) => {}
                            Ok(ConflictAction::Abort) | Err(_) => {
                                let _ = failure_tx.send(PilotError::Cancelled);
                                continue;
                            }
                        }
                    }
                    let pb = mp.add(ProgressBar::new(0));
                    pb.set_style(crate::util::file_progress_style());
                    pb.set_message(f.rel_path.clone());
                    let res = download_file(
                        &svc.api,
                        &svc.store,
                        &svc.governor,
                        DownloadRequest {
                            file_id: &f.id,
                            target,
                            skip_checksum: false,
                            max_retries: crate::transfer::DEFAULT_PART_RETRIES,
                            progress: Some(pb.clone()),
                            total_pb: Some(total_pb.clone()),
                        },
                    );
                    pb.finish_and_clear();
                    if let Err(e) = res {
                        let _ = failure_tx
                            .send(PilotError::Transient(format!("{}: {}", f.rel_path, e)));
                    }
                }
            });
        }
    });
    drop(failure_tx);
    let failures: Vec<PilotError> = failure_rx.into_iter().collect();
    let _ = mp.clear();
    header.finish_and_clear();
    total_pb.finish_and_clear();
    crate::util::print_transfer_summary(
        total_bytes,
        start.elapsed().as_secs_f64(),
        files_total,
        failures.len() as u64,
    );
    if !failures.is_empty() {
        if let Some(p) = crate::util::write_failures_jsonl(&failures) {
            println!("失败清单已写入: {}", p.display());
        }
        return Err(PilotError::Fatal(format!("{} 个文件下载失败", failures.len())).into());
    }
    crate::util::check_cancelled()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

pub fn handle_jobs_list(svc: &Services, name_prefix: Option<String>) -> Result<()> {
    let jobs = svc.api.list_jobs()?;
    let title =
        vec!["Id".cell().bold(true), "Name".cell().bold(true), "Status".cell().bold(true)];
    let mut table: Vec<Vec<CellStruct>> = Vec::new();
    for j in jobs {
        if let Some(p) = &name_prefix
            && !j.name.starts_with(p.as_str())
        {
            continue;
        }
        table.push(vec![j.id.cell(), j.name.cell(), j.status.cell()]);
    }
    if let Err(e) = print_stdout(table.table().title(title)) {
        eprintln!("⚠️ 无法渲染表格: {}", e);
    }
    Ok(())
}

pub fn handle_jobs_get(svc: &Services, job_id: &str) -> Result<()> {
    let job = svc.api.get_job(job_id)?;
    println!("id: {}\nname: {}\nstatus: {}", job.id, job.name, job.status);
    Ok(())
}

pub fn handle_jobs_submit(svc: &Services, job_id: &str) -> Result<()> {
    svc.api.submit_job(job_id)?;
    println!("已提交任务 {}", job_id);
    Ok(())
}

pub fn handle_jobs_stop(svc: &Services, job_id: &str) -> Result<()> {
    svc.api.stop_job(job_id)?;
    println!("已请求停止任务 {}", job_id);
    Ok(())
}

pub fn handle_jobs_delete(svc: &Services, job_id: &str) -> Result<()> {
    svc.api.delete_job(job_id)?;
    println!("已删除任务 {}", job_id);
    Ok(())
}

pub fn handle_jobs_listfiles(svc: &Services, job_id: &str) -> Result<()> {
    let files = svc.api.job_output_files(job_id)?;
    let title = vec![
        "Id".cell().bold(true),
        "Path".cell().bold(true),
        "Size".cell().bold(true),
    ];
    let mut table: Vec<Vec<CellStruct>> = Vec::new();
    for f in files {
        let path = if f.rel_path.is_empty() { f.name.clone() } else { f.rel_path.clone() };
        table.push(vec![
            f.id.cell(),
            path.cell(),
            crate::util::human_bytes(f.size).cell().justify(Justify::Right),
        ]);
    }
    if let Err(e) = print_stdout(table.table().title(title)) {
        eprintln!("⚠️ 无法渲染表格: {}", e);
    }
    Ok(())
}

pub fn handle_jobs_download(
    svc: &Services,
    job_id: &str,
    out: &Path,
    skip_checksum: bool,
) -> Result<()> {
    let (files, bytes, location) = crate::daemon::download_job_outputs(
        &svc.api,
        &svc.store,
        &svc.governor,
        job_id,
        out,
        skip_checksum,
        crate::transfer::DEFAULT_PART_RETRIES,
    )?;
    println!("已下载 {} 个文件（{}）到 {}", files, crate::util::human_bytes(bytes), location);
    Ok(())
}

pub fn handle_jobs_tail(
    svc: &Services,
    job_id: &str,
    file_name: &str,
    interval_secs: u64,
) -> Result<()> {
    let mut offset = 0u64;
    let interval = std::time::Duration::from_secs(interval_secs.max(1));
    loop {
        crate::util::check_cancelled()?;
        match svc.api.tail_file(job_id, file_name, offset) {
            Ok((chunk, new_offset)) => {
                if !chunk.is_empty() {
                    print!("{}", chunk);
                    use std::io::Write as _;
                    let _ = std::io::stdout().flush();
                }
                offset = new_offset;
            }
            Err(e) => {
                // 输出文件可能尚未产生；瞬时错误继续轮询
                let transient = e
                    .downcast_ref::<PilotError>()
                    .map(|p| p.is_transient())
                    .unwrap_or(false);
                if !transient {
                    return Err(e);
                }
            }
        }
        let job = svc.api.get_job(job_id)?;
        if matches!(job.status.as_str(), "Completed" | "Failed" | "Stopped") {
            println!();
            println!("任务 {} 已结束: {}", job_id, job.status);
            return Ok(());
        }
        std::thread::sleep(interval);
    }
}

// ---------------------------------------------------------------------------
// daemon
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn handle_daemon_run(
    svc: &Services,
    interval: u64,
    name_prefix: Option<String>,
    name_contains: Option<String>,
    name_exclude: Option<String>,
    output_root: PathBuf,
) -> Result<()> {
    let opts = crate::daemon::DaemonOptions {
        interval_secs: interval,
        name_prefix,
        name_contains,
        name_exclude,
        output_root,
        journal_path: svc.config.state_dir().join("daemon.db"),
        max_retries: crate::transfer::DEFAULT_PART_RETRIES,
    };
    crate::daemon::run(&svc.api, &svc.store, &svc.governor, opts)
}

pub fn handle_daemon_status() -> Result<()> {
    match crate::daemon::control(&crate::daemon::ControlRequest::Status)? {
        crate::daemon::ControlReply::Status { paused, polls, downloaded, failed, last_poll } => {
            println!(
                "daemon: {} | 轮询 {} 次 | 下载成功 {} | 失败 {} | 上次轮询 {}",
                if paused { "已暂停" } else { "运行中" },
                polls,
                downloaded,
                failed,
                if last_poll.is_empty() { "-".to_string() } else { last_poll }
            );
        }
        other => println!("意外响应: {:?}", other),
    }
    Ok(())
}

pub fn handle_daemon_simple(req: crate::daemon::ControlRequest, done_msg: &str) -> Result<()> {
    crate::daemon::control(&req)?;
    println!("{}", done_msg);
    Ok(())
}

pub fn handle_daemon_list(config: &Config) -> Result<()> {
    let journal = crate::daemon::DaemonJournal::open(config.state_dir().join("daemon.db"))?;
    let entries = journal.list()?;
    crate::daemon::show_journal_table(&entries);
    Ok(())
}

pub fn handle_daemon_retry(config: &Config, job_id: &str) -> Result<()> {
    let journal = crate::daemon::DaemonJournal::open(config.state_dir().join("daemon.db"))?;
    if journal.mark_retry(job_id)? {
        println!("任务 {} 已标记为重试，下个轮询周期将重新下载", job_id);
    } else {
        println!("任务 {} 不存在失败记录，未做修改", job_id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// coordinator (hidden)
// ---------------------------------------------------------------------------

pub fn handle_coordinator_run() -> Result<()> {
    crate::ratelimit::server::run(crate::ratelimit::server::CoordinatorOptions::default())
}

pub fn handle_coordinator_state() -> Result<()> {
    let mut client = crate::ratelimit::client::LeaseClient::new();
    match client.state()? {
        crate::ratelimit::proto::Reply::State { uptime_ms, buckets, active_leases } => {
            println!("协调器已运行 {:.1}s | 活跃租约 {}", uptime_ms as f64 / 1000.0, active_leases);
            for b in buckets {
                println!(
                    "  bucket {}: tokens={:.2} cooldown={}ms clients={}",
                    b.name, b.tokens, b.cooldown_remain_ms, b.active_clients
                );
            }
        }
        other => println!("意外响应: {:?}", other),
    }
    Ok(())
}

pub fn handle_coordinator_stop() -> Result<()> {
    let mut client = crate::ratelimit::client::LeaseClient::new();
    client.shutdown()?;
    println!("协调器已关闭");
    Ok(())
}
