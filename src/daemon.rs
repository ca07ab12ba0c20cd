// Completion daemon: a long-lived loop that polls the remote for finished
// jobs matching the name filters, downloads their outputs and journals every
// result in SQLite so a job is never fetched twice. A small framed-JSON
// control socket lets sibling invocations query, pause, resume and stop it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::PilotError;
use crate::api::ComputeApi;
use crate::ratelimit::proto::{read_frame, write_frame};
use crate::transfer::download::{DownloadRequest, download_file};
use crate::transfer::store::StoreLike;
use crate::transfer::TransferGovernor;
use crate::treeplan::{RemoteTreeFile, collision_safe_paths};

const CONTROL_ENDPOINT: &str = "daemon";
pub const MIN_INTERVAL_SECS: u64 = 30;
pub const MAX_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub interval_secs: u64,
    pub name_prefix: Option<String>,
    pub name_contains: Option<String>,
    pub name_exclude: Option<String>,
    pub output_root: PathBuf,
    pub journal_path: PathBuf,
    pub max_retries: usize,
}

impl DaemonOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS))
    }

    /// The daemon's job filter: prefix, contains and exclude all apply.
    pub fn matches(&self, job_name: &str) -> bool {
        if let Some(p) = &self.name_prefix
            && !job_name.starts_with(p.as_str())
        {
            return false;
        }
        if let Some(c) = &self.name_contains
            && !job_name.contains(c.as_str())
        {
            return false;
        }
        if let Some(x) = &self.name_exclude
            && job_name.contains(x.as_str())
        {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub job_id: String,
    pub job_name: String,
    pub status: String,
    pub files: u64,
    pub bytes: u64,
    pub location: String,
    pub error: String,
    pub retry_allowed: bool,
    pub completed_at: String,
}

/// SQLite-backed download journal. Single writer (the daemon), readers are
/// the `daemon ls` / `daemon retry` commands.
pub struct DaemonJournal {
    conn: Connection,
}

impl DaemonJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).with_context(|| "打开下载日志数据库失败")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS downloads (
                job_id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                status TEXT NOT NULL,
                files INTEGER NOT NULL DEFAULT 0,
                bytes INTEGER NOT NULL DEFAULT 0,
                location TEXT NOT NULL DEFAULT '',
                error TEXT NOT NULL DEFAULT '',
                retry_allowed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT NOT NULL
            )",
            [],
        )
        .with_context(|| "创建下载日志表失败")?;
        Ok(DaemonJournal { conn })
    }

    /// None when the job was never journaled; otherwise its status
    /// ("success" | "failed" | "retry").
    pub fn status_of(&self, job_id: &str) -> anyhow::Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM downloads WHERE job_id = ?1")
            .with_context(|| "查询下载日志失败")?;
        let mut rows = stmt.query(params![job_id]).with_context(|| "查询下载日志失败")?;
        match rows.next().with_context(|| "读取下载日志行失败")? {
            Some(row) => Ok(Some(row.get(0).with_context(|| "读取状态列失败")?)),
            None => Ok(None),
        }
    }

    pub fn record_success(
        &self,
        job_id: &str,
        job_name: &str,
        files: u64,
        bytes: u64,
        location: &str,
    ) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO downloads
                 (job_id, job_name, status, files, bytes, location, error, retry_allowed, completed_at)
                 VALUES (?1, ?2, 'success', ?3, ?4, ?5, '', 0, ?6)",
                params![
                    job_id,
                    job_name,
                    files as i64,
                    bytes as i64,
                    location,
                    crate::util::now_rfc3339()
                ],
            )
            .with_context(|| "写入下载日志失败")?;
        Ok(())
    }

    pub fn record_failure(
        &self,
        job_id: &str,
        job_name: &str,
        error: &str,
        retry_allowed: bool,
    ) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO downloads
                 (job_id, job_name, status, files, bytes, location, error, retry_allowed, completed_at)
                 VALUES (?1, ?2, 'failed', 0, 0, '', ?3, ?4, ?5)",
                params![
                    job_id,
                    job_name,
                    error,
                    retry_allowed as i64,
                    crate::util::now_rfc3339()
                ],
            )
            .with_context(|| "写入下载日志失败")?;
        Ok(())
    }

    /// Flip a failed entry back to retry; the next poll picks it up.
    pub fn mark_retry(&self, job_id: &str) -> anyhow::Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE downloads SET status = 'retry' WHERE job_id = ?1 AND status = 'failed'",
                params![job_id],
            )
            .with_context(|| "更新下载日志失败")?;
        Ok(n > 0)
    }

    pub fn list(&self) -> anyhow::Result<Vec<JournalEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT job_id, job_name, status, files, bytes, location, error, retry_allowed, completed_at
                 FROM downloads ORDER BY completed_at DESC",
            )
            .with_context(|| "查询下载日志失败")?;
        let iter = stmt
            .query_map([], |row| {
                Ok(JournalEntry {
                    job_id: row.get(0)?,
                    job_name: row.get(1)?,
                    status: row.get(2)?,
                    files: row.get::<_, i64>(3)? as u64,
                    bytes: row.get::<_, i64>(4)? as u64,
                    location: row.get(5)?,
                    error: row.get(6)?,
                    retry_allowed: row.get::<_, i64>(7)? != 0,
                    completed_at: row.get(8)?,
                })
            })
            .with_context(|| "读取下载日志失败")?;
        let mut out = Vec::new();
        for e in iter {
            out.push(e.with_context(|| "读取下载日志行失败")?);
        }
        Ok(out)
    }
}

pub fn show_journal_table(entries: &[JournalEntry]) {
    if entries.is_empty() {
        println!("下载日志为空");
        return;
    }
    let title = vec![
        "Job".cell().bold(true),
        "Name".cell().bold(true),
        "Status".cell().bold(true),
        "Files".cell().bold(true),
        "Bytes".cell().bold(true),
        "Location".cell().bold(true),
        "At".cell().bold(true),
    ];
    let mut table: Vec<Vec<CellStruct>> = Vec::new();
    for e in entries {
        table.push(vec![
            e.job_id.clone().cell(),
            e.job_name.clone().cell(),
            e.status.clone().cell(),
            e.files.cell().justify(Justify::Right),
            crate::util::human_bytes(e.bytes).cell().justify(Justify::Right),
            if e.error.is_empty() { e.location.clone() } else { e.error.clone() }.cell(),
            e.completed_at.clone().cell(),
        ]);
    }
    if let Err(e) = print_stdout(table.table().title(title)) {
        eprintln!("⚠️ 无法渲染表格: {}", e);
    }
}

// ---------------------------------------------------------------------------
// control surface
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Pause,
    Resume,
    Stop,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlReply {
    Ok,
    Status { paused: bool, polls: u64, downloaded: u64, failed: u64, last_poll: String },
}

struct DaemonShared {
    paused: AtomicBool,
    stop: AtomicBool,
    polls: AtomicU64,
    downloaded: AtomicU64,
    failed: AtomicU64,
    last_poll: std::sync::Mutex<String>,
}

fn spawn_control_listener(shared: Arc<DaemonShared>) -> anyhow::Result<()> {
    let listener = crate::ratelimit::listen_named(CONTROL_ENDPOINT)
        .map_err(|e| PilotError::from_io(&e, "绑定守护进程控制端点"))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| PilotError::from_io(&e, "设置控制端点非阻塞"))?;
    std::thread::spawn(move || {
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
                    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
                    let req: ControlRequest = match read_frame(&mut stream) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let reply = match req {
                        ControlRequest::Status => ControlReply::Status {
                            paused: shared.paused.load(Ordering::SeqCst),
                            polls: shared.polls.load(Ordering::SeqCst),
                            downloaded: shared.downloaded.load(Ordering::SeqCst),
                            failed: shared.failed.load(Ordering::SeqCst),
                            last_poll: shared
                                .last_poll
                                .lock()
                                .map(|s| s.clone())
                                .unwrap_or_default(),
                        },
                        ControlRequest::Pause => {
                            shared.paused.store(true, Ordering::SeqCst);
                            ControlReply::Ok
                        }
                        ControlRequest::Resume => {
                            shared.paused.store(false, Ordering::SeqCst);
                            ControlReply::Ok
                        }
                        ControlRequest::Stop => {
                            shared.stop.store(true, Ordering::SeqCst);
                            ControlReply::Ok
                        }
                    };
                    let _ = write_frame(&mut stream, &reply);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(_) => std::thread::sleep(Duration::from_millis(200)),
            }
        }
        crate::ratelimit::remove_named_endpoint(CONTROL_ENDPOINT);
    });
    Ok(())
}

/// Send one control request to a running daemon.
pub fn control(req: &ControlRequest) -> anyhow::Result<ControlReply> {
    let mut stream = crate::ratelimit::connect_named(CONTROL_ENDPOINT, Duration::from_secs(2))
        .map_err(|e| PilotError::Transient(format!("守护进程未运行或不可达: {}", e)))?;
    write_frame(&mut stream, req)?;
    read_frame(&mut stream)
}

// ---------------------------------------------------------------------------
// poll loop
// ---------------------------------------------------------------------------

/// Run the daemon loop in the foreground until `daemon stop` or Ctrl-C.
pub fn run(
    api: &dyn ComputeApi,
    store: &dyn StoreLike,
    governor: &Arc<TransferGovernor>,
    opts: DaemonOptions,
) -> anyhow::Result<()> {
    // 同一用户只允许一个守护进程；已有实例时绑定端点会把它踢下线
    if control(&ControlRequest::Status).is_ok() {
        return Err(PilotError::Validation(
            "守护进程已在运行（jp daemon status 查看）".to_string(),
        )
        .into());
    }
    let journal = DaemonJournal::open(&opts.journal_path)?;
    let shared = Arc::new(DaemonShared {
        paused: AtomicBool::new(false),
        stop: AtomicBool::new(false),
        polls: AtomicU64::new(0),
        downloaded: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        last_poll: std::sync::Mutex::new(String::new()),
    });
    spawn_control_listener(shared.clone())?;
    let interval = opts.poll_interval();
    tracing::info!(
        "[daemon] 启动: 轮询间隔 {}s, 输出目录 {}",
        interval.as_secs(),
        opts.output_root.display()
    );

    loop {
        if shared.stop.load(Ordering::SeqCst) || crate::util::is_cancelled() {
            break;
        }
        if !shared.paused.load(Ordering::SeqCst) {
            shared.polls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut lp) = shared.last_poll.lock() {
                *lp = crate::util::now_rfc3339();
            }
            match poll_once(api, store, governor, &opts, &journal) {
                Ok((ok, bad)) => {
                    shared.downloaded.fetch_add(ok, Ordering::SeqCst);
                    shared.failed.fetch_add(bad, Ordering::SeqCst);
                }
                Err(e) => {
                    if e.downcast_ref::<PilotError>() == Some(&PilotError::Cancelled) {
                        break;
                    }
                    // 单轮失败不终止守护进程
                    tracing::warn!("[daemon] 本轮轮询失败: {}", e);
                }
            }
        }
        // interruptible sleep
        let mut slept = Duration::ZERO;
        while slept < interval {
            if shared.stop.load(Ordering::SeqCst) || crate::util::is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_secs(1));
            slept += Duration::from_secs(1);
        }
    }
    shared.stop.store(true, Ordering::SeqCst);
    tracing::info!("[daemon] 已退出");
    Ok(())
}

/// One poll: list jobs, filter, download outputs of newly completed jobs.
/// Returns (succeeded, failed) counts for this round.
pub fn poll_once(
    api: &dyn ComputeApi,
    store: &dyn StoreLike,
    governor: &Arc<TransferGovernor>,
    opts: &DaemonOptions,
    journal: &DaemonJournal,
) -> anyhow::Result<(u64, u64)> {
    let jobs = api.list_jobs()?;
    let mut ok = 0u64;
    let mut bad = 0u64;
    for job in jobs {
        crate::util::check_cancelled()?;
        if job.status != "Completed" || !opts.matches(&job.name) {
            continue;
        }
        match journal.status_of(&job.id)? {
            Some(s) if s == "success" || s == "failed" => continue,
            // None 或 'retry' 均进入下载
            _ => {}
        }
        let out_dir = opts.output_root.join(&job.name);
        match download_job_outputs(api, store, governor, &job.id, &out_dir, false, opts.max_retries)
        {
            Ok((files, bytes, location)) => {
                journal.record_success(&job.id, &job.name, files, bytes, &location)?;
                tracing::info!(
                    "[daemon] {} 下载完成: {} 个文件 {} 字节 -> {}",
                    job.name,
                    files,
                    bytes,
                    location
                );
                ok += 1;
            }
            Err(e) => {
                if e.downcast_ref::<PilotError>() == Some(&PilotError::Cancelled) {
                    return Err(e);
                }
                let retry_allowed = e
                    .downcast_ref::<PilotError>()
                    .map(|p| p.is_transient())
                    .unwrap_or(false);
                journal.record_failure(&job.id, &job.name, &e.to_string(), retry_allowed)?;
                tracing::warn!("[daemon] {} 下载失败: {}", job.name, e);
                bad += 1;
            }
        }
    }
    Ok((ok, bad))
}

/// Download every output file of one job into `out_dir`, with collision-safe
/// paths. Shared with `jobs download`. Returns (files, bytes, location).
pub fn download_job_outputs(
    api: &dyn ComputeApi,
    store: &dyn StoreLike,
    governor: &Arc<TransferGovernor>,
    job_id: &str,
    out_dir: &Path,
    skip_checksum: bool,
    max_retries: usize,
) -> anyhow::Result<(u64, u64, String)> {
    let outputs = api.job_output_files(job_id)?;
    let files: Vec<RemoteTreeFile> = outputs
        .iter()
        .map(|f| RemoteTreeFile {
            id: f.id.clone(),
            name: f.name.clone(),
            rel_path: if f.rel_path.is_empty() { f.name.clone() } else { f.rel_path.clone() },
            size: f.size,
        })
        .collect();
    let (paths, warnings) = collision_safe_paths(&files, out_dir)?;
    for w in &warnings {
        tracing::warn!("[daemon] {}", w);
        eprintln!("⚠️ {}", w);
    }
    let mut bytes = 0u64;
    for f in &files {
        let target = &paths[&f.id];
        let req = DownloadRequest {
            file_id: &f.id,
            target,
            skip_checksum,
            max_retries,
            progress: None,
            total_pb: None,
        };
        bytes += download_file(api, store, governor, req)?;
    }
    Ok((files.len() as u64, bytes, out_dir.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(dir: &Path) -> DaemonOptions {
        DaemonOptions {
            interval_secs: 60,
            name_prefix: Some("Sim".to_string()),
            name_contains: None,
            name_exclude: None,
            output_root: dir.join("downloads"),
            journal_path: dir.join("daemon.db"),
            max_retries: 1,
        }
    }

    #[test]
    fn interval_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = opts(dir.path());
        o.interval_secs = 1;
        assert_eq!(o.poll_interval(), Duration::from_secs(MIN_INTERVAL_SECS));
        o.interval_secs = 999_999;
        assert_eq!(o.poll_interval(), Duration::from_secs(MAX_INTERVAL_SECS));
    }

    #[test]
    fn name_filters_compose() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = opts(dir.path());
        o.name_contains = Some("42".to_string());
        o.name_exclude = Some("tmp".to_string());
        assert!(o.matches("Sim_42"));
        assert!(!o.matches("Sim_41"));
        assert!(!o.matches("Other_42"));
        assert!(!o.matches("Sim_42_tmp"));
    }

    #[test]
    fn journal_roundtrip_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let j = DaemonJournal::open(dir.path().join("daemon.db")).unwrap();
        assert_eq!(j.status_of("J1").unwrap(), None);

        j.record_success("J1", "Sim_1", 3, 12345, "downloads/Sim_1").unwrap();
        assert_eq!(j.status_of("J1").unwrap().as_deref(), Some("success"));

        j.record_failure("J2", "Sim_2", "网络错误", true).unwrap();
        assert_eq!(j.status_of("J2").unwrap().as_deref(), Some("failed"));

        // retry flips failed entries only
        assert!(j.mark_retry("J2").unwrap());
        assert!(!j.mark_retry("J1").unwrap());
        assert_eq!(j.status_of("J2").unwrap().as_deref(), Some("retry"));

        let entries = j.list().unwrap();
        assert_eq!(entries.len(), 2);
        let e1 = entries.iter().find(|e| e.job_id == "J1").unwrap();
        assert_eq!(e1.files, 3);
        assert_eq!(e1.bytes, 12345);
    }
}
