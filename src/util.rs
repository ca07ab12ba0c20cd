use anyhow::Result;
use chrono::Utc;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded (or platform likely already supports ANSI), false otherwise.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

// On non-Windows platforms ANSI support is typically available by default;
// provide a no-op fallback to avoid referencing the optional crate.
#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    false
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

// ---------------------------------------------------------------------------
// cancellation
// ---------------------------------------------------------------------------

// Process-wide cooperative cancel flag. Workers check it at every suspension
// point (queue recv, HTTP call, chunk IO) and unwind without rollback.
static CANCELLED: AtomicBool = AtomicBool::new(false);

/// Install the Ctrl-C handler exactly once per process. Safe to call from
/// every command entry; later calls are no-ops.
pub fn install_cancel_handler() {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = ctrlc::set_handler(|| {
        CANCELLED.store(true, Ordering::SeqCst);
        eprintln!("收到中断信号，正在停止接收新任务……（再次 Ctrl-C 强制退出）");
    });
}

pub fn is_cancelled() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// Cancellation checkpoint; returns `PilotError::Cancelled` when the flag is set.
pub fn check_cancelled() -> Result<()> {
    if is_cancelled() { Err(crate::PilotError::Cancelled.into()) } else { Ok(()) }
}

// ---------------------------------------------------------------------------
// progress
// ---------------------------------------------------------------------------

/// Initialize a MultiProgress and a total ProgressBar plus a header spinner ProgressBar.
/// The header bar is used to display a single-line startup summary above the total progress.
pub fn init_progress_and_mp(
    verbose: bool,
    total: u64,
    total_style: &ProgressStyle,
) -> (Arc<MultiProgress>, ProgressBar, ProgressBar) {
    let mp = Arc::new(if verbose {
        MultiProgress::with_draw_target(ProgressDrawTarget::stdout())
    } else {
        MultiProgress::new()
    });
    let header = mp.add(ProgressBar::new_spinner());
    header.set_style(ProgressStyle::with_template("{msg}").expect("valid header template"));
    let total_pb = mp.add(ProgressBar::new(total));
    total_pb.set_style(total_style.clone());
    let _ = try_enable_ansi_on_windows();
    (mp, total_pb, header)
}

/// Shared total/per-file progress bar styles used by upload, download and
/// the pipeline engine.
pub fn total_progress_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
    .expect("valid total template")
    .progress_chars("=> ")
}

pub fn file_progress_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
    .expect("valid file template")
    .progress_chars("=> ")
}

/// Populate and set the startup header message above the total progress bar.
/// Fields are: Action, Workers, Backoff, Part — each aligned and separated by 4 spaces.
pub fn set_startup_header(
    header: &ProgressBar,
    action: &str,
    worker_count: usize,
    backoff_ms: u64,
    part_size: usize,
) {
    let part_hr = human_bytes(part_size as u64);
    let action_field = format!("{:<12}", format!("Action:{}", action));
    let conc_field = format!("{:<12}", format!("Worker:{}", worker_count));
    let backoff_field = format!("{:<14}", format!("Backoff:{}ms", backoff_ms));
    let part_field = format!("{:<12}", format!("Part:{}", part_hr));
    let mut header_msg =
        format!("{}    {}    {}    {}", action_field, conc_field, backoff_field, part_field);
    if try_enable_ansi_on_windows() {
        let action_col = action_field.green();
        let conc_col = conc_field.cyan();
        let back_col = backoff_field.yellow();
        let part_col = part_field.magenta();
        header_msg = format!("{}    {}    {}    {}", action_col, conc_col, back_col, part_col);
    }
    header.set_message(header_msg);
}

/// Print a concise transfer summary line.
pub fn print_transfer_summary(total_bytes: u64, elapsed_secs: f64, files: u64, failures: u64) {
    if elapsed_secs > 0.0 {
        let mb = total_bytes as f64 / 1024.0 / 1024.0;
        println!(
            "平均速率: {:.2} MB/s (传输 {} 字节, 耗时 {:.2} 秒, {} 文件) | 失败: {}",
            mb / elapsed_secs,
            total_bytes,
            elapsed_secs,
            files,
            failures
        );
    } else {
        println!("平均速率: 0.00 MB/s ({} 文件) | 失败: {}", files, failures);
    }
}

// ---------------------------------------------------------------------------
// failure ledger
// ---------------------------------------------------------------------------

// Canonical logs directory, registered once at startup so worker failures can
// always be written even when commands never touch the config again.
static FAILURE_DIR: std::sync::OnceLock<PathBuf> = std::sync::OnceLock::new();

pub fn init_failure_dir(dir: PathBuf) {
    let _ = FAILURE_DIR.set(dir);
}

/// Write structured failures as JSON Lines into the canonical logs directory.
/// Returns the file path on success so callers can point the user at it.
pub fn write_failures_jsonl(failures: &[crate::PilotError]) -> Option<PathBuf> {
    if failures.is_empty() {
        return None;
    }
    let dir = FAILURE_DIR.get()?.clone();
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join(format!("failures-{}.jsonl", Utc::now().format("%Y%m%dT%H%M%SZ")));
    let mut f = OpenOptions::new().create(true).append(true).open(&path).ok()?;
    for err in failures {
        let obj = serde_json::json!({
            "kind": err.kind(),
            "message": err.to_string(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(f, "{}", line);
        }
    }
    Some(path)
}

// ---------------------------------------------------------------------------
// retry / backoff
// ---------------------------------------------------------------------------

// Default backoff base in milliseconds. Can be adjusted at runtime via `set_backoff_ms`.
static BACKOFF_BASE_MS: AtomicU64 = AtomicU64::new(100);

pub fn set_backoff_ms(ms: u64) {
    BACKOFF_BASE_MS.store(ms, Ordering::SeqCst);
}

pub fn get_backoff_ms() -> u64 {
    BACKOFF_BASE_MS.load(Ordering::SeqCst)
}

/// Exponential backoff for 1-based attempt numbers, capped at 30 s.
pub fn compute_backoff_ms(base: u64, attempt: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(16) as u32;
    base.saturating_mul(1u64 << shift).min(30_000)
}

/// Generic retry helper used by transfer workers, the API client and tests.
/// Retries only errors classified transient; everything else surfaces at once.
/// Checks the cancel flag between attempts.
pub fn retry_transient<F, T>(max_retries: usize, ctx: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=max_retries.max(1) {
        check_cancelled()?;
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                let transient = e
                    .downcast_ref::<crate::PilotError>()
                    .map(|pe| pe.is_retriable_during_transfer())
                    .unwrap_or(false);
                if !transient || attempt == max_retries.max(1) {
                    if transient {
                        tracing::debug!("[retry] {}: 第 {} 次后放弃: {}", ctx, attempt, e);
                    }
                    return Err(e);
                }
                let wait = compute_backoff_ms(get_backoff_ms(), attempt as u64);
                tracing::debug!("[retry] {}: 第 {} 次失败，{}ms 后重试: {}", ctx, attempt, wait, e);
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(wait));
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| crate::PilotError::Fatal("retry loop exhausted".to_string()).into()))
}

// ---------------------------------------------------------------------------
// filesystem
// ---------------------------------------------------------------------------

/// Atomic write: write to `<path>.tmp` in the same directory, fsync, rename.
/// A crash leaves either the old or the new content, never a torn file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => path.with_file_name(format!("{}.tmp", name)),
        None => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("无效目标路径: {}", path.display()),
            ));
        }
    };
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Validate a file name delivered by the remote: no path separators, no
/// parent components, non-empty. Anything else is a traversal attempt.
pub fn validate_remote_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(crate::PilotError::Validation(format!("非法远端文件名: {:?}", name)).into());
    }
    Ok(())
}

/// Validate a relative path for recursive downloads: every component must be
/// a normal name so the result stays inside the output root.
pub fn validate_remote_rel_path(rel: &str) -> Result<()> {
    if rel.is_empty() {
        return Err(crate::PilotError::Validation("空的远端相对路径".to_string()).into());
    }
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(crate::PilotError::Validation(format!("远端路径为绝对路径: {}", rel)).into());
    }
    for comp in p.components() {
        match comp {
            std::path::Component::Normal(_) => {}
            _ => {
                return Err(crate::PilotError::Validation(format!(
                    "远端路径包含非法成分: {}",
                    rel
                ))
                .into());
            }
        }
    }
    Ok(())
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
