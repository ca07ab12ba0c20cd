// The scheduler. Rows advance TAR -> UPLOAD -> CREATE -> SUBMIT through
// three bounded worker pools (tar, upload, job) wired with channels; every
// transition is persisted through the single state writer, so killing the
// process at any point leaves a journal the next run can resume from.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, unbounded};
use indicatif::{MultiProgress, ProgressBar};

use super::rows::JobRow;
use super::state::{RowState, Stage, StageStatus, StateWriter, read_state_file};
use crate::PilotError;
use crate::api::{ComputeApi, JobSpec};
use crate::archive::{self, ArchiveOptions};
use crate::transfer::store::StoreLike;
use crate::transfer::upload::{UploadRequest, upload_file};
use crate::transfer::TransferGovernor;

#[derive(Clone)]
pub struct PipelineOptions {
    pub state_path: PathBuf,
    pub tar_workers: usize,
    pub upload_workers: usize,
    pub job_workers: usize,
    pub continue_on_error: bool,
    pub rm_tar_on_success: bool,
    pub archive: ArchiveOptions,
    pub dest_folder_id: Option<String>,
    pub max_retries: usize,
    /// Suppress progress bars (machine output modes).
    pub quiet: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            state_path: PathBuf::from("pur-state.csv"),
            tar_workers: 2,
            upload_workers: 3,
            job_workers: 4,
            continue_on_error: false,
            rm_tar_on_success: false,
            archive: ArchiveOptions::default(),
            dest_folder_id: None,
            max_retries: crate::transfer::DEFAULT_PART_RETRIES,
            quiet: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StageCounts {
    pub success: u32,
    pub failed: u32,
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub rows_total: u32,
    pub skipped_done: u32,
    pub tar: StageCounts,
    pub upload: StageCounts,
    pub create: StageCounts,
    pub submit: StageCounts,
    pub failures: Vec<(u32, String, String)>,
    pub elapsed_secs: f64,
}

impl PipelineOutcome {
    pub fn fully_successful(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PlannedRow {
    pub index: u32,
    pub name: String,
    /// None when every stage is already successful.
    pub next: Option<Stage>,
    pub pending_bytes: u64,
}

/// Compute the dry-run plan: per row, the stage a run would start at and the
/// bytes still to transfer. Makes no remote calls.
pub fn plan(rows: &[JobRow], existing: &[RowState]) -> Vec<PlannedRow> {
    let by_index: HashMap<u32, &RowState> = existing.iter().map(|r| (r.index, r)).collect();
    rows.iter()
        .map(|row| {
            let entry = entry_stage(row);
            let state = by_index.get(&row.index);
            let next = match state {
                Some(s) => s.next_stage(entry),
                None => Some(entry),
            };
            let pending_bytes = match next {
                Some(Stage::Tar) => dir_size(&row.directory),
                Some(Stage::Upload) => state
                    .map(|s| std::fs::metadata(&s.tar_path).map(|m| m.len()).unwrap_or(0))
                    .unwrap_or(0),
                _ => 0,
            };
            PlannedRow { index: row.index, name: row.name.clone(), next, pending_bytes }
        })
        .collect()
}

fn dir_size(dir: &std::path::Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn entry_stage(row: &JobRow) -> Stage {
    if row.needs_archive() { Stage::Tar } else { Stage::Create }
}

enum WorkItem {
    Row(u32),
    Stop,
}

#[derive(Clone, Copy)]
enum JobOp {
    Create,
    Submit,
}

enum JobItem {
    Job(u32, JobOp),
    Stop,
}

/// One done event per active row, successful or not.
struct RowDone;

struct EngineCtx<'a> {
    api: &'a dyn ComputeApi,
    store: &'a dyn StoreLike,
    governor: &'a Arc<TransferGovernor>,
    rows: HashMap<u32, JobRow>,
    states: Mutex<BTreeMap<u32, RowState>>,
    writer: StateWriter,
    opts: PipelineOptions,
    abort: AtomicBool,
    upload_tx: Sender<WorkItem>,
    job_tx: Sender<JobItem>,
    done_tx: Sender<RowDone>,
    mp: Arc<MultiProgress>,
}

impl EngineCtx<'_> {
    fn should_stop(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || crate::util::is_cancelled()
    }

    /// Mutate one row under the lock and persist the result through the
    /// single writer. Workers only ever touch the row they are processing.
    fn with_row<F: FnOnce(&mut RowState)>(&self, index: u32, f: F) {
        if let Ok(mut map) = self.states.lock()
            && let Some(r) = map.get_mut(&index)
        {
            f(r);
            self.writer.update(r.clone());
        }
    }

    fn row_state(&self, index: u32) -> Option<RowState> {
        self.states.lock().ok().and_then(|m| m.get(&index).cloned())
    }

    fn row_failed(&self, index: u32, stage: Stage, err: &anyhow::Error) {
        tracing::warn!("[pur] row={} stage={} 失败: {}", index, stage.label(), err);
        self.with_row(index, |r| {
            r.set_status(stage, StageStatus::Failed, &err.to_string());
        });
        if !self.opts.continue_on_error {
            self.abort.store(true, Ordering::SeqCst);
        }
        let _ = self.done_tx.send(RowDone);
    }
}

/// Run (or resume) the pipeline over `rows`. The state journal at
/// `opts.state_path` is both the resume source and the live record.
pub fn run_pipeline(
    api: &dyn ComputeApi,
    store: &dyn StoreLike,
    governor: &Arc<TransferGovernor>,
    rows: Vec<JobRow>,
    opts: PipelineOptions,
) -> anyhow::Result<PipelineOutcome> {
    let start = Instant::now();
    let existing = read_state_file(&opts.state_path)?;
    let existing_by_index: HashMap<u32, RowState> =
        existing.into_iter().map(|r| (r.index, r)).collect();

    let mut states: BTreeMap<u32, RowState> = BTreeMap::new();
    for row in &rows {
        let state = match existing_by_index.get(&row.index) {
            Some(s) => {
                if s.name != row.name {
                    tracing::warn!(
                        "[pur] 状态文件第 {} 行名称 {:?} 与任务表 {:?} 不一致，以任务表为准",
                        row.index,
                        s.name,
                        row.name
                    );
                }
                let mut s = s.clone();
                s.name = row.name.clone();
                s
            }
            None => RowState::new(row.index, &row.name),
        };
        states.insert(row.index, state);
    }

    let writer = StateWriter::spawn(opts.state_path.clone(), states.values().cloned().collect())?;

    let (tar_tx, tar_rx) = unbounded::<WorkItem>();
    let (upload_tx, upload_rx) = unbounded::<WorkItem>();
    let (job_tx, job_rx) = unbounded::<JobItem>();
    let (done_tx, done_rx) = unbounded::<RowDone>();

    let mp = Arc::new(if opts.quiet {
        MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    });

    let ctx = EngineCtx {
        api,
        store,
        governor,
        rows: rows.iter().map(|r| (r.index, r.clone())).collect(),
        states: Mutex::new(states),
        writer,
        opts: opts.clone(),
        abort: AtomicBool::new(false),
        upload_tx: upload_tx.clone(),
        job_tx: job_tx.clone(),
        done_tx: done_tx.clone(),
        mp: mp.clone(),
    };

    // seed the queues from the journal
    let mut active: usize = 0;
    let mut skipped_done: u32 = 0;
    for row in &rows {
        let entry = entry_stage(row);
        let state = ctx.row_state(row.index).expect("row state seeded");
        match state.next_stage(entry) {
            None => {
                skipped_done += 1;
            }
            Some(Stage::Tar) => {
                active += 1;
                let _ = tar_tx.send(WorkItem::Row(row.index));
            }
            Some(Stage::Upload) => {
                active += 1;
                if std::path::Path::new(&state.tar_path).exists() {
                    let _ = upload_tx.send(WorkItem::Row(row.index));
                } else {
                    // 归档已成功但文件丢失：重建归档（状态保持 success）
                    tracing::warn!(
                        "[pur] row={} 归档 {} 不存在，重新打包",
                        row.index,
                        state.tar_path
                    );
                    let _ = tar_tx.send(WorkItem::Row(row.index));
                }
            }
            Some(Stage::Create) => {
                active += 1;
                let _ = job_tx.send(JobItem::Job(row.index, JobOp::Create));
            }
            Some(Stage::Submit) => {
                active += 1;
                let _ = job_tx.send(JobItem::Job(row.index, JobOp::Submit));
            }
        }
    }

    let tar_workers = opts.tar_workers.clamp(1, 16);
    let upload_workers = opts.upload_workers.clamp(1, 10);
    let job_workers = opts.job_workers.clamp(1, 16);

    std::thread::scope(|scope| {
        for worker_id in 0..tar_workers {
            let rx = tar_rx.clone();
            let ctx = &ctx;
            scope.spawn(move || tar_worker(worker_id, ctx, rx));
        }
        for worker_id in 0..upload_workers {
            let rx = upload_rx.clone();
            let ctx = &ctx;
            scope.spawn(move || upload_worker(worker_id, ctx, rx));
        }
        for worker_id in 0..job_workers {
            let rx = job_rx.clone();
            let ctx = &ctx;
            scope.spawn(move || job_worker(worker_id, ctx, rx));
        }

        // wait for every active row to finish (success or failure), then
        // release the pools
        for _ in 0..active {
            let _ = done_rx.recv();
        }
        for _ in 0..tar_workers {
            let _ = tar_tx.send(WorkItem::Stop);
        }
        for _ in 0..upload_workers {
            let _ = upload_tx.send(WorkItem::Stop);
        }
        for _ in 0..job_workers {
            let _ = job_tx.send(JobItem::Stop);
        }
    });

    ctx.writer.flush();
    let final_states: Vec<RowState> = ctx
        .states
        .lock()
        .map_err(|_| PilotError::Fatal("行状态锁被破坏".to_string()))?
        .values()
        .cloned()
        .collect();
    drop(ctx);
    let _ = mp.clear();

    let mut outcome = PipelineOutcome {
        rows_total: rows.len() as u32,
        skipped_done,
        elapsed_secs: start.elapsed().as_secs_f64(),
        ..PipelineOutcome::default()
    };
    for s in &final_states {
        tally(&mut outcome.tar, s.tar_status);
        tally(&mut outcome.upload, s.upload_status);
        tally(&mut outcome.create, s.create_status);
        tally(&mut outcome.submit, s.submit_status);
        for (stage_err, status) in [
            (&s.tar_error, s.tar_status),
            (&s.upload_error, s.upload_status),
            (&s.create_error, s.create_status),
            (&s.submit_error, s.submit_status),
        ] {
            if status == StageStatus::Failed && !stage_err.is_empty() {
                outcome.failures.push((s.index, s.name.clone(), stage_err.clone()));
                break;
            }
        }
    }

    if crate::util::is_cancelled() {
        return Err(PilotError::Cancelled.into());
    }
    Ok(outcome)
}

fn tally(counts: &mut StageCounts, status: StageStatus) {
    match status {
        StageStatus::Success => counts.success += 1,
        StageStatus::Failed => counts.failed += 1,
        StageStatus::Pending => {}
    }
}

fn tar_worker(worker_id: usize, ctx: &EngineCtx<'_>, rx: Receiver<WorkItem>) {
    while let Ok(item) = rx.recv() {
        let index = match item {
            WorkItem::Stop => break,
            WorkItem::Row(i) => i,
        };
        if ctx.should_stop() {
            let _ = ctx.done_tx.send(RowDone);
            continue;
        }
        let Some(row) = ctx.rows.get(&index) else {
            let _ = ctx.done_tx.send(RowDone);
            continue;
        };
        tracing::debug!("[pur][tar] worker={} row={} 开始打包", worker_id, index);
        // start-of-attempt touch so the journal shows the row in flight
        ctx.with_row(index, |r| r.updated_at = crate::util::now_rfc3339());

        let archive_name = archive::archive_file_name(&row.name, ctx.opts.archive.compression);
        let archive_path = row
            .directory
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.join(&archive_name))
            .unwrap_or_else(|| PathBuf::from(&archive_name));

        match archive::build_archive(&row.directory, &ctx.opts.archive, &archive_path) {
            Ok(report) => {
                tracing::debug!(
                    "[pur][tar] row={} 完成: {} 项 {} 字节",
                    index,
                    report.entries,
                    report.bytes
                );
                ctx.with_row(index, |r| {
                    r.tar_path = archive_path.display().to_string();
                    r.set_status(Stage::Tar, StageStatus::Success, "");
                });
                let _ = ctx.upload_tx.send(WorkItem::Row(index));
            }
            Err(e) => ctx.row_failed(index, Stage::Tar, &e),
        }
    }
}

fn upload_worker(worker_id: usize, ctx: &EngineCtx<'_>, rx: Receiver<WorkItem>) {
    while let Ok(item) = rx.recv() {
        let index = match item {
            WorkItem::Stop => break,
            WorkItem::Row(i) => i,
        };
        if ctx.should_stop() {
            let _ = ctx.done_tx.send(RowDone);
            continue;
        }
        let Some(state) = ctx.row_state(index) else {
            let _ = ctx.done_tx.send(RowDone);
            continue;
        };
        tracing::debug!("[pur][upload] worker={} row={} 开始上传", worker_id, index);
        ctx.with_row(index, |r| r.updated_at = crate::util::now_rfc3339());

        let source = PathBuf::from(&state.tar_path);
        let pb = ctx.mp.add(ProgressBar::new(0));
        pb.set_style(crate::util::file_progress_style());
        pb.set_message(state.name.clone());
        let req = UploadRequest {
            source: &source,
            remote_name: None,
            folder_id: ctx.opts.dest_folder_id.clone(),
            check: crate::config::UploadCheck::Fast,
            policy: None,
            max_retries: ctx.opts.max_retries,
            progress: Some(pb.clone()),
            total_pb: None,
        };
        match upload_file(ctx.api, ctx.store, ctx.governor, req) {
            Ok(file_id) => {
                pb.finish_and_clear();
                ctx.with_row(index, |r| {
                    r.file_id = file_id;
                    r.set_status(Stage::Upload, StageStatus::Success, "");
                });
                if ctx.opts.rm_tar_on_success {
                    let _ = std::fs::remove_file(&source);
                }
                let _ = ctx.job_tx.send(JobItem::Job(index, JobOp::Create));
            }
            Err(e) => {
                pb.finish_and_clear();
                ctx.row_failed(index, Stage::Upload, &e);
            }
        }
    }
}

fn job_worker(worker_id: usize, ctx: &EngineCtx<'_>, rx: Receiver<JobItem>) {
    while let Ok(item) = rx.recv() {
        let (index, op) = match item {
            JobItem::Stop => break,
            JobItem::Job(i, op) => (i, op),
        };
        if ctx.should_stop() {
            let _ = ctx.done_tx.send(RowDone);
            continue;
        }
        match op {
            JobOp::Create => run_create(worker_id, ctx, index),
            JobOp::Submit => run_submit(worker_id, ctx, index),
        }
    }
}

fn run_create(worker_id: usize, ctx: &EngineCtx<'_>, index: u32) {
    let Some(row) = ctx.rows.get(&index) else {
        let _ = ctx.done_tx.send(RowDone);
        return;
    };
    let Some(state) = ctx.row_state(index) else {
        let _ = ctx.done_tx.send(RowDone);
        return;
    };
    tracing::debug!("[pur][job] worker={} row={} 创建任务", worker_id, index);
    ctx.with_row(index, |r| r.updated_at = crate::util::now_rfc3339());

    // at-most-once: persist the correlation token before the remote call; on
    // resume an existing token is first resolved against the remote
    let token = if state.correlation_token.is_empty() {
        let token = format!("jp-{:016x}", rand::random::<u64>());
        ctx.with_row(index, |r| {
            r.correlation_token = token.clone();
            r.updated_at = crate::util::now_rfc3339();
        });
        ctx.writer.flush();
        token
    } else {
        match ctx.api.find_job_by_token(&state.correlation_token) {
            Ok(Some(job_id)) => {
                tracing::info!(
                    "[pur][job] row={} 关联令牌命中已有任务 {}，跳过创建",
                    index,
                    job_id
                );
                ctx.with_row(index, |r| {
                    r.job_id = job_id;
                    r.set_status(Stage::Create, StageStatus::Success, "");
                });
                let _ = ctx.job_tx.send(JobItem::Job(index, JobOp::Submit));
                return;
            }
            Ok(None) => state.correlation_token.clone(),
            Err(e) => {
                ctx.row_failed(index, Stage::Create, &e);
                return;
            }
        }
    };

    let mut input_file_ids = Vec::new();
    if !state.file_id.is_empty() {
        input_file_ids.push(state.file_id.clone());
    }
    input_file_ids.extend(row.extra_input_file_ids.iter().cloned());
    let spec = JobSpec {
        name: row.name.clone(),
        command: row.command.clone(),
        analysis_code: row.analysis_code.clone(),
        analysis_version: row.analysis_version.clone(),
        core_type: row.core_type.clone(),
        walltime_hours: row.walltime_hours,
        input_file_ids,
        project_id: row.project_id.clone(),
        tags: row.tags.clone(),
    };
    match ctx.api.create_job(&spec, &token) {
        Ok(job_id) => {
            ctx.with_row(index, |r| {
                r.job_id = job_id;
                r.set_status(Stage::Create, StageStatus::Success, "");
            });
            let _ = ctx.job_tx.send(JobItem::Job(index, JobOp::Submit));
        }
        Err(e) => ctx.row_failed(index, Stage::Create, &e),
    }
}

fn run_submit(worker_id: usize, ctx: &EngineCtx<'_>, index: u32) {
    let Some(state) = ctx.row_state(index) else {
        let _ = ctx.done_tx.send(RowDone);
        return;
    };
    tracing::debug!("[pur][job] worker={} row={} 提交任务 {}", worker_id, index, state.job_id);
    ctx.with_row(index, |r| r.updated_at = crate::util::now_rfc3339());
    if state.job_id.is_empty() {
        let e: anyhow::Error = PilotError::Fatal("提交阶段缺少 job_id".to_string()).into();
        ctx.row_failed(index, Stage::Submit, &e);
        return;
    }
    match ctx.api.submit_job(&state.job_id) {
        Ok(()) => {
            ctx.with_row(index, |r| {
                r.set_status(Stage::Submit, StageStatus::Success, "");
            });
            let _ = ctx.done_tx.send(RowDone);
        }
        Err(e) => ctx.row_failed(index, Stage::Submit, &e),
    }
}
