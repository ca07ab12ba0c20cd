// Durable per-row pipeline state. One CSV journal keyed by row index, stable
// column order, rewritten atomically (write-temp + rename) after every
// transition. All writes funnel through a single writer thread so concurrent
// stage workers can never tear the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crossbeam_channel::{Sender, unbounded};

use crate::PilotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<StageStatus> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "success" => Ok(StageStatus::Success),
            "failed" => Ok(StageStatus::Failed),
            other => {
                Err(PilotError::Validation(format!("未知阶段状态: {:?}", other)).into())
            }
        }
    }
}

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Tar,
    Upload,
    Create,
    Submit,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Tar => "tar",
            Stage::Upload => "upload",
            Stage::Create => "create",
            Stage::Submit => "submit",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowState {
    pub index: u32,
    pub name: String,
    pub tar_status: StageStatus,
    pub tar_path: String,
    pub tar_error: String,
    pub upload_status: StageStatus,
    pub file_id: String,
    pub upload_error: String,
    pub create_status: StageStatus,
    pub job_id: String,
    pub create_error: String,
    pub submit_status: StageStatus,
    pub submit_error: String,
    /// Client-side token persisted before the create call so a crashed run
    /// can find the job it already created instead of making a twin.
    pub correlation_token: String,
    pub updated_at: String,
}

impl RowState {
    pub fn new(index: u32, name: &str) -> Self {
        RowState { index, name: name.to_string(), ..RowState::default() }
    }

    pub fn status_of(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Tar => self.tar_status,
            Stage::Upload => self.upload_status,
            Stage::Create => self.create_status,
            Stage::Submit => self.submit_status,
        }
    }

    /// Record a stage outcome. `success` is terminal: downgrading an already
    /// successful stage is an invariant violation and is refused.
    pub fn set_status(&mut self, stage: Stage, status: StageStatus, error: &str) {
        let slot = match stage {
            Stage::Tar => &mut self.tar_status,
            Stage::Upload => &mut self.upload_status,
            Stage::Create => &mut self.create_status,
            Stage::Submit => &mut self.submit_status,
        };
        if *slot == StageStatus::Success && status != StageStatus::Success {
            tracing::warn!(
                "[state] 拒绝回退 row={} stage={} {:?} -> {:?}",
                self.index,
                stage.label(),
                slot,
                status
            );
            return;
        }
        *slot = status;
        let err_slot = match stage {
            Stage::Tar => &mut self.tar_error,
            Stage::Upload => &mut self.upload_error,
            Stage::Create => &mut self.create_error,
            Stage::Submit => &mut self.submit_error,
        };
        *err_slot = error.to_string();
        self.updated_at = crate::util::now_rfc3339();
    }

    pub fn all_done(&self) -> bool {
        self.submit_status == StageStatus::Success
    }

    /// The next stage that still needs work, in order; None when finished.
    /// `entry` is the first stage this row runs at all (rows with
    /// pre-uploaded inputs enter at CREATE).
    pub fn next_stage(&self, entry: Stage) -> Option<Stage> {
        for stage in [Stage::Tar, Stage::Upload, Stage::Create, Stage::Submit] {
            if stage < entry {
                continue;
            }
            if self.status_of(stage) != StageStatus::Success {
                return Some(stage);
            }
        }
        None
    }
}

pub const STATE_HEADER: [&str; 15] = [
    "index",
    "name",
    "tar_status",
    "tar_path",
    "tar_error",
    "upload_status",
    "file_id",
    "upload_error",
    "create_status",
    "job_id",
    "create_error",
    "submit_status",
    "submit_error",
    "correlation_token",
    "updated_at",
];

fn row_to_record(r: &RowState) -> Vec<String> {
    vec![
        r.index.to_string(),
        r.name.clone(),
        r.tar_status.as_str().to_string(),
        r.tar_path.clone(),
        r.tar_error.clone(),
        r.upload_status.as_str().to_string(),
        r.file_id.clone(),
        r.upload_error.clone(),
        r.create_status.as_str().to_string(),
        r.job_id.clone(),
        r.create_error.clone(),
        r.submit_status.as_str().to_string(),
        r.submit_error.clone(),
        r.correlation_token.clone(),
        r.updated_at.clone(),
    ]
}

fn record_to_row(rec: &csv::StringRecord) -> anyhow::Result<RowState> {
    if rec.len() < STATE_HEADER.len() {
        return Err(PilotError::Validation(format!(
            "状态文件行字段不足: {} < {}",
            rec.len(),
            STATE_HEADER.len()
        ))
        .into());
    }
    let field = |i: usize| rec.get(i).unwrap_or("").to_string();
    Ok(RowState {
        index: field(0)
            .parse::<u32>()
            .map_err(|e| PilotError::Validation(format!("非法行号 {:?}: {}", field(0), e)))?,
        name: field(1),
        tar_status: StageStatus::parse(&field(2))?,
        tar_path: field(3),
        tar_error: field(4),
        upload_status: StageStatus::parse(&field(5))?,
        file_id: field(6),
        upload_error: field(7),
        create_status: StageStatus::parse(&field(8))?,
        job_id: field(9),
        create_error: field(10),
        submit_status: StageStatus::parse(&field(11))?,
        submit_error: field(12),
        correlation_token: field(13),
        updated_at: field(14),
    })
}

fn serialize_rows(rows: &BTreeMap<u32, RowState>) -> anyhow::Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(STATE_HEADER)
        .map_err(|e| PilotError::Fatal(format!("写状态表头失败: {}", e)))?;
    for row in rows.values() {
        w.write_record(row_to_record(row))
            .map_err(|e| PilotError::Fatal(format!("写状态行失败: {}", e)))?;
    }
    w.into_inner().map_err(|e| PilotError::Fatal(format!("刷写状态缓冲失败: {}", e)).into())
}

/// Read a state journal; a missing file is an empty journal.
pub fn read_state_file(path: &Path) -> anyhow::Result<Vec<RowState>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PilotError::Validation(format!("无法读取状态文件: {}", e)))?;
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec.map_err(|e| PilotError::Validation(format!("状态文件损坏: {}", e)))?;
        out.push(record_to_row(&rec)?);
    }
    Ok(out)
}

enum WriterMsg {
    Update(Box<RowState>),
    Flush(Sender<()>),
}

/// The single serialized writer. Stage workers send row updates; the writer
/// thread folds them into its map and atomically rewrites the journal.
pub struct StateWriter {
    tx: Sender<WriterMsg>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StateWriter {
    pub fn spawn(path: PathBuf, initial: Vec<RowState>) -> anyhow::Result<StateWriter> {
        let mut rows: BTreeMap<u32, RowState> = BTreeMap::new();
        for r in initial {
            rows.insert(r.index, r);
        }
        // 启动即落盘一次，让 resume 立刻有据可查
        write_out(&path, &rows)?;
        let (tx, rx) = unbounded::<WriterMsg>();
        let handle = std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    WriterMsg::Update(row) => {
                        rows.insert(row.index, *row);
                        if let Err(e) = write_out(&path, &rows) {
                            tracing::warn!("[state] 状态文件写入失败: {}", e);
                        }
                    }
                    WriterMsg::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Ok(StateWriter { tx, handle: Some(handle) })
    }

    pub fn update(&self, row: RowState) {
        let _ = self.tx.send(WriterMsg::Update(Box::new(row)));
    }

    /// Block until every update sent so far has been applied and persisted.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = unbounded::<()>();
        if self.tx.send(WriterMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.flush();
        // dropping the sender ends the writer loop
        let (dead_tx, _) = unbounded::<WriterMsg>();
        let tx = std::mem::replace(&mut self.tx, dead_tx);
        drop(tx);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for StateWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn write_out(path: &Path, rows: &BTreeMap<u32, RowState>) -> anyhow::Result<()> {
    let body = serialize_rows(rows)?;
    crate::util::atomic_write(path, &body)
        .map_err(|e| PilotError::from_io(&e, "写入状态文件").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.csv");
        let mut r1 = RowState::new(1, "job-a");
        r1.set_status(Stage::Tar, StageStatus::Success, "");
        r1.tar_path = "/tmp/a.tar".into();
        let r2 = RowState::new(2, "job-b");

        let w = StateWriter::spawn(path.clone(), vec![r1.clone(), r2.clone()]).unwrap();
        r1.set_status(Stage::Upload, StageStatus::Failed, "网络超时");
        w.update(r1.clone());
        w.close();

        let rows = read_state_file(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tar_status, StageStatus::Success);
        assert_eq!(rows[0].upload_status, StageStatus::Failed);
        assert_eq!(rows[0].upload_error, "网络超时");
        assert_eq!(rows[1].name, "job-b");
    }

    #[test]
    fn success_is_terminal() {
        let mut r = RowState::new(1, "a");
        r.set_status(Stage::Create, StageStatus::Success, "");
        r.set_status(Stage::Create, StageStatus::Failed, "should not downgrade");
        assert_eq!(r.create_status, StageStatus::Success);
        assert_eq!(r.create_error, "");
    }

    #[test]
    fn next_stage_walks_in_order() {
        let mut r = RowState::new(1, "a");
        assert_eq!(r.next_stage(Stage::Tar), Some(Stage::Tar));
        r.set_status(Stage::Tar, StageStatus::Success, "");
        assert_eq!(r.next_stage(Stage::Tar), Some(Stage::Upload));
        r.set_status(Stage::Upload, StageStatus::Success, "");
        r.set_status(Stage::Create, StageStatus::Success, "");
        r.set_status(Stage::Submit, StageStatus::Success, "");
        assert_eq!(r.next_stage(Stage::Tar), None);
        assert!(r.all_done());
    }

    #[test]
    fn entry_stage_skips_earlier_stages() {
        let r = RowState::new(1, "a");
        // rows with pre-uploaded inputs never run tar/upload
        assert_eq!(r.next_stage(Stage::Create), Some(Stage::Create));
    }

    #[test]
    fn failed_stage_is_reattempted() {
        let mut r = RowState::new(1, "a");
        r.set_status(Stage::Tar, StageStatus::Success, "");
        r.set_status(Stage::Upload, StageStatus::Failed, "boom");
        assert_eq!(r.next_stage(Stage::Tar), Some(Stage::Upload));
        r.set_status(Stage::Upload, StageStatus::Success, "");
        assert_eq!(r.next_stage(Stage::Tar), Some(Stage::Create));
    }

    #[test]
    fn concurrent_updates_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.csv");
        let initial: Vec<RowState> =
            (1..=16).map(|i| RowState::new(i, &format!("job-{}", i))).collect();
        let w = std::sync::Arc::new(StateWriter::spawn(path.clone(), initial).unwrap());
        let mut handles = Vec::new();
        for i in 1..=16u32 {
            let w = w.clone();
            handles.push(std::thread::spawn(move || {
                let mut r = RowState::new(i, &format!("job-{}", i));
                r.set_status(Stage::Tar, StageStatus::Success, "");
                r.tar_path = format!("/tmp/{}.tar", i);
                w.update(r);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        w.flush();
        let rows = read_state_file(&path).unwrap();
        assert_eq!(rows.len(), 16);
        assert!(rows.iter().all(|r| r.tar_status == StageStatus::Success));
        // 行按索引有序
        let idx: Vec<u32> = rows.iter().map(|r| r.index).collect();
        assert_eq!(idx, (1..=16).collect::<Vec<u32>>());
    }

    #[test]
    fn missing_file_is_empty_journal() {
        let rows = read_state_file(Path::new("/no/such/state.csv")).unwrap();
        assert!(rows.is_empty());
    }
}
