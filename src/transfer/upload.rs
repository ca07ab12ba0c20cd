// Resumable multipart upload. A single producer streams the source through
// the encrypting reader (CBC is sequential) and hands finished parts to a
// bounded pool of part workers; completed parts are recorded in the session
// sidecar only after the store acknowledged them, so an interrupted upload
// finishes its remaining parts on the next run.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use indicatif::ProgressBar;
use sha2::{Digest, Sha256};

use super::session::{SourceFingerprint, UploadSession};
use super::store::StoreLike;
use super::{PART_SIZE, Throttler, TransferGovernor};
use crate::PilotError;
use crate::api::ComputeApi;
use crate::codec::{self, EncryptingReader, FileKey};
use crate::config::UploadCheck;
use crate::conflict::{ConflictAction, ConflictPolicy};

pub struct UploadRequest<'a> {
    pub source: &'a Path,
    /// Name on the remote; defaults to the local file name.
    pub remote_name: Option<String>,
    pub folder_id: Option<String>,
    pub check: UploadCheck,
    /// None means the upload default: no pre-check, duplicates allowed.
    pub policy: Option<&'a ConflictPolicy>,
    pub max_retries: usize,
    pub progress: Option<ProgressBar>,
    pub total_pb: Option<ProgressBar>,
}

struct PartJob {
    part_number: u32,
    data: Vec<u8>,
}

enum SessionOutcome {
    Fresh(UploadSession),
    /// Conflict resolved to "keep the remote file": no transfer happens.
    Existing(String),
}

/// Upload `source` encrypted, resuming a matching session if one exists.
/// Returns the remote file id.
pub fn upload_file(
    api: &dyn ComputeApi,
    store: &dyn StoreLike,
    governor: &Arc<TransferGovernor>,
    req: UploadRequest<'_>,
) -> anyhow::Result<String> {
    crate::util::check_cancelled()?;
    let name = match &req.remote_name {
        Some(n) => n.clone(),
        None => req
            .source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| PilotError::Validation(format!("无效源路径: {}", req.source.display())))?,
    };
    let fingerprint = SourceFingerprint::of(req.source)?;

    let _permit = governor.begin();

    // safe 模式：上传前先查目录内容，冲突交给策略
    if req.check == UploadCheck::Safe
        && let Some(policy) = req.policy
        && let Some(existing) = find_existing(api, req.folder_id.as_deref(), &name)?
    {
        match policy.decide(&name)? {
            ConflictAction::Skip => {
                tracing::info!("[upload] 跳过已存在文件 {}", name);
                return Ok(existing);
            }
            ConflictAction::Overwrite => {
                api.delete_file(&existing)?;
            }
            // resume/merge fall through to the session path below
            ConflictAction::Resume | ConflictAction::Merge => {}
            ConflictAction::Abort => return Err(PilotError::Cancelled.into()),
        }
    }

    // session: reuse a valid one, otherwise create the remote record fresh
    let session = match UploadSession::load(req.source) {
        Some(s) if s.is_valid_for(&fingerprint, Utc::now()) => {
            tracing::info!(
                "[upload] 续传 {}: 已完成 {}/{} 分片",
                name,
                s.parts.len(),
                s.total_parts
            );
            s
        }
        other => {
            if other.is_some() {
                // fingerprint or TTL mismatch: the old session is dead weight
                UploadSession::remove(req.source);
            }
            match create_session(api, req.source, &name, &fingerprint, &req)? {
                SessionOutcome::Fresh(s) => s,
                SessionOutcome::Existing(id) => return Ok(id),
            }
        }
    };

    let enc_len = codec::encrypted_len(fingerprint.len);
    let total_parts = session.total_parts;
    let key = FileKey::from_b64(&session.key_b64, &session.iv_b64)?;
    let creds = api.storage_credentials()?;
    let object_key = session.object_key.clone();
    let file_id = session.file_id.clone();
    let completed: HashSet<u32> = session.completed_parts();

    if let Some(pb) = &req.progress {
        pb.set_length(enc_len);
        pb.inc(completed.len() as u64 * session.part_size);
    }

    let session = Arc::new(Mutex::new(session));
    let workers = governor.range_workers(enc_len).min(total_parts as usize).max(1);
    let (part_tx, part_rx) = bounded::<PartJob>(workers);
    let failed: AtomicBool = AtomicBool::new(false);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    let encrypted_sha256 = std::thread::scope(|scope| {
        for worker_id in 0..workers {
            let part_rx = part_rx.clone();
            let creds = creds.clone();
            let object_key = object_key.as_str();
            let session = session.clone();
            let failed = &failed;
            let first_error = &first_error;
            let source = req.source;
            let progress = req.progress.clone();
            let total_pb = req.total_pb.clone();
            let max_retries = req.max_retries;
            scope.spawn(move || {
                let mut throttler = Throttler::new();
                while let Ok(job) = part_rx.recv() {
                    if failed.load(Ordering::SeqCst) || crate::util::is_cancelled() {
                        continue; // drain the queue so the producer never blocks
                    }
                    let n = job.data.len() as u64;
                    match upload_one_part(store, &creds, object_key, &job, max_retries) {
                        Ok((etag, sha256)) => {
                            let mut s = match session.lock() {
                                Ok(s) => s,
                                Err(_) => {
                                    failed.store(true, Ordering::SeqCst);
                                    continue;
                                }
                            };
                            s.record_part(job.part_number, etag, sha256);
                            if let Err(e) = s.save(source) {
                                tracing::warn!(
                                    "[upload] worker={} 会话写入失败: {}",
                                    worker_id,
                                    e
                                );
                            }
                            drop(s);
                            throttler.tick(n, progress.as_ref(), total_pb.as_ref());
                        }
                        Err(e) => {
                            tracing::debug!(
                                "[upload] worker={} 分片 {} 失败: {}",
                                worker_id,
                                job.part_number,
                                e
                            );
                            failed.store(true, Ordering::SeqCst);
                            if let Ok(mut slot) = first_error.lock()
                                && slot.is_none()
                            {
                                *slot = Some(e);
                            }
                        }
                    }
                }
                throttler.flush(progress.as_ref(), total_pb.as_ref());
            });
        }
        drop(part_rx);
        // produce_parts owns part_tx and drops it on every path, so the
        // workers always see end-of-queue and the scope can join
        produce_parts(req.source, &key, &completed, total_parts, part_tx, &failed, &first_error)
    })?;

    crate::util::check_cancelled()?;
    if failed.load(Ordering::SeqCst) {
        let err = first_error
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .unwrap_or_else(|| PilotError::Fatal("上传失败且无错误详情".to_string()).into());
        return Err(err);
    }

    // completion requires every part etag; the session is the ledger
    let etags: Vec<(u32, String)> = {
        let s = session
            .lock()
            .map_err(|_| PilotError::Fatal("上传会话锁被破坏".to_string()))?;
        if s.parts.len() as u32 != total_parts {
            return Err(PilotError::Fatal(format!(
                "完成上传前分片不全: {}/{}",
                s.parts.len(),
                total_parts
            ))
            .into());
        }
        s.parts.iter().map(|p| (p.part_number, p.etag.clone())).collect()
    };
    store.complete_multipart(&creds, &object_key, &etags)?;
    api.finalize_file(&file_id, &encrypted_sha256)?;
    UploadSession::remove(req.source);
    if let Some(pb) = &req.progress {
        pb.finish_and_clear();
    }
    tracing::info!("[upload] 完成 {} -> file_id={}", name, file_id);
    Ok(file_id)
}

/// Stream-encrypt the source into parts. The CBC state and the whole-stream
/// hash must advance through already-completed parts too, so those are
/// produced and hashed but never sent.
fn produce_parts(
    source: &Path,
    key: &FileKey,
    completed: &HashSet<u32>,
    total_parts: u32,
    part_tx: Sender<PartJob>,
    failed: &AtomicBool,
    first_error: &Mutex<Option<anyhow::Error>>,
) -> anyhow::Result<String> {
    let f =
        std::fs::File::open(source).map_err(|e| PilotError::from_io(&e, "打开上传源文件"))?;
    let mut reader = EncryptingReader::new(std::io::BufReader::new(f), key);
    let mut hasher = Sha256::new();
    let mut part_number: u32 = 0;
    loop {
        crate::util::check_cancelled()?;
        if failed.load(Ordering::SeqCst) {
            return Ok(String::new());
        }
        let mut buf = Vec::with_capacity(PART_SIZE as usize);
        let n = read_up_to(&mut reader, &mut buf, PART_SIZE)
            .map_err(|e| PilotError::from_io(&e, "读取/加密源文件"))?;
        if n == 0 {
            break;
        }
        part_number += 1;
        hasher.update(&buf);
        if completed.contains(&part_number) {
            continue;
        }
        if part_tx.send(PartJob { part_number, data: buf }).is_err() {
            break;
        }
    }
    if part_number != total_parts && !failed.load(Ordering::SeqCst) {
        failed.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = first_error.lock()
            && slot.is_none()
        {
            *slot = Some(
                PilotError::Fatal(format!(
                    "分片数不一致: 产出 {}，会话记录 {}",
                    part_number, total_parts
                ))
                .into(),
            );
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn find_existing(
    api: &dyn ComputeApi,
    folder_id: Option<&str>,
    name: &str,
) -> anyhow::Result<Option<String>> {
    let entries = api.list_folder(folder_id)?;
    Ok(entries.into_iter().find(|e| !e.is_folder && e.name == name).map(|e| e.id))
}

fn create_session(
    api: &dyn ComputeApi,
    source: &Path,
    name: &str,
    fingerprint: &SourceFingerprint,
    req: &UploadRequest<'_>,
) -> anyhow::Result<SessionOutcome> {
    let key = FileKey::generate();
    let (key_b64, iv_b64) = key.to_b64();
    let enc_len = codec::encrypted_len(fingerprint.len);
    let plaintext_sha256 = codec::sha256_file(source)?;

    let record = match api.create_file(
        name,
        req.folder_id.as_deref(),
        fingerprint.len,
        enc_len,
        &key_b64,
        &iv_b64,
        &plaintext_sha256,
    ) {
        Ok(r) => r,
        // fast 模式：远端报冲突后再查询并解决，典型动作是删除后重试一次
        Err(e) if is_conflict(&e) => {
            let Some(policy) = req.policy else { return Err(e) };
            let existing = find_existing(api, req.folder_id.as_deref(), name)?;
            match (policy.decide(name)?, existing) {
                (ConflictAction::Skip, Some(id)) => return Ok(SessionOutcome::Existing(id)),
                (ConflictAction::Overwrite, Some(id)) => {
                    api.delete_file(&id)?;
                    api.create_file(
                        name,
                        req.folder_id.as_deref(),
                        fingerprint.len,
                        enc_len,
                        &key_b64,
                        &iv_b64,
                        &plaintext_sha256,
                    )?
                }
                _ => return Err(e),
            }
        }
        Err(e) => return Err(e),
    };

    let total_parts = enc_len.div_ceil(PART_SIZE).max(1) as u32;
    let session = UploadSession {
        source: *fingerprint,
        file_id: record.id,
        object_key: record.object_key,
        part_size: PART_SIZE,
        total_parts,
        key_b64,
        iv_b64,
        parts: Vec::new(),
        created_at: Utc::now(),
    };
    session.save(source)?;
    Ok(SessionOutcome::Fresh(session))
}

fn is_conflict(e: &anyhow::Error) -> bool {
    e.downcast_ref::<PilotError>().map(|p| matches!(p, PilotError::Conflict(_))).unwrap_or(false)
}

/// Upload one part with transient retries; an acknowledged checksum mismatch
/// gets exactly one in-place re-upload before failing the file.
fn upload_one_part(
    store: &dyn StoreLike,
    creds: &crate::api::StorageCredentials,
    object_key: &str,
    job: &PartJob,
    max_retries: usize,
) -> anyhow::Result<(String, String)> {
    let local_sha = codec::sha256_bytes(&job.data);
    let ctx = format!("part {}", job.part_number);
    let mut integrity_retry_used = false;
    loop {
        let receipt = crate::util::retry_transient(max_retries, &ctx, || {
            store.upload_part(creds, object_key, job.part_number, &job.data)
        })?;
        if let Some(remote_sha) = &receipt.sha256
            && remote_sha != &local_sha
        {
            if integrity_retry_used {
                return Err(PilotError::Integrity(format!(
                    "分片 {} 两次校验和不一致",
                    job.part_number
                ))
                .into());
            }
            tracing::warn!("[upload] 分片 {} 校验和不一致，重传一次", job.part_number);
            integrity_retry_used = true;
            continue;
        }
        if receipt.etag.is_empty() {
            return Err(PilotError::Fatal(format!("分片 {} 返回空 etag", job.part_number)).into());
        }
        return Ok((receipt.etag, local_sha));
    }
}

/// Read exactly `limit` bytes unless the stream ends first.
fn read_up_to<R: Read>(r: &mut R, buf: &mut Vec<u8>, limit: u64) -> std::io::Result<usize> {
    let mut taken = r.take(limit);
    taken.read_to_end(buf)
}
