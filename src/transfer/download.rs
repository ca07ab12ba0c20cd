// Range-parallel resumable download. Ranges land at their offsets in a
// `.enc` staging file; completeness is judged by the PKCS7 padding window
// plus the encrypted checksum, then the staging file is decrypted into a
// `.part` temp and atomically renamed over the target.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crossbeam_channel::bounded;
use indicatif::ProgressBar;

use super::session::{DownloadSession, RangeRecord};
use super::store::StoreLike;
use super::{Throttler, TransferGovernor};
use crate::PilotError;
use crate::api::{ComputeApi, RemoteFileMeta, StorageCredentials};
use crate::budget::split_ranges;
use crate::codec::{self, FileKey};

pub struct DownloadRequest<'a> {
    pub file_id: &'a str,
    pub target: &'a Path,
    pub skip_checksum: bool,
    pub max_retries: usize,
    pub progress: Option<ProgressBar>,
    pub total_pb: Option<ProgressBar>,
}

fn staging_path(target: &Path, suffix: &str) -> PathBuf {
    let name = target.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    target.with_file_name(format!("{}{}", name, suffix))
}

/// Download and decrypt one remote file. Returns the plaintext byte count.
pub fn download_file(
    api: &dyn ComputeApi,
    store: &dyn StoreLike,
    governor: &Arc<TransferGovernor>,
    req: DownloadRequest<'_>,
) -> anyhow::Result<u64> {
    crate::util::check_cancelled()?;
    let meta = api.file_meta(req.file_id)?;
    crate::util::validate_remote_name(&meta.name)?;
    let key = FileKey::from_b64(&meta.key, &meta.iv)?;
    let enc_expected = codec::encrypted_len(meta.decrypted_size);
    let enc_path = staging_path(req.target, ".enc");

    let _permit = governor.begin();
    if let Some(pb) = &req.progress {
        pb.set_length(enc_expected);
    }

    // 三段式续传判定 — triple resume check. The staging file is preallocated
    // to its full length, so a bare length check only proves completeness
    // when no session sidecar is pending.
    let have_complete_artifact = DownloadSession::load(req.target).is_none()
        && match std::fs::metadata(&enc_path) {
            Ok(m) => codec::len_in_padding_window(m.len(), meta.decrypted_size),
            Err(_) => false,
        };

    if !have_complete_artifact {
        let session = match DownloadSession::load(req.target) {
            Some(s)
                if s.file_id == meta.id
                    && enc_path.exists()
                    && s.ranges.iter().map(|r| r.length).sum::<u64>() == enc_expected =>
            {
                tracing::info!(
                    "[download] 续传 {}: 剩余 {} 个范围",
                    meta.name,
                    s.missing_ranges().len()
                );
                s
            }
            _ => fresh_session(&meta, req.target, &enc_path, enc_expected, governor)?,
        };
        if let Some(pb) = &req.progress {
            let done: u64 =
                session.ranges.iter().filter(|r| r.done).map(|r| r.length).sum();
            pb.inc(done);
        }
        fetch_missing_ranges(api, store, &session, &meta.object_key, req.target, &enc_path, &req)?;
    } else if let Some(pb) = &req.progress {
        pb.inc(enc_expected);
    }

    crate::util::check_cancelled()?;

    // artifact completeness: padding window first, then encrypted checksum
    let disk_len = std::fs::metadata(&enc_path)
        .map_err(|e| PilotError::from_io(&e, "读取密文暂存文件"))?
        .len();
    if !codec::len_in_padding_window(disk_len, meta.decrypted_size) {
        discard_artifacts(req.target, &enc_path);
        return Err(PilotError::Transient(format!(
            "密文长度 {} 不在填充窗口 [{}, {}] 内，已丢弃待重试",
            disk_len,
            meta.decrypted_size + 1,
            meta.decrypted_size + 16
        ))
        .into());
    }
    if let Some(expected) = &meta.encrypted_sha256 {
        let actual = codec::sha256_file(&enc_path)?;
        if &actual != expected {
            discard_artifacts(req.target, &enc_path);
            return Err(PilotError::Integrity(format!(
                "密文校验和不一致: {} != {}",
                actual, expected
            ))
            .into());
        }
    }

    // decrypt into a temp and rename; the target never exists half-written
    let part_path = staging_path(req.target, ".part");
    let plain_len = match codec::decrypt_file(&enc_path, &part_path, &key) {
        Ok(n) => n,
        Err(e) => {
            let _ = std::fs::remove_file(&part_path);
            discard_artifacts(req.target, &enc_path);
            return Err(e);
        }
    };
    if plain_len != meta.decrypted_size {
        let _ = std::fs::remove_file(&part_path);
        discard_artifacts(req.target, &enc_path);
        return Err(PilotError::Integrity(format!(
            "明文长度 {} 与记录 {} 不一致",
            plain_len, meta.decrypted_size
        ))
        .into());
    }
    if !req.skip_checksum
        && let Some(expected) = &meta.plaintext_sha256
    {
        let actual = codec::sha256_file(&part_path)?;
        if &actual != expected {
            let _ = std::fs::remove_file(&part_path);
            return Err(PilotError::Integrity(format!(
                "明文校验和不一致: {} != {}",
                actual, expected
            ))
            .into());
        }
    }
    std::fs::rename(&part_path, req.target)
        .map_err(|e| PilotError::from_io(&e, "落盘下载目标"))?;
    let _ = std::fs::remove_file(&enc_path);
    DownloadSession::remove(req.target);
    if let Some(pb) = &req.progress {
        pb.finish_and_clear();
    }
    tracing::info!("[download] 完成 {} ({} 字节)", req.target.display(), plain_len);
    Ok(plain_len)
}

fn fresh_session(
    meta: &RemoteFileMeta,
    target: &Path,
    enc_path: &Path,
    enc_expected: u64,
    governor: &Arc<TransferGovernor>,
) -> anyhow::Result<DownloadSession> {
    let _ = std::fs::remove_file(enc_path);
    DownloadSession::remove(target);
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| PilotError::from_io(&e, "创建下载目录"))?;
    }
    let f =
        std::fs::File::create(enc_path).map_err(|e| PilotError::from_io(&e, "创建密文暂存文件"))?;
    f.set_len(enc_expected).map_err(|e| PilotError::from_io(&e, "预分配密文暂存文件"))?;
    drop(f);

    let workers = governor.range_workers(enc_expected);
    let ranges = split_ranges(enc_expected, workers)
        .into_iter()
        .map(|(offset, length)| RangeRecord { offset, length, done: false })
        .collect();
    let session = DownloadSession {
        file_id: meta.id.clone(),
        decrypted_size: meta.decrypted_size,
        key_b64: meta.key.clone(),
        iv_b64: meta.iv.clone(),
        encrypted_sha256: meta.encrypted_sha256.clone(),
        plaintext_sha256: meta.plaintext_sha256.clone(),
        ranges,
        created_at: Utc::now(),
    };
    session.save(target)?;
    Ok(session)
}

fn fetch_missing_ranges(
    api: &dyn ComputeApi,
    store: &dyn StoreLike,
    session: &DownloadSession,
    object_key: &str,
    target: &Path,
    enc_path: &Path,
    req: &DownloadRequest<'_>,
) -> anyhow::Result<()> {
    let missing = session.missing_ranges();
    if missing.is_empty() {
        return Ok(());
    }
    let creds = api.storage_credentials()?;
    let workers = missing.len().min(32).max(1);
    let (range_tx, range_rx) = bounded::<(u64, u64)>(missing.len());
    for r in &missing {
        let _ = range_tx.send(*r);
    }
    drop(range_tx);

    let session = Arc::new(Mutex::new(session.clone()));
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for worker_id in 0..workers {
            let range_rx = range_rx.clone();
            let creds: StorageCredentials = creds.clone();
            let session = session.clone();
            let failed = &failed;
            let first_error = &first_error;
            let progress = req.progress.clone();
            let total_pb = req.total_pb.clone();
            let max_retries = req.max_retries;
            scope.spawn(move || {
                let mut out = match std::fs::OpenOptions::new().write(true).open(enc_path) {
                    Ok(f) => f,
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        record_error(first_error, PilotError::from_io(&e, "打开密文暂存文件").into());
                        return;
                    }
                };
                let mut throttler = Throttler::new();
                while let Ok((offset, length)) = range_rx.recv() {
                    if failed.load(Ordering::SeqCst) || crate::util::is_cancelled() {
                        continue;
                    }
                    let ctx = format!("range {}+{}", offset, length);
                    let res = crate::util::retry_transient(max_retries, &ctx, || {
                        let data = store.get_range(&creds, object_key, offset, length)?;
                        out.seek(SeekFrom::Start(offset))
                            .map_err(|e| PilotError::from_io(&e, "定位密文暂存文件"))?;
                        out.write_all(&data)
                            .map_err(|e| PilotError::from_io(&e, "写入密文暂存文件"))?;
                        Ok(())
                    });
                    match res {
                        Ok(()) => {
                            if let Ok(mut s) = session.lock() {
                                s.mark_done(offset);
                                if let Err(e) = s.save(target) {
                                    tracing::warn!(
                                        "[download] worker={} 会话写入失败: {}",
                                        worker_id,
                                        e
                                    );
                                }
                            }
                            throttler.tick(length, progress.as_ref(), total_pb.as_ref());
                        }
                        Err(e) => {
                            tracing::debug!(
                                "[download] worker={} 范围 {}+{} 失败: {}",
                                worker_id,
                                offset,
                                length,
                                e
                            );
                            failed.store(true, Ordering::SeqCst);
                            record_error(first_error, e);
                        }
                    }
                }
                let _ = out.sync_all();
                throttler.flush(progress.as_ref(), total_pb.as_ref());
            });
        }
        drop(range_rx);
    });

    crate::util::check_cancelled()?;
    if failed.load(Ordering::SeqCst) {
        return Err(first_error
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .unwrap_or_else(|| PilotError::Fatal("下载失败且无错误详情".to_string()).into()));
    }
    Ok(())
}

fn record_error(slot: &Mutex<Option<anyhow::Error>>, e: anyhow::Error) {
    if let Ok(mut s) = slot.lock()
        && s.is_none()
    {
        *s = Some(e);
    }
}

fn discard_artifacts(target: &Path, enc_path: &Path) {
    let _ = std::fs::remove_file(enc_path);
    DownloadSession::remove(target);
}
