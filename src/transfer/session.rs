// Durable transfer sessions. Each partially transferred file carries a JSON
// sidecar next to the local path so any later process can resume it from the
// source/target path alone.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upload sessions expire after this long; the source may have moved on.
const SESSION_TTL_HOURS: i64 = 24;

const UPLOAD_SUFFIX: &str = ".jpup.json";
const DOWNLOAD_SUFFIX: &str = ".jpdl.json";

/// Identity of a local source file at session creation time. A changed
/// length or mtime invalidates the session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFingerprint {
    pub len: u64,
    pub mtime_unix: i64,
}

impl SourceFingerprint {
    pub fn of(path: &Path) -> anyhow::Result<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|e| crate::PilotError::from_io(&e, "读取源文件元数据"))?;
        let mtime_unix = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(SourceFingerprint { len: meta.len(), mtime_unix })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
    pub sha256: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploadSession {
    pub source: SourceFingerprint,
    pub file_id: String,
    pub object_key: String,
    pub part_size: u64,
    pub total_parts: u32,
    pub key_b64: String,
    pub iv_b64: String,
    pub parts: Vec<PartRecord>,
    pub created_at: DateTime<Utc>,
}

fn sidecar_path(base: &Path, suffix: &str) -> PathBuf {
    let name = base.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    base.with_file_name(format!("{}{}", name, suffix))
}

impl UploadSession {
    pub fn path_for(source: &Path) -> PathBuf {
        sidecar_path(source, UPLOAD_SUFFIX)
    }

    /// Load the sidecar for `source`; unreadable or unparsable sidecars are
    /// treated as absent.
    pub fn load(source: &Path) -> Option<UploadSession> {
        let raw = std::fs::read_to_string(Self::path_for(source)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save(&self, source: &Path) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::PilotError::Fatal(format!("序列化上传会话失败: {}", e)))?;
        crate::util::atomic_write(&Self::path_for(source), &body)
            .map_err(|e| crate::PilotError::from_io(&e, "写入上传会话").into())
    }

    pub fn remove(source: &Path) {
        let _ = std::fs::remove_file(Self::path_for(source));
    }

    /// A session is resumable iff the source fingerprint still matches and
    /// the session is younger than the TTL.
    pub fn is_valid_for(&self, fingerprint: &SourceFingerprint, now: DateTime<Utc>) -> bool {
        self.source == *fingerprint
            && now.signed_duration_since(self.created_at) < chrono::Duration::hours(SESSION_TTL_HOURS)
    }

    pub fn completed_parts(&self) -> std::collections::HashSet<u32> {
        self.parts.iter().map(|p| p.part_number).collect()
    }

    /// A part is recorded only after the store acknowledged it.
    pub fn record_part(&mut self, part_number: u32, etag: String, sha256: String) {
        self.parts.retain(|p| p.part_number != part_number);
        self.parts.push(PartRecord { part_number, etag, sha256, completed_at: Utc::now() });
        self.parts.sort_by_key(|p| p.part_number);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RangeRecord {
    pub offset: u64,
    pub length: u64,
    pub done: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadSession {
    pub file_id: String,
    pub decrypted_size: u64,
    pub key_b64: String,
    pub iv_b64: String,
    #[serde(default)]
    pub encrypted_sha256: Option<String>,
    #[serde(default)]
    pub plaintext_sha256: Option<String>,
    pub ranges: Vec<RangeRecord>,
    pub created_at: DateTime<Utc>,
}

impl DownloadSession {
    pub fn path_for(target: &Path) -> PathBuf {
        sidecar_path(target, DOWNLOAD_SUFFIX)
    }

    pub fn load(target: &Path) -> Option<DownloadSession> {
        let raw = std::fs::read_to_string(Self::path_for(target)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save(&self, target: &Path) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::PilotError::Fatal(format!("序列化下载会话失败: {}", e)))?;
        crate::util::atomic_write(&Self::path_for(target), &body)
            .map_err(|e| crate::PilotError::from_io(&e, "写入下载会话").into())
    }

    pub fn remove(target: &Path) {
        let _ = std::fs::remove_file(Self::path_for(target));
    }

    pub fn missing_ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.iter().filter(|r| !r.done).map(|r| (r.offset, r.length)).collect()
    }

    pub fn mark_done(&mut self, offset: u64) {
        for r in self.ranges.iter_mut() {
            if r.offset == offset {
                r.done = true;
            }
        }
    }
}
