// Object store seam. The engines speak `StoreLike`; `HttpStore` is the
// production implementation against the storage endpoint named by the leased
// credentials. Tests substitute in-memory stores.

use std::time::Duration;

use crate::PilotError;
use crate::api::{StorageCredentials, classify_reqwest};

/// Receipt for one uploaded part. The store may echo a server-side checksum;
/// when present the engine compares it against the local digest.
#[derive(Debug, Clone)]
pub struct PartReceipt {
    pub etag: String,
    pub sha256: Option<String>,
}

pub trait StoreLike: Send + Sync {
    /// Upload one part; parts are 1-based. Returns the store receipt.
    fn upload_part(
        &self,
        creds: &StorageCredentials,
        object_key: &str,
        part_number: u32,
        data: &[u8],
    ) -> anyhow::Result<PartReceipt>;

    /// Complete a multipart upload from the collected (part_number, etag)
    /// pairs. Every part must carry a non-empty etag.
    fn complete_multipart(
        &self,
        creds: &StorageCredentials,
        object_key: &str,
        etags: &[(u32, String)],
    ) -> anyhow::Result<()>;

    /// Fetch one byte range of an object.
    fn get_range(
        &self,
        creds: &StorageCredentials,
        object_key: &str,
        offset: u64,
        len: u64,
    ) -> anyhow::Result<Vec<u8>>;

    fn object_len(&self, creds: &StorageCredentials, object_key: &str) -> anyhow::Result<u64>;
}

pub struct HttpStore {
    http: reqwest::blocking::Client,
}

impl HttpStore {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PilotError::Fatal(format!("构建存储客户端失败: {}", e)))?;
        Ok(HttpStore { http })
    }

    fn object_url(creds: &StorageCredentials, object_key: &str) -> String {
        format!("{}/{}", creds.endpoint.trim_end_matches('/'), object_key)
    }
}

impl StoreLike for HttpStore {
    fn upload_part(
        &self,
        creds: &StorageCredentials,
        object_key: &str,
        part_number: u32,
        data: &[u8],
    ) -> anyhow::Result<PartReceipt> {
        let ctx = format!("上传分片 {}#{}", object_key, part_number);
        let resp = self
            .http
            .put(format!("{}?part_number={}", Self::object_url(creds, object_key), part_number))
            .bearer_auth(&creds.token)
            .body(data.to_vec())
            .send()
            .map_err(|e| classify_reqwest(&e, &ctx))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PilotError::from_status(status.as_u16(), &ctx).into());
        }
        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .ok_or_else(|| PilotError::Fatal(format!("{}: 响应缺少 etag", ctx)))?;
        let sha256 = resp
            .headers()
            .get("x-checksum-sha256")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok(PartReceipt { etag, sha256 })
    }

    fn complete_multipart(
        &self,
        creds: &StorageCredentials,
        object_key: &str,
        etags: &[(u32, String)],
    ) -> anyhow::Result<()> {
        let ctx = format!("完成分片上传 {}", object_key);
        if etags.iter().any(|(_, e)| e.is_empty()) {
            return Err(PilotError::Fatal(format!("{}: 存在空 etag", ctx)).into());
        }
        let parts: Vec<serde_json::Value> = etags
            .iter()
            .map(|(n, e)| serde_json::json!({ "part_number": n, "etag": e }))
            .collect();
        let resp = self
            .http
            .post(format!("{}?complete", Self::object_url(creds, object_key)))
            .bearer_auth(&creds.token)
            .json(&serde_json::json!({ "parts": parts }))
            .send()
            .map_err(|e| classify_reqwest(&e, &ctx))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PilotError::from_status(status.as_u16(), &ctx).into());
        }
        Ok(())
    }

    fn get_range(
        &self,
        creds: &StorageCredentials,
        object_key: &str,
        offset: u64,
        len: u64,
    ) -> anyhow::Result<Vec<u8>> {
        let ctx = format!("下载范围 {}@{}+{}", object_key, offset, len);
        let resp = self
            .http
            .get(Self::object_url(creds, object_key))
            .bearer_auth(&creds.token)
            .header("Range", format!("bytes={}-{}", offset, offset + len - 1))
            .send()
            .map_err(|e| classify_reqwest(&e, &ctx))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PilotError::from_status(status.as_u16(), &ctx).into());
        }
        let body = resp.bytes().map_err(|e| classify_reqwest(&e, &ctx))?;
        if body.len() as u64 != len {
            return Err(PilotError::Transient(format!(
                "{}: 返回 {} 字节，期望 {}",
                ctx,
                body.len(),
                len
            ))
            .into());
        }
        Ok(body.to_vec())
    }

    fn object_len(&self, creds: &StorageCredentials, object_key: &str) -> anyhow::Result<u64> {
        let ctx = format!("查询对象长度 {}", object_key);
        let resp = self
            .http
            .head(Self::object_url(creds, object_key))
            .bearer_auth(&creds.token)
            .send()
            .map_err(|e| classify_reqwest(&e, &ctx))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PilotError::from_status(status.as_u16(), &ctx).into());
        }
        resp.headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| PilotError::Fatal(format!("{}: 缺少 content-length", ctx)).into())
    }
}
