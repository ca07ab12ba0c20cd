// Remote platform API client. The `ComputeApi` trait is the seam the
// pipeline, transfer engines and daemon program against; `ApiClient` is the
// production implementation over HTTP. Every outbound call goes through the
// rate-limit lease client and maps HTTP failures onto the error kinds.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::PilotError;
use crate::ratelimit::client::LeaseClient;
use crate::ratelimit::proto::ReleaseOutcome;

/// Storage credentials leased from the platform; cached process-wide.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageCredentials {
    pub endpoint: String,
    pub token: String,
    #[serde(default = "default_expiry_secs")]
    pub expires_in_secs: u64,
}

fn default_expiry_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFileRecord {
    pub id: String,
    pub object_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFileMeta {
    pub id: String,
    pub name: String,
    pub decrypted_size: u64,
    pub object_key: String,
    pub key: String,
    pub iv: String,
    #[serde(default)]
    pub encrypted_sha256: Option<String>,
    #[serde(default)]
    pub plaintext_sha256: Option<String>,
}

/// One entry of a remote folder listing: a file or a sub-folder.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJob {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// An output file of a finished job, with its path relative to the job's
/// output root.
#[derive(Debug, Clone, Deserialize)]
pub struct JobOutputFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rel_path: String,
    pub size: u64,
}

/// Everything the platform needs to create a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    pub analysis_code: String,
    pub analysis_version: String,
    pub core_type: String,
    pub walltime_hours: f64,
    pub input_file_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

/// The platform capabilities the engines consume. Kept narrow on purpose:
/// wire details live behind it, mocks implement it in tests.
pub trait ComputeApi: Send + Sync {
    fn storage_credentials(&self) -> anyhow::Result<StorageCredentials>;

    // files
    fn create_file(
        &self,
        name: &str,
        folder_id: Option<&str>,
        decrypted_size: u64,
        encrypted_size: u64,
        key_b64: &str,
        iv_b64: &str,
        plaintext_sha256: &str,
    ) -> anyhow::Result<NewFileRecord>;
    fn finalize_file(&self, file_id: &str, encrypted_sha256: &str) -> anyhow::Result<()>;
    fn file_meta(&self, file_id: &str) -> anyhow::Result<RemoteFileMeta>;
    fn delete_file(&self, file_id: &str) -> anyhow::Result<()>;

    // folders
    fn list_folder(&self, folder_id: Option<&str>) -> anyhow::Result<Vec<RemoteEntry>>;
    fn create_folder(&self, name: &str, parent_id: Option<&str>) -> anyhow::Result<String>;
    fn delete_folder(&self, folder_id: &str) -> anyhow::Result<()>;

    // jobs
    fn create_job(&self, spec: &JobSpec, correlation_token: &str) -> anyhow::Result<String>;
    fn find_job_by_token(&self, correlation_token: &str) -> anyhow::Result<Option<String>>;
    fn submit_job(&self, job_id: &str) -> anyhow::Result<()>;
    fn stop_job(&self, job_id: &str) -> anyhow::Result<()>;
    fn delete_job(&self, job_id: &str) -> anyhow::Result<()>;
    fn get_job(&self, job_id: &str) -> anyhow::Result<RemoteJob>;
    fn list_jobs(&self) -> anyhow::Result<Vec<RemoteJob>>;
    fn job_output_files(&self, job_id: &str) -> anyhow::Result<Vec<JobOutputFile>>;
    fn tail_file(
        &self,
        job_id: &str,
        file_name: &str,
        offset: u64,
    ) -> anyhow::Result<(String, u64)>;
}

pub struct ApiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    limiter: Mutex<LeaseClient>,
    // (credentials, fetched_at); refreshed by the first caller to observe
    // expiry, concurrent refreshers coalesce on the mutex
    creds_cache: Mutex<Option<(StorageCredentials, Instant)>>,
}

const CREDS_TTL: Duration = Duration::from_secs(600);

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PilotError::Fatal(format!("构建 HTTP 客户端失败: {}", e)))?;
        Ok(ApiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter: Mutex::new(LeaseClient::new()),
            creds_cache: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Run one outbound call under a rate-limit lease, reporting the outcome
    /// back to the coordinator so throttled replies raise the cooldown.
    fn with_lease<T>(
        &self,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        crate::util::check_cancelled()?;
        let lease = match self.limiter.lock() {
            Ok(mut l) => l.acquire(crate::ratelimit::API_BUCKET),
            Err(_) => None,
        };
        let res = f();
        if let Some(lease_id) = lease
            && let Ok(mut l) = self.limiter.lock()
        {
            let outcome = match &res {
                Ok(_) => ReleaseOutcome::Ok,
                Err(e) => {
                    let throttled = e
                        .downcast_ref::<PilotError>()
                        .map(|pe| matches!(pe, PilotError::Transient(m) if m.contains("429")))
                        .unwrap_or(false);
                    if throttled { ReleaseOutcome::Throttled } else { ReleaseOutcome::Error }
                }
            };
            l.release(&lease_id, outcome);
        }
        res
    }

    fn send(
        &self,
        req: reqwest::blocking::RequestBuilder,
        context: &str,
    ) -> anyhow::Result<reqwest::blocking::Response> {
        let resp = req
            .header("Authorization", format!("Token {}", self.api_key))
            .send()
            .map_err(|e| classify_reqwest(&e, context))?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(PilotError::from_status(status.as_u16(), context).into())
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, context: &str) -> anyhow::Result<T> {
        self.with_lease(|| {
            let resp = self.send(self.http.get(self.url(path)), context)?;
            resp.json::<T>()
                .map_err(|e| PilotError::Fatal(format!("{}: 响应解析失败: {}", context, e)).into())
        })
    }

    fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        context: &str,
    ) -> anyhow::Result<T> {
        self.with_lease(|| {
            let resp = self.send(self.http.post(self.url(path)).json(body), context)?;
            resp.json::<T>()
                .map_err(|e| PilotError::Fatal(format!("{}: 响应解析失败: {}", context, e)).into())
        })
    }

    fn post_empty<B: Serialize>(&self, path: &str, body: &B, context: &str) -> anyhow::Result<()> {
        self.with_lease(|| {
            self.send(self.http.post(self.url(path)).json(body), context)?;
            Ok(())
        })
    }

    fn delete(&self, path: &str, context: &str) -> anyhow::Result<()> {
        self.with_lease(|| {
            self.send(self.http.delete(self.url(path)), context)?;
            Ok(())
        })
    }
}

pub fn classify_reqwest(e: &reqwest::Error, context: &str) -> PilotError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        PilotError::Transient(format!("{} — {}", context, e))
    } else {
        PilotError::Fatal(format!("{} — {}", context, e))
    }
}

impl ComputeApi for ApiClient {
    fn storage_credentials(&self) -> anyhow::Result<StorageCredentials> {
        let mut cache = self
            .creds_cache
            .lock()
            .map_err(|_| PilotError::Fatal("凭证缓存锁被破坏".to_string()))?;
        if let Some((creds, at)) = cache.as_ref() {
            let ttl = CREDS_TTL.min(Duration::from_secs(creds.expires_in_secs));
            if at.elapsed() < ttl {
                return Ok(creds.clone());
            }
        }
        let creds: StorageCredentials =
            self.post_json("/credentials/storage", &serde_json::json!({}), "获取存储凭证")?;
        *cache = Some((creds.clone(), Instant::now()));
        Ok(creds)
    }

    fn create_file(
        &self,
        name: &str,
        folder_id: Option<&str>,
        decrypted_size: u64,
        encrypted_size: u64,
        key_b64: &str,
        iv_b64: &str,
        plaintext_sha256: &str,
    ) -> anyhow::Result<NewFileRecord> {
        let body = serde_json::json!({
            "name": name,
            "folder_id": folder_id,
            "decrypted_size": decrypted_size,
            "encrypted_size": encrypted_size,
            "key": key_b64,
            "iv": iv_b64,
            "plaintext_sha256": plaintext_sha256,
        });
        self.post_json("/files", &body, &format!("创建文件记录 {}", name))
    }

    fn finalize_file(&self, file_id: &str, encrypted_sha256: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({ "encrypted_sha256": encrypted_sha256 });
        self.post_empty(
            &format!("/files/{}/finalize", file_id),
            &body,
            &format!("完成文件 {}", file_id),
        )
    }

    fn file_meta(&self, file_id: &str) -> anyhow::Result<RemoteFileMeta> {
        self.get_json(&format!("/files/{}", file_id), &format!("查询文件 {}", file_id))
    }

    fn delete_file(&self, file_id: &str) -> anyhow::Result<()> {
        self.delete(&format!("/files/{}", file_id), &format!("删除文件 {}", file_id))
    }

    fn list_folder(&self, folder_id: Option<&str>) -> anyhow::Result<Vec<RemoteEntry>> {
        let path = match folder_id {
            Some(id) => format!("/folders/{}/contents", id),
            None => "/folders/root/contents".to_string(),
        };
        self.get_json(&path, "列出目录内容")
    }

    fn create_folder(&self, name: &str, parent_id: Option<&str>) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct R {
            id: String,
        }
        let body = serde_json::json!({ "name": name, "parent_id": parent_id });
        let r: R = self.post_json("/folders", &body, &format!("创建目录 {}", name))?;
        Ok(r.id)
    }

    fn delete_folder(&self, folder_id: &str) -> anyhow::Result<()> {
        self.delete(&format!("/folders/{}", folder_id), &format!("删除目录 {}", folder_id))
    }

    fn create_job(&self, spec: &JobSpec, correlation_token: &str) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct R {
            id: String,
        }
        let mut body = serde_json::to_value(spec)
            .map_err(|e| PilotError::Fatal(format!("序列化任务失败: {}", e)))?;
        body["correlation_token"] = serde_json::Value::String(correlation_token.to_string());
        let r: R = self.post_json("/jobs", &body, &format!("创建任务 {}", spec.name))?;
        Ok(r.id)
    }

    fn find_job_by_token(&self, correlation_token: &str) -> anyhow::Result<Option<String>> {
        #[derive(Deserialize)]
        struct R {
            jobs: Vec<RemoteJob>,
        }
        let r: R = self.get_json(
            &format!("/jobs?correlation_token={}", correlation_token),
            "按关联令牌查询任务",
        )?;
        Ok(r.jobs.into_iter().next().map(|j| j.id))
    }

    fn submit_job(&self, job_id: &str) -> anyhow::Result<()> {
        self.post_empty(
            &format!("/jobs/{}/submit", job_id),
            &serde_json::json!({}),
            &format!("提交任务 {}", job_id),
        )
    }

    fn stop_job(&self, job_id: &str) -> anyhow::Result<()> {
        self.post_empty(
            &format!("/jobs/{}/stop", job_id),
            &serde_json::json!({}),
            &format!("停止任务 {}", job_id),
        )
    }

    fn delete_job(&self, job_id: &str) -> anyhow::Result<()> {
        self.delete(&format!("/jobs/{}", job_id), &format!("删除任务 {}", job_id))
    }

    fn get_job(&self, job_id: &str) -> anyhow::Result<RemoteJob> {
        self.get_json(&format!("/jobs/{}", job_id), &format!("查询任务 {}", job_id))
    }

    fn list_jobs(&self) -> anyhow::Result<Vec<RemoteJob>> {
        #[derive(Deserialize)]
        struct R {
            jobs: Vec<RemoteJob>,
        }
        let r: R = self.get_json("/jobs", "列出任务")?;
        Ok(r.jobs)
    }

    fn job_output_files(&self, job_id: &str) -> anyhow::Result<Vec<JobOutputFile>> {
        #[derive(Deserialize)]
        struct R {
            files: Vec<JobOutputFile>,
        }
        let r: R = self.get_json(
            &format!("/jobs/{}/files", job_id),
            &format!("列出任务输出 {}", job_id),
        )?;
        Ok(r.files)
    }

    fn tail_file(
        &self,
        job_id: &str,
        file_name: &str,
        offset: u64,
    ) -> anyhow::Result<(String, u64)> {
        #[derive(Deserialize)]
        struct R {
            data: String,
            offset: u64,
        }
        let r: R = self.get_json(
            &format!("/jobs/{}/files/tail?name={}&offset={}", job_id, file_name, offset),
            &format!("读取任务输出尾部 {}", job_id),
        )?;
        Ok((r.data, r.offset))
    }
}
