// Shared in-memory platform used by the integration suites: a ComputeApi
// mock with files/folders/jobs and a StoreLike mock with part/range level
// fault injection.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use jobpilot::PilotError;
use jobpilot::api::{
    ComputeApi, JobOutputFile, JobSpec, NewFileRecord, RemoteEntry, RemoteFileMeta, RemoteJob,
    StorageCredentials,
};
use jobpilot::codec::{self, EncryptingReader, FileKey};
use jobpilot::transfer::store::{PartReceipt, StoreLike};

#[derive(Default, Clone)]
pub struct FileRec {
    pub name: String,
    pub folder: Option<String>,
    pub decrypted_size: u64,
    pub encrypted_size: u64,
    pub key: String,
    pub iv: String,
    pub plaintext_sha256: Option<String>,
    pub encrypted_sha256: Option<String>,
    pub object_key: String,
    pub finalized: bool,
}

#[derive(Default, Clone)]
pub struct JobRec {
    pub name: String,
    pub status: String,
    pub token: String,
    pub input_file_ids: Vec<String>,
    pub outputs: Vec<JobOutputFile>,
}

#[derive(Default)]
struct ApiState {
    files: HashMap<String, FileRec>,
    folders: HashMap<String, (String, Option<String>)>,
    jobs: BTreeMap<String, JobRec>,
    next: u32,
}

#[derive(Default)]
pub struct MockApi {
    state: Mutex<ApiState>,
    pub enforce_unique_names: bool,
    pub create_file_calls: AtomicUsize,
    pub create_job_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub list_jobs_calls: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self {
        MockApi::default()
    }

    pub fn with_unique_names() -> Self {
        MockApi { enforce_unique_names: true, ..MockApi::default() }
    }

    fn next_id(state: &mut ApiState, prefix: &str) -> String {
        state.next += 1;
        format!("{}{}", prefix, state.next)
    }

    pub fn file(&self, id: &str) -> Option<FileRec> {
        self.state.lock().unwrap().files.get(id).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    pub fn job(&self, id: &str) -> Option<JobRec> {
        self.state.lock().unwrap().jobs.get(id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn jobs_with_status(&self, status: &str) -> Vec<JobRec> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect()
    }

    pub fn add_job(&self, id: &str, name: &str, status: &str) {
        self.state.lock().unwrap().jobs.insert(
            id.to_string(),
            JobRec {
                name: name.to_string(),
                status: status.to_string(),
                token: String::new(),
                input_file_ids: Vec::new(),
                outputs: Vec::new(),
            },
        );
    }

    pub fn add_job_with_token(&self, id: &str, name: &str, status: &str, token: &str) {
        self.state.lock().unwrap().jobs.insert(
            id.to_string(),
            JobRec {
                name: name.to_string(),
                status: status.to_string(),
                token: token.to_string(),
                input_file_ids: Vec::new(),
                outputs: Vec::new(),
            },
        );
    }

    pub fn add_job_output(&self, job_id: &str, file_id: &str, name: &str, size: u64) {
        let mut st = self.state.lock().unwrap();
        if let Some(j) = st.jobs.get_mut(job_id) {
            j.outputs.push(JobOutputFile {
                id: file_id.to_string(),
                name: name.to_string(),
                rel_path: name.to_string(),
                size,
            });
        }
    }

    /// Register a fully finalized remote file record (used together with
    /// `MemStore::put_object` to seed downloadable content).
    pub fn register_file(&self, id: &str, rec: FileRec) {
        self.state.lock().unwrap().files.insert(id.to_string(), rec);
    }
}

impl ComputeApi for MockApi {
    fn storage_credentials(&self) -> anyhow::Result<StorageCredentials> {
        Ok(StorageCredentials {
            endpoint: "mem://store".to_string(),
            token: "test-token".to_string(),
            expires_in_secs: 600,
        })
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
        self.create_file_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().unwrap();
        if self.enforce_unique_names {
            let exists = st
                .files
                .values()
                .any(|f| f.name == name && f.folder.as_deref() == folder_id);
            if exists {
                return Err(PilotError::Conflict(format!("文件已存在: {}", name)).into());
            }
        }
        let id = Self::next_id(&mut st, "F");
        let object_key = format!("obj/{}", id);
        st.files.insert(
            id.clone(),
            FileRec {
                name: name.to_string(),
                folder: folder_id.map(String::from),
                decrypted_size,
                encrypted_size,
                key: key_b64.to_string(),
                iv: iv_b64.to_string(),
                plaintext_sha256: Some(plaintext_sha256.to_string()),
                encrypted_sha256: None,
                object_key: object_key.clone(),
                finalized: false,
            },
        );
        Ok(NewFileRecord { id, object_key })
    }

    fn finalize_file(&self, file_id: &str, encrypted_sha256: &str) -> anyhow::Result<()> {
        let mut st = self.state.lock().unwrap();
        let rec = st
            .files
            .get_mut(file_id)
            .ok_or_else(|| PilotError::Fatal(format!("未知文件 {}", file_id)))?;
        rec.encrypted_sha256 = Some(encrypted_sha256.to_string());
        rec.finalized = true;
        Ok(())
    }

    fn file_meta(&self, file_id: &str) -> anyhow::Result<RemoteFileMeta> {
        let st = self.state.lock().unwrap();
        let rec = st
            .files
            .get(file_id)
            .ok_or_else(|| PilotError::Fatal(format!("未知文件 {}", file_id)))?;
        Ok(RemoteFileMeta {
            id: file_id.to_string(),
            name: rec.name.clone(),
            decrypted_size: rec.decrypted_size,
            object_key: rec.object_key.clone(),
            key: rec.key.clone(),
            iv: rec.iv.clone(),
            encrypted_sha256: rec.encrypted_sha256.clone(),
            plaintext_sha256: rec.plaintext_sha256.clone(),
        })
    }

    fn delete_file(&self, file_id: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().files.remove(file_id);
        Ok(())
    }

    fn list_folder(&self, folder_id: Option<&str>) -> anyhow::Result<Vec<RemoteEntry>> {
        let st = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (id, (name, parent)) in &st.folders {
            if parent.as_deref() == folder_id {
                out.push(RemoteEntry {
                    id: id.clone(),
                    name: name.clone(),
                    is_folder: true,
                    size: 0,
                });
            }
        }
        for (id, f) in &st.files {
            if f.folder.as_deref() == folder_id {
                out.push(RemoteEntry {
                    id: id.clone(),
                    name: f.name.clone(),
                    is_folder: false,
                    size: f.decrypted_size,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn create_folder(&self, name: &str, parent_id: Option<&str>) -> anyhow::Result<String> {
        let mut st = self.state.lock().unwrap();
        let exists = st
            .folders
            .values()
            .any(|(n, p)| n == name && p.as_deref() == parent_id);
        if exists {
            return Err(PilotError::Conflict(format!("目录已存在: {}", name)).into());
        }
        let id = Self::next_id(&mut st, "D");
        st.folders.insert(id.clone(), (name.to_string(), parent_id.map(String::from)));
        Ok(id)
    }

    fn delete_folder(&self, folder_id: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().folders.remove(folder_id);
        Ok(())
    }

    fn create_job(&self, spec: &JobSpec, correlation_token: &str) -> anyhow::Result<String> {
        self.create_job_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().unwrap();
        let id = Self::next_id(&mut st, "J");
        st.jobs.insert(
            id.clone(),
            JobRec {
                name: spec.name.clone(),
                status: "Created".to_string(),
                token: correlation_token.to_string(),
                input_file_ids: spec.input_file_ids.clone(),
                outputs: Vec::new(),
            },
        );
        Ok(id)
    }

    fn find_job_by_token(&self, correlation_token: &str) -> anyhow::Result<Option<String>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .jobs
            .iter()
            .find(|(_, j)| !j.token.is_empty() && j.token == correlation_token)
            .map(|(id, _)| id.clone()))
    }

    fn submit_job(&self, job_id: &str) -> anyhow::Result<()> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().unwrap();
        let job = st
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PilotError::Fatal(format!("未知任务 {}", job_id)))?;
        job.status = "Submitted".to_string();
        Ok(())
    }

    fn stop_job(&self, job_id: &str) -> anyhow::Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(j) = st.jobs.get_mut(job_id) {
            j.status = "Stopped".to_string();
        }
        Ok(())
    }

    fn delete_job(&self, job_id: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().jobs.remove(job_id);
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> anyhow::Result<RemoteJob> {
        let st = self.state.lock().unwrap();
        let j = st
            .jobs
            .get(job_id)
            .ok_or_else(|| PilotError::Fatal(format!("未知任务 {}", job_id)))?;
        Ok(RemoteJob { id: job_id.to_string(), name: j.name.clone(), status: j.status.clone() })
    }

    fn list_jobs(&self) -> anyhow::Result<Vec<RemoteJob>> {
        self.list_jobs_calls.fetch_add(1, Ordering::SeqCst);
        let st = self.state.lock().unwrap();
        Ok(st
            .jobs
            .iter()
            .map(|(id, j)| RemoteJob {
                id: id.clone(),
                name: j.name.clone(),
                status: j.status.clone(),
            })
            .collect())
    }

    fn job_output_files(&self, job_id: &str) -> anyhow::Result<Vec<JobOutputFile>> {
        let st = self.state.lock().unwrap();
        let j = st
            .jobs
            .get(job_id)
            .ok_or_else(|| PilotError::Fatal(format!("未知任务 {}", job_id)))?;
        Ok(j.outputs.clone())
    }

    fn tail_file(
        &self,
        _job_id: &str,
        _file_name: &str,
        offset: u64,
    ) -> anyhow::Result<(String, u64)> {
        Ok((String::new(), offset))
    }
}

#[derive(Default)]
pub struct MemStore {
    parts: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub part_uploads: AtomicUsize,
    pub range_gets: AtomicUsize,
    fail_parts_remaining: AtomicUsize,
    fail_ranges_remaining: AtomicUsize,
    wrong_sha_remaining: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Make the next `n` part uploads fail with a transient error.
    pub fn fail_next_parts(&self, n: usize) {
        self.fail_parts_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_ranges(&self, n: usize) {
        self.fail_ranges_remaining.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` part receipts carry a wrong checksum.
    pub fn wrong_sha_next(&self, n: usize) {
        self.wrong_sha_remaining.store(n, Ordering::SeqCst);
    }

    pub fn put_object(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn recorded_parts(&self, key: &str) -> usize {
        self.parts.lock().unwrap().get(key).map(|m| m.len()).unwrap_or(0)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

impl StoreLike for MemStore {
    fn upload_part(
        &self,
        _creds: &StorageCredentials,
        object_key: &str,
        part_number: u32,
        data: &[u8],
    ) -> anyhow::Result<PartReceipt> {
        self.part_uploads.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_parts_remaining) {
            return Err(PilotError::Transient("injected part failure".to_string()).into());
        }
        let sha = if Self::take(&self.wrong_sha_remaining) {
            Some("deadbeef".to_string())
        } else {
            Some(codec::sha256_bytes(data))
        };
        self.parts
            .lock()
            .unwrap()
            .entry(object_key.to_string())
            .or_default()
            .insert(part_number, data.to_vec());
        Ok(PartReceipt { etag: format!("etag-{}", part_number), sha256: sha })
    }

    fn complete_multipart(
        &self,
        _creds: &StorageCredentials,
        object_key: &str,
        etags: &[(u32, String)],
    ) -> anyhow::Result<()> {
        if etags.iter().any(|(_, e)| e.is_empty()) {
            return Err(PilotError::Fatal("空 etag".to_string()).into());
        }
        let parts = self.parts.lock().unwrap();
        let recorded = parts
            .get(object_key)
            .ok_or_else(|| PilotError::Fatal(format!("无分片记录 {}", object_key)))?;
        if recorded.len() != etags.len() {
            return Err(PilotError::Fatal(format!(
                "分片数不符: {} != {}",
                recorded.len(),
                etags.len()
            ))
            .into());
        }
        let mut body = Vec::new();
        for (_, data) in recorded.iter() {
            body.extend_from_slice(data);
        }
        drop(parts);
        self.objects.lock().unwrap().insert(object_key.to_string(), body);
        Ok(())
    }

    fn get_range(
        &self,
        _creds: &StorageCredentials,
        object_key: &str,
        offset: u64,
        len: u64,
    ) -> anyhow::Result<Vec<u8>> {
        self.range_gets.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_ranges_remaining) {
            return Err(PilotError::Transient("injected range failure".to_string()).into());
        }
        let objects = self.objects.lock().unwrap();
        let body = objects
            .get(object_key)
            .ok_or_else(|| PilotError::Fatal(format!("无对象 {}", object_key)))?;
        let start = offset as usize;
        let end = (offset + len) as usize;
        if end > body.len() {
            return Err(PilotError::Transient(format!(
                "范围越界: {}..{} > {}",
                start,
                end,
                body.len()
            ))
            .into());
        }
        Ok(body[start..end].to_vec())
    }

    fn object_len(
        &self,
        _creds: &StorageCredentials,
        object_key: &str,
    ) -> anyhow::Result<u64> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(object_key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| PilotError::Fatal(format!("无对象 {}", object_key)).into())
    }
}

/// Seed a downloadable remote file: encrypt `plaintext`, register the record
/// on the api and store the ciphertext object. Returns the file id.
pub fn seed_remote_file(api: &MockApi, store: &MemStore, id: &str, name: &str, plaintext: &[u8]) {
    let key = FileKey::generate();
    let (key_b64, iv_b64) = key.to_b64();
    let mut ciphertext = Vec::new();
    let mut reader = EncryptingReader::new(std::io::Cursor::new(plaintext.to_vec()), &key);
    reader.read_to_end(&mut ciphertext).unwrap();
    let object_key = format!("obj/{}", id);
    api.register_file(
        id,
        FileRec {
            name: name.to_string(),
            folder: None,
            decrypted_size: plaintext.len() as u64,
            encrypted_size: ciphertext.len() as u64,
            key: key_b64,
            iv: iv_b64,
            plaintext_sha256: Some(codec::sha256_bytes(plaintext)),
            encrypted_sha256: Some(codec::sha256_bytes(&ciphertext)),
            object_key: object_key.clone(),
            finalized: true,
        },
    );
    store.put_object(&object_key, ciphertext);
}
