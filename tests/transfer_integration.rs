// Upload/download engine scenarios: part-level resume, checksum handling,
// the triple resume check and collision-safe job output downloads.

mod common;

use std::path::Path;
use std::sync::atomic::Ordering;

use common::{MemStore, MockApi, seed_remote_file};
use jobpilot::PilotError;
use jobpilot::api::ComputeApi;
use jobpilot::codec;
use jobpilot::config::UploadCheck;
use jobpilot::transfer::TransferGovernor;
use jobpilot::transfer::download::{DownloadRequest, download_file};
use jobpilot::transfer::session::{DownloadSession, UploadSession};
use jobpilot::transfer::upload::{UploadRequest, upload_file};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

fn upload_req(source: &Path) -> UploadRequest<'_> {
    UploadRequest {
        source,
        remote_name: None,
        folder_id: None,
        check: UploadCheck::Fast,
        policy: None,
        max_retries: 1,
        progress: None,
        total_pb: None,
    }
}

fn download_req<'a>(file_id: &'a str, target: &'a Path) -> DownloadRequest<'a> {
    DownloadRequest {
        file_id,
        target,
        skip_checksum: false,
        max_retries: 1,
        progress: None,
        total_pb: None,
    }
}

fn decrypt_remote(api: &MockApi, store: &MemStore, file_id: &str) -> Vec<u8> {
    let meta = api.file_meta(file_id).unwrap();
    let body = store.object(&meta.object_key).unwrap();
    let key = codec::FileKey::from_b64(&meta.key, &meta.iv).unwrap();
    let mut plain = Vec::new();
    codec::decrypt_stream(std::io::Cursor::new(body), &mut plain, &key).unwrap();
    plain
}

#[test]
fn upload_roundtrips_and_cleans_session() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.dat");
    let data = payload(3 * 1024 * 1024);
    std::fs::write(&source, &data).unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);

    let file_id = upload_file(&api, &store, &governor, upload_req(&source)).unwrap();
    assert_eq!(decrypt_remote(&api, &store, &file_id), data);
    assert!(api.file(&file_id).unwrap().finalized);
    assert!(UploadSession::load(&source).is_none());
}

#[test]
fn interrupted_upload_resumes_missing_parts_only() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.dat");
    // 33 MiB -> 3 个 16 MiB 分片
    let data = payload(33 * 1024 * 1024);
    std::fs::write(&source, &data).unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);

    // 注入一次失败（max_retries=1，不做就地重试）→ 恰好一个分片缺失
    store.fail_next_parts(1);
    let err = upload_file(&api, &store, &governor, upload_req(&source)).unwrap_err();
    assert!(err.to_string().contains("injected"), "{}", err);

    let session = UploadSession::load(&source).expect("session survives the crash");
    assert_eq!(session.total_parts, 3);
    let missing = session.total_parts as usize - session.parts.len();
    assert!(missing >= 1);
    let attempts_before = store.part_uploads.load(Ordering::SeqCst);

    // 续传：只补缺失分片，文件在远端只出现一次
    let file_id = upload_file(&api, &store, &governor, upload_req(&source)).unwrap();
    let attempts_delta = store.part_uploads.load(Ordering::SeqCst) - attempts_before;
    assert_eq!(attempts_delta, missing);
    assert_eq!(api.create_file_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.file_count(), 1);
    assert_eq!(decrypt_remote(&api, &store, &file_id), data);
    assert!(UploadSession::load(&source).is_none());
}

#[test]
fn part_count_matches_size() {
    // 上传会话按 ceil(enc/part) 切分
    for (len, parts) in [
        (0usize, 1u32),
        (16 * 1024 * 1024 - 17, 1),
        (16 * 1024 * 1024, 2), // 填充越过 16 MiB 边界
        (33 * 1024 * 1024, 3),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("f.dat");
        std::fs::write(&source, payload(len)).unwrap();
        let api = MockApi::new();
        let store = MemStore::new();
        let governor = TransferGovernor::new(5, 16, true);
        let file_id = upload_file(&api, &store, &governor, upload_req(&source)).unwrap();
        let meta = api.file_meta(&file_id).unwrap();
        assert_eq!(store.recorded_parts(&meta.object_key) as u32, parts, "len={}", len);
    }
}

#[test]
fn wrong_part_checksum_retries_once_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("small.dat");
    std::fs::write(&source, payload(1024)).unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);

    // 一次错误校验和：重传一次后成功
    store.wrong_sha_next(1);
    assert!(upload_file(&api, &store, &governor, upload_req(&source)).is_ok());

    // 连续两次错误校验和：文件失败，错误为 integrity
    let source2 = dir.path().join("small2.dat");
    std::fs::write(&source2, payload(1024)).unwrap();
    store.wrong_sha_next(2);
    let err = upload_file(&api, &store, &governor, upload_req(&source2)).unwrap_err();
    assert_eq!(err.downcast_ref::<PilotError>().unwrap().kind(), "integrity");
}

#[test]
fn download_roundtrips_boundary_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);
    for (i, len) in [0usize, 15, 16, 17, 5 * 16, 256 * 1024].into_iter().enumerate() {
        let id = format!("FX{}", i);
        let data = payload(len);
        seed_remote_file(&api, &store, &id, "out.bin", &data);
        let target = dir.path().join(format!("out-{}.bin", i));
        let n = download_file(&api, &store, &governor, download_req(&id, &target)).unwrap();
        assert_eq!(n as usize, len);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        // 暂存与会话清理完毕
        assert!(!dir.path().join(format!("out-{}.bin.enc", i)).exists());
        assert!(DownloadSession::load(&target).is_none());
    }
}

#[test]
fn interrupted_download_resumes_missing_ranges_only() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);
    // 20 MiB -> 两个范围
    let data = payload(20 * 1024 * 1024);
    seed_remote_file(&api, &store, "F1", "big.bin", &data);
    let target = dir.path().join("big.bin");

    store.fail_next_ranges(1);
    assert!(download_file(&api, &store, &governor, download_req("F1", &target)).is_err());
    let session = DownloadSession::load(&target).expect("session survives");
    let missing = session.missing_ranges().len();
    assert!(missing >= 1 && missing <= session.ranges.len());

    let gets_before = store.range_gets.load(Ordering::SeqCst);
    let n = download_file(&api, &store, &governor, download_req("F1", &target)).unwrap();
    assert_eq!(store.range_gets.load(Ordering::SeqCst) - gets_before, missing);
    assert_eq!(n as usize, data.len());
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[test]
fn complete_encrypted_artifact_skips_network() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);
    let data = payload(64 * 1024);
    seed_remote_file(&api, &store, "F1", "model.sim", &data);
    let target = dir.path().join("model.sim");

    // 把完整密文预先放到暂存位置：三段判定的第一段命中
    let meta = api.file_meta("F1").unwrap();
    std::fs::write(dir.path().join("model.sim.enc"), store.object(&meta.object_key).unwrap())
        .unwrap();

    let n = download_file(&api, &store, &governor, download_req("F1", &target)).unwrap();
    assert_eq!(store.range_gets.load(Ordering::SeqCst), 0);
    assert_eq!(n as usize, data.len());
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[test]
fn corrupt_ciphertext_fails_and_leaves_no_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);
    let data = payload(64 * 1024);
    seed_remote_file(&api, &store, "F1", "model.sim", &data);
    let target = dir.path().join("model.sim");

    // 长度正确但内容损坏的暂存密文
    let meta = api.file_meta("F1").unwrap();
    let mut body = store.object(&meta.object_key).unwrap();
    body[100] ^= 0xff;
    std::fs::write(dir.path().join("model.sim.enc"), body).unwrap();

    let err =
        download_file(&api, &store, &governor, download_req("F1", &target)).unwrap_err();
    assert_eq!(err.downcast_ref::<PilotError>().unwrap().kind(), "integrity");
    assert!(!target.exists());
    // 损坏的暂存件已被丢弃，下次尝试从头再来
    assert!(!dir.path().join("model.sim.enc").exists());
}

#[test]
fn traversal_file_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);
    seed_remote_file(&api, &store, "F1", "../evil.sh", b"x");
    let target = dir.path().join("evil.sh");
    let err =
        download_file(&api, &store, &governor, download_req("F1", &target)).unwrap_err();
    assert_eq!(err.downcast_ref::<PilotError>().unwrap().kind(), "validation");
}

#[test]
fn colliding_job_outputs_get_distinct_paths() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);

    let a = payload(2048);
    let b = payload(4096);
    seed_remote_file(&api, &store, "ABC123", "model.sim", &a);
    seed_remote_file(&api, &store, "DEF456", "model.sim", &b);
    api.add_job("J1", "Sim_42", "Completed");
    api.add_job_output("J1", "ABC123", "model.sim", a.len() as u64);
    api.add_job_output("J1", "DEF456", "model.sim", b.len() as u64);

    let out = dir.path().join("out");
    let (files, bytes, _location) =
        jobpilot::daemon::download_job_outputs(&api, &store, &governor, "J1", &out, false, 1)
            .unwrap();
    assert_eq!(files, 2);
    assert_eq!(bytes as usize, a.len() + b.len());
    // 两个输出路径互不相同，内容各自完整
    assert_eq!(std::fs::read(out.join("model_ABC123.sim")).unwrap(), a);
    assert_eq!(std::fs::read(out.join("model_DEF456.sim")).unwrap(), b);
    assert!(!out.join("model.sim").exists());
}
