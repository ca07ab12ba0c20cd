// Completion daemon scenarios: filter-driven pickup of finished jobs, the
// journal preventing re-downloads, and retry flow.

mod common;

use std::sync::atomic::Ordering;

use common::{MemStore, MockApi, seed_remote_file};
use jobpilot::daemon::{DaemonJournal, DaemonOptions, poll_once};
use jobpilot::transfer::TransferGovernor;

fn opts(dir: &std::path::Path) -> DaemonOptions {
    DaemonOptions {
        interval_secs: 60,
        name_prefix: Some("Sim".to_string()),
        name_contains: None,
        name_exclude: None,
        output_root: dir.join("downloads"),
        journal_path: dir.join("daemon.db"),
        max_retries: 1,
    }
}

#[test]
fn completed_job_is_picked_up_once() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);
    let opts = opts(dir.path());
    let journal = DaemonJournal::open(&opts.journal_path).unwrap();

    let out1: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    let out2 = b"final report".to_vec();
    seed_remote_file(&api, &store, "FO1", "result.dat", &out1);
    seed_remote_file(&api, &store, "FO2", "report.txt", &out2);
    api.add_job("J1", "Sim_42", "Completed");
    api.add_job_output("J1", "FO1", "result.dat", out1.len() as u64);
    api.add_job_output("J1", "FO2", "report.txt", out2.len() as u64);
    // 不匹配前缀与未完成的任务被忽略
    api.add_job("J2", "Other_7", "Completed");
    api.add_job("J3", "Sim_43", "Running");

    let (ok, bad) = poll_once(&api, &store, &governor, &opts, &journal).unwrap();
    assert_eq!((ok, bad), (1, 0));

    let base = dir.path().join("downloads/Sim_42");
    assert_eq!(std::fs::read(base.join("result.dat")).unwrap(), out1);
    assert_eq!(std::fs::read(base.join("report.txt")).unwrap(), out2);

    let entries = journal.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, "J1");
    assert_eq!(entries[0].status, "success");
    assert_eq!(entries[0].files, 2);
    assert_eq!(entries[0].bytes as usize, out1.len() + out2.len());

    // 第二轮不再重复下载
    let gets = store.range_gets.load(Ordering::SeqCst);
    let (ok, bad) = poll_once(&api, &store, &governor, &opts, &journal).unwrap();
    assert_eq!((ok, bad), (0, 0));
    assert_eq!(store.range_gets.load(Ordering::SeqCst), gets);
}

#[test]
fn failed_download_journals_and_retries_on_demand() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::new();
    let store = MemStore::new();
    let governor = TransferGovernor::new(5, 16, true);
    let opts = opts(dir.path());
    let journal = DaemonJournal::open(&opts.journal_path).unwrap();

    let body = b"expected output".to_vec();
    seed_remote_file(&api, &store, "FO1", "out.dat", &body);
    api.add_job("J1", "Sim_9", "Completed");
    api.add_job_output("J1", "FO1", "out.dat", body.len() as u64);

    // 第一轮：范围请求全部失败
    store.fail_next_ranges(100);
    let (ok, bad) = poll_once(&api, &store, &governor, &opts, &journal).unwrap();
    assert_eq!((ok, bad), (0, 1));
    let entry = &journal.list().unwrap()[0];
    assert_eq!(entry.status, "failed");
    assert!(entry.retry_allowed);

    // 失败记录不会被自动重试
    store.fail_next_ranges(0);
    let (ok, bad) = poll_once(&api, &store, &governor, &opts, &journal).unwrap();
    assert_eq!((ok, bad), (0, 0));

    // 用户显式标记 retry 后，下一轮重新下载
    assert!(journal.mark_retry("J1").unwrap());
    let (ok, bad) = poll_once(&api, &store, &governor, &opts, &journal).unwrap();
    assert_eq!((ok, bad), (1, 0));
    assert_eq!(
        std::fs::read(dir.path().join("downloads/Sim_9/out.dat")).unwrap(),
        body
    );
    assert_eq!(journal.list().unwrap()[0].status, "success");
}
