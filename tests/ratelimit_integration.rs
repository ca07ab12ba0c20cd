// Coordinator lifecycle over the real local endpoint: configure, acquire,
// deferred grants, denial with retry estimates, and shutdown. One test owns
// the whole lifecycle because the endpoint is shared per user.

#![cfg(unix)]

use std::time::{Duration, Instant};

use jobpilot::ratelimit::proto::{ReleaseOutcome, Reply, Request, read_frame, write_frame};
use jobpilot::ratelimit::server::{CoordinatorOptions, run};
use jobpilot::ratelimit::{connect_endpoint, endpoint_path};

fn roundtrip(stream: &mut jobpilot::ratelimit::IpcStream, req: &Request) -> Reply {
    write_frame(stream, req).unwrap();
    read_frame(stream).unwrap()
}

fn wait_for_endpoint() -> jobpilot::ratelimit::IpcStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match connect_endpoint(Duration::from_secs(10)) {
            Ok(s) => return s,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("coordinator endpoint never came up: {}", e),
        }
    }
}

#[test]
fn coordinator_lifecycle() {
    // 避免上次异常退出留下的陈旧套接字干扰
    let _ = std::fs::remove_file(endpoint_path());
    let server = std::thread::spawn(|| {
        run(CoordinatorOptions {
            idle_timeout: Duration::from_secs(600),
            lease_ttl: Duration::from_secs(60),
        })
        .unwrap();
    });

    let mut a = wait_for_endpoint();
    match roundtrip(
        &mut a,
        &Request::Hello { client_id: "client-a".into(), version: "test".into() },
    ) {
        Reply::Hi { .. } => {}
        other => panic!("unexpected hello reply: {:?}", other),
    }

    // 容量 1、速率 1/s 的桶
    assert_eq!(
        roundtrip(
            &mut a,
            &Request::Configure {
                bucket: "X".into(),
                capacity: 1.0,
                refill_per_sec: 1.0,
                max_cooldown_ms: 10_000,
            },
        ),
        Reply::Ok
    );

    // A 拿走唯一令牌
    let lease_a = match roundtrip(
        &mut a,
        &Request::Acquire { bucket: "X".into(), weight: 1, max_wait_ms: 100 },
    ) {
        Reply::Granted { lease_id, .. } => lease_id,
        other => panic!("expected grant, got {:?}", other),
    };

    // B 的 max_wait 太短：立即拒绝，retry_after 接近整个令牌周期
    let mut b = wait_for_endpoint();
    let _ = roundtrip(
        &mut b,
        &Request::Hello { client_id: "client-b".into(), version: "test".into() },
    );
    match roundtrip(&mut b, &Request::Acquire { bucket: "X".into(), weight: 1, max_wait_ms: 500 })
    {
        Reply::Denied { retry_after_ms, .. } => {
            assert!(retry_after_ms >= 500, "retry_after_ms = {}", retry_after_ms);
        }
        other => panic!("expected denial, got {:?}", other),
    }

    // max_wait 充足：延迟授予，等待时长与补充速率一致
    let started = Instant::now();
    match roundtrip(
        &mut b,
        &Request::Acquire { bucket: "X".into(), weight: 1, max_wait_ms: 3_000 },
    ) {
        Reply::Granted { lease_id, .. } => {
            assert!(started.elapsed() >= Duration::from_millis(500));
            write_frame(
                &mut b,
                &Request::Release { lease_id, outcome: ReleaseOutcome::Ok },
            )
            .unwrap();
            let _: Reply = read_frame(&mut b).unwrap();
        }
        other => panic!("expected deferred grant, got {:?}", other),
    }

    // 被限流的释放设置冷却：随后的获取被推迟
    assert_eq!(
        roundtrip(&mut a, &Request::Release { lease_id: lease_a, outcome: ReleaseOutcome::Throttled }),
        Reply::Ok
    );
    match roundtrip(&mut a, &Request::Acquire { bucket: "X".into(), weight: 1, max_wait_ms: 1 }) {
        Reply::Denied { .. } => {}
        Reply::Granted { .. } => panic!("granted during cooldown"),
        other => panic!("unexpected: {:?}", other),
    }

    // 未知租约的释放被容忍
    assert_eq!(
        roundtrip(
            &mut a,
            &Request::Release { lease_id: "lease-bogus".into(), outcome: ReleaseOutcome::Ok },
        ),
        Reply::Ok
    );

    // 状态快照包含桶与租约计数
    match roundtrip(&mut a, &Request::State) {
        Reply::State { buckets, .. } => {
            assert!(buckets.iter().any(|b| b.name == "X"));
        }
        other => panic!("expected state, got {:?}", other),
    }

    match roundtrip(&mut a, &Request::Shutdown) {
        Reply::Ok => {}
        other => panic!("expected ok, got {:?}", other),
    }
    server.join().unwrap();
    assert!(!endpoint_path().exists(), "socket cleaned up on shutdown");
}
