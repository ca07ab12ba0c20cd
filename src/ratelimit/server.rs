// The coordinator process. Owns the named token buckets, serves the framed
// request/reply protocol on the local endpoint, grants deferred acquires
// FIFO per bucket, sweeps dead leases and exits when idle.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};

use super::proto::{self, BucketSnapshot, ReleaseOutcome, Reply, Request};
use super::bucket::{AcquireDecision, TokenBucket};
use crate::PilotError;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default bucket parameters applied when a client names a bucket the
/// coordinator has not seen yet.
const DEFAULT_CAPACITY: f64 = 8.0;
const DEFAULT_REFILL_PER_SEC: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Exit after this long with no leases and no requests.
    pub idle_timeout: Duration,
    /// Leases older than this whose client vanished are force-released.
    pub lease_ttl: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            idle_timeout: Duration::from_secs(600),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

struct LeaseRecord {
    bucket: String,
    #[allow(dead_code)]
    client_id: String,
    acquired_at: Instant,
}

struct CoordState {
    buckets: HashMap<String, TokenBucket>,
    leases: HashMap<String, LeaseRecord>,
    // FIFO ticket queues for deferred acquires, one per bucket
    waiters: HashMap<String, VecDeque<u64>>,
    last_activity: Instant,
    started: Instant,
    next_lease: u64,
    next_ticket: u64,
}

impl CoordState {
    fn new(now: Instant) -> Self {
        CoordState {
            buckets: HashMap::new(),
            leases: HashMap::new(),
            waiters: HashMap::new(),
            last_activity: now,
            started: now,
            next_lease: 1,
            next_ticket: 1,
        }
    }

    fn bucket_mut(&mut self, name: &str, now: Instant) -> &mut TokenBucket {
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| TokenBucket::new(name, DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC, now))
    }

    fn grant(&mut self, bucket: &str, client_id: &str, now: Instant) -> String {
        let lease_id = format!("lease-{}", self.next_lease);
        self.next_lease += 1;
        self.leases.insert(
            lease_id.clone(),
            LeaseRecord {
                bucket: bucket.to_string(),
                client_id: client_id.to_string(),
                acquired_at: now,
            },
        );
        lease_id
    }

    fn snapshot(&self, now: Instant) -> Reply {
        let mut per_bucket: HashMap<&str, u64> = HashMap::new();
        for l in self.leases.values() {
            *per_bucket.entry(l.bucket.as_str()).or_default() += 1;
        }
        let mut buckets: Vec<BucketSnapshot> = self
            .buckets
            .values()
            .map(|b| b.snapshot(now, per_bucket.get(b.name.as_str()).copied().unwrap_or(0)))
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Reply::State {
            uptime_ms: now.saturating_duration_since(self.started).as_millis() as u64,
            buckets,
            active_leases: self.leases.len() as u64,
        }
    }
}

/// Run the coordinator until a `Shutdown` request or the idle timeout.
/// Returns Ok immediately when another coordinator already owns the endpoint.
pub fn run(opts: CoordinatorOptions) -> anyhow::Result<()> {
    // 已有协调器在运行则直接退出（探测连接）
    if super::connect_endpoint(Duration::from_millis(500)).is_ok() {
        tracing::info!("[coordinator] 已在运行: {}", super::endpoint_display());
        return Ok(());
    }

    // listen_named clears any stale socket from a crashed run
    let listener = super::listen_named("coord")
        .map_err(|e| PilotError::from_io(&e, "绑定协调器端点"))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| PilotError::from_io(&e, "设置监听非阻塞"))?;
    let _ = std::fs::write(super::pid_file_path(), std::process::id().to_string());
    tracing::info!("[coordinator] 监听 {}", super::endpoint_display());

    let state = Arc::new(Mutex::new(CoordState::new(Instant::now())));
    let (done_tx, done_rx) = bounded::<()>(1);

    spawn_sweeper(state.clone(), opts.clone(), done_tx.clone(), done_rx.clone());

    loop {
        if done_rx.try_recv().is_ok() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let state = state.clone();
                let done_tx = done_tx.clone();
                std::thread::spawn(move || handle_connection(stream, state, done_tx));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                tracing::warn!("[coordinator] accept 失败: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    cleanup_endpoint();
    tracing::info!("[coordinator] 已退出");
    Ok(())
}

fn cleanup_endpoint() {
    let _ = std::fs::remove_file(super::pid_file_path());
    super::remove_named_endpoint("coord");
}

// Sweeper: releases expired leases and triggers the idle shutdown.
fn spawn_sweeper(
    state: Arc<Mutex<CoordState>>,
    opts: CoordinatorOptions,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
) {
    std::thread::spawn(move || {
        loop {
            if done_rx.try_recv().is_ok() {
                // 把关闭信号放回去，令 accept 循环也能看到
                let _ = done_tx.try_send(());
                return;
            }
            std::thread::sleep(Duration::from_secs(1));
            let now = Instant::now();
            let mut st = match state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            let expired: Vec<String> = st
                .leases
                .iter()
                .filter(|(_, l)| now.saturating_duration_since(l.acquired_at) > opts.lease_ttl)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(l) = st.leases.remove(&id) {
                    tracing::debug!("[coordinator] 清理过期租约 {} (bucket={})", id, l.bucket);
                    let b = st.bucket_mut(&l.bucket, now);
                    b.release(&ReleaseOutcome::Error, now);
                }
            }
            if st.leases.is_empty()
                && now.saturating_duration_since(st.last_activity) > opts.idle_timeout
            {
                tracing::info!("[coordinator] 空闲超时，准备退出");
                let _ = done_tx.try_send(());
                return;
            }
        }
    });
}

fn handle_connection(
    mut stream: super::IpcStream,
    state: Arc<Mutex<CoordState>>,
    done_tx: Sender<()>,
) {
    // 接受的连接在部分平台会继承监听端的非阻塞标志，这里显式恢复阻塞读写
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut client_id = String::from("<anonymous>");
    // leases granted on this connection and not yet released; force-released
    // when the connection drops so a dead client cannot pin a bucket
    let mut held: Vec<String> = Vec::new();

    loop {
        let req: Request = match proto::read_frame(&mut stream) {
            Ok(r) => r,
            Err(_) => break,
        };
        if let Ok(mut st) = state.lock() {
            st.last_activity = Instant::now();
        }
        let reply = match req {
            Request::Hello { client_id: id, version } => {
                tracing::debug!("[coordinator] hello from {} (v{})", id, version);
                client_id = id;
                let st = state.lock();
                match st {
                    Ok(st) => Reply::Hi {
                        server_version: SERVER_VERSION.to_string(),
                        uptime_ms: st.started.elapsed().as_millis() as u64,
                    },
                    Err(_) => Reply::Error { message: "state poisoned".into() },
                }
            }
            Request::Acquire { bucket, weight, max_wait_ms } => {
                match acquire(&state, &bucket, &client_id, weight as f64, max_wait_ms) {
                    Ok(Reply::Granted { lease_id, wait_ms }) => {
                        held.push(lease_id.clone());
                        Reply::Granted { lease_id, wait_ms }
                    }
                    Ok(r) => r,
                    Err(e) => Reply::Error { message: e.to_string() },
                }
            }
            Request::Release { lease_id, outcome } => {
                release(&state, &lease_id, &outcome);
                held.retain(|l| l != &lease_id);
                Reply::Ok
            }
            Request::Configure { bucket, capacity, refill_per_sec, max_cooldown_ms } => {
                if let Ok(mut st) = state.lock() {
                    let now = Instant::now();
                    st.bucket_mut(&bucket, now).configure(capacity, refill_per_sec, max_cooldown_ms);
                    Reply::Ok
                } else {
                    Reply::Error { message: "state poisoned".into() }
                }
            }
            Request::State => match state.lock() {
                Ok(st) => st.snapshot(Instant::now()),
                Err(_) => Reply::Error { message: "state poisoned".into() },
            },
            Request::Shutdown => {
                let _ = proto::write_frame(&mut stream, &Reply::Ok);
                let _ = done_tx.try_send(());
                return;
            }
        };
        if proto::write_frame(&mut stream, &reply).is_err() {
            break;
        }
    }

    // connection closed: sweep this client's unreleased leases
    for lease_id in held {
        tracing::debug!("[coordinator] 连接断开，回收租约 {} ({})", lease_id, client_id);
        release(&state, &lease_id, &ReleaseOutcome::Error);
    }
}

fn acquire(
    state: &Arc<Mutex<CoordState>>,
    bucket: &str,
    client_id: &str,
    weight: f64,
    max_wait_ms: u64,
) -> anyhow::Result<Reply> {
    let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
    let ticket = {
        let mut st = state.lock().map_err(|_| PilotError::Fatal("协调器状态锁被破坏".into()))?;
        let now = Instant::now();
        // fast path when nobody is queued ahead of us
        let queue_empty = st.waiters.get(bucket).map(|q| q.is_empty()).unwrap_or(true);
        if queue_empty {
            match st.bucket_mut(bucket, now).try_acquire(weight, now) {
                AcquireDecision::Granted => {
                    let lease_id = st.grant(bucket, client_id, now);
                    return Ok(Reply::Granted { lease_id, wait_ms: 0 });
                }
                AcquireDecision::Wait(d) => {
                    if d.as_millis() as u64 > max_wait_ms {
                        return Ok(Reply::Denied {
                            retry_after_ms: d.as_millis() as u64,
                            reason: format!("bucket {} 令牌不足或处于冷却", bucket),
                        });
                    }
                }
            }
        }
        let t = st.next_ticket;
        st.next_ticket += 1;
        st.waiters.entry(bucket.to_string()).or_default().push_back(t);
        t
    };

    // deferred grant: the reply is held until the computed time; FIFO per
    // bucket via the ticket queue
    let start = Instant::now();
    loop {
        std::thread::sleep(Duration::from_millis(20));
        let mut st = state.lock().map_err(|_| PilotError::Fatal("协调器状态锁被破坏".into()))?;
        let now = Instant::now();
        let at_front =
            st.waiters.get(bucket).and_then(|q| q.front().copied()) == Some(ticket);
        if at_front {
            match st.bucket_mut(bucket, now).try_acquire(weight, now) {
                AcquireDecision::Granted => {
                    if let Some(q) = st.waiters.get_mut(bucket) {
                        q.pop_front();
                    }
                    let lease_id = st.grant(bucket, client_id, now);
                    return Ok(Reply::Granted {
                        lease_id,
                        wait_ms: start.elapsed().as_millis() as u64,
                    });
                }
                AcquireDecision::Wait(d) => {
                    if now > deadline {
                        if let Some(q) = st.waiters.get_mut(bucket) {
                            q.retain(|&t| t != ticket);
                        }
                        return Ok(Reply::Denied {
                            retry_after_ms: d.as_millis() as u64,
                            reason: format!("等待超过 {}ms", max_wait_ms),
                        });
                    }
                }
            }
        } else if now > deadline {
            if let Some(q) = st.waiters.get_mut(bucket) {
                q.retain(|&t| t != ticket);
            }
            return Ok(Reply::Denied {
                retry_after_ms: max_wait_ms,
                reason: format!("队列等待超过 {}ms", max_wait_ms),
            });
        }
    }
}

fn release(state: &Arc<Mutex<CoordState>>, lease_id: &str, outcome: &ReleaseOutcome) {
    if let Ok(mut st) = state.lock() {
        let now = Instant::now();
        // unknown lease ids are tolerated: lease ids are advisory after a
        // coordinator restart
        if let Some(l) = st.leases.remove(lease_id) {
            let b = st.bucket_mut(&l.bucket, now);
            b.release(outcome, now);
        }
    }
}
