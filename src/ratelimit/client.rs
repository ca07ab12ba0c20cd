// Per-process lease client. Lazily connects to the coordinator, spawning it
// on demand; when the coordinator stays unreachable the client fails open so
// the outer pipeline never depends on the limiter for correctness.

use std::time::{Duration, Instant};

use super::proto::{self, ReleaseOutcome, Reply, Request};
use crate::PilotError;

const CONNECT_ATTEMPTS: usize = 5;
const ACQUIRE_WAIT_MS: u64 = 2_000;
/// Total time an acquire may spend before proceeding without a lease.
const ACQUIRE_BUDGET: Duration = Duration::from_secs(30);

pub struct LeaseClient {
    stream: Option<super::IpcStream>,
    client_id: String,
    fail_open: bool,
    warned: bool,
}

impl Default for LeaseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseClient {
    pub fn new() -> Self {
        LeaseClient {
            stream: None,
            client_id: format!("jp-{}-{:04x}", std::process::id(), rand::random::<u16>()),
            fail_open: false,
            warned: false,
        }
    }

    /// Connect without spawning; used by `jp coordinator state|stop`.
    pub fn connect_only(&mut self) -> anyhow::Result<()> {
        match super::connect_endpoint(Duration::from_secs(2)) {
            Ok(s) => {
                self.stream = Some(s);
                self.hello()
            }
            Err(e) => Err(PilotError::Transient(format!(
                "无法连接协调器 {}: {}",
                super::endpoint_display(),
                e
            ))
            .into()),
        }
    }

    fn hello(&mut self) -> anyhow::Result<()> {
        let reply = self.roundtrip(&Request::Hello {
            client_id: self.client_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })?;
        match reply {
            Reply::Hi { .. } => Ok(()),
            other => {
                Err(PilotError::Fatal(format!("协调器握手响应异常: {:?}", other)).into())
            }
        }
    }

    fn spawn_coordinator() {
        let Ok(exe) = std::env::current_exe() else {
            return;
        };
        // 隐藏命令：客户端按需拉起协调器进程
        let _ = std::process::Command::new(exe)
            .args(["coordinator", "run"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
    }

    fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        if self.fail_open {
            return false;
        }
        for attempt in 1..=CONNECT_ATTEMPTS {
            match super::connect_endpoint(Duration::from_secs(2)) {
                Ok(s) => {
                    self.stream = Some(s);
                    if self.hello().is_ok() {
                        return true;
                    }
                    self.stream = None;
                }
                Err(_) if attempt == 1 => {
                    Self::spawn_coordinator();
                }
                Err(_) => {}
            }
            std::thread::sleep(Duration::from_millis(
                crate::util::compute_backoff_ms(100, attempt as u64),
            ));
        }
        // 失败即放行：限流器不可用不阻塞主流程
        self.fail_open = true;
        if !self.warned {
            self.warned = true;
            tracing::warn!(
                "[ratelimit] 协调器不可达（{}），本进程不再限流",
                super::endpoint_display()
            );
        }
        false
    }

    fn roundtrip(&mut self, req: &Request) -> anyhow::Result<Reply> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PilotError::Transient("协调器未连接".to_string()))?;
        if let Err(e) = proto::write_frame(stream, req) {
            self.stream = None;
            return Err(e);
        }
        match proto::read_frame::<_, Reply>(stream) {
            Ok(r) => Ok(r),
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Acquire a lease against `bucket`, waiting through Denied replies up to
    /// the acquire budget. Returns None in fail-open mode — callers proceed
    /// without a lease.
    pub fn acquire(&mut self, bucket: &str) -> Option<String> {
        if !self.ensure_connected() {
            return None;
        }
        let start = Instant::now();
        loop {
            if crate::util::is_cancelled() || start.elapsed() > ACQUIRE_BUDGET {
                return None;
            }
            let req = Request::Acquire {
                bucket: bucket.to_string(),
                weight: 1,
                max_wait_ms: ACQUIRE_WAIT_MS,
            };
            match self.roundtrip(&req) {
                Ok(Reply::Granted { lease_id, .. }) => return Some(lease_id),
                Ok(Reply::Denied { retry_after_ms, .. }) => {
                    if start.elapsed() > ACQUIRE_BUDGET {
                        tracing::warn!(
                            "[ratelimit] bucket {} 等待超时，放行本次调用",
                            bucket
                        );
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(retry_after_ms.clamp(50, 5_000)));
                }
                Ok(other) => {
                    tracing::debug!("[ratelimit] 意外响应: {:?}", other);
                    return None;
                }
                Err(_) => {
                    // one reconnect attempt, then fail open
                    if !self.ensure_connected() {
                        return None;
                    }
                }
            }
        }
    }

    /// Best-effort lease release; the server tolerates unknown lease ids.
    pub fn release(&mut self, lease_id: &str, outcome: ReleaseOutcome) {
        if self.stream.is_none() {
            return;
        }
        let req = Request::Release { lease_id: lease_id.to_string(), outcome };
        let _ = self.roundtrip(&req);
    }

    pub fn state(&mut self) -> anyhow::Result<Reply> {
        if self.stream.is_none() {
            self.connect_only()?;
        }
        self.roundtrip(&Request::State)
    }

    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.stream.is_none() {
            self.connect_only()?;
        }
        match self.roundtrip(&Request::Shutdown)? {
            Reply::Ok => Ok(()),
            other => Err(PilotError::Fatal(format!("协调器关闭响应异常: {:?}", other)).into()),
        }
    }
}
