// Length-framed JSON request/reply protocol spoken on the coordinator
// endpoint. Frames are a u32 big-endian byte count followed by one JSON
// object; both sides tolerate unknown fields for forward compatibility.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::PilotError;

/// Upper bound on a single frame; anything larger is a protocol violation.
const MAX_FRAME: u32 = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Ok,
    Throttled,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Hello { client_id: String, version: String },
    Acquire { bucket: String, weight: u32, max_wait_ms: u64 },
    Release { lease_id: String, outcome: ReleaseOutcome },
    Configure { bucket: String, capacity: f64, refill_per_sec: f64, max_cooldown_ms: u64 },
    State,
    Shutdown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    pub name: String,
    pub tokens: f64,
    pub cooldown_remain_ms: u64,
    pub active_clients: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Hi { server_version: String, uptime_ms: u64 },
    Ok,
    Granted { lease_id: String, wait_ms: u64 },
    Denied { retry_after_ms: u64, reason: String },
    State { uptime_ms: u64, buckets: Vec<BucketSnapshot>, active_leases: u64 },
    Error { message: String },
}

pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(msg)
        .map_err(|e| PilotError::Fatal(format!("协议序列化失败: {}", e)))?;
    let len = body.len() as u32;
    if len > MAX_FRAME {
        return Err(PilotError::Fatal(format!("协议帧过大: {} 字节", len)).into());
    }
    w.write_all(&len.to_be_bytes()).map_err(|e| PilotError::from_io(&e, "写协议帧头"))?;
    w.write_all(&body).map_err(|e| PilotError::from_io(&e, "写协议帧体"))?;
    w.flush().map_err(|e| PilotError::from_io(&e, "刷写协议帧"))?;
    Ok(())
}

pub fn read_frame<R: Read, T: serde::de::DeserializeOwned>(r: &mut R) -> anyhow::Result<T> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head).map_err(|e| PilotError::from_io(&e, "读协议帧头"))?;
    let len = u32::from_be_bytes(head);
    if len > MAX_FRAME {
        return Err(PilotError::Fatal(format!("协议帧过大: {} 字节", len)).into());
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).map_err(|e| PilotError::from_io(&e, "读协议帧体"))?;
    serde_json::from_slice(&body)
        .map_err(|e| PilotError::Fatal(format!("协议解析失败: {}", e)).into())
}
