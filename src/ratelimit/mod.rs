// Cross-process rate-limit coordination. Sibling invocations (cli, daemon)
// share named token buckets owned by a single auto-spawned coordinator
// process, reached over a local IPC endpoint.

pub mod bucket;
pub mod client;
pub mod proto;
pub mod server;

use std::path::PathBuf;

/// Well-known bucket for remote API calls.
pub const API_BUCKET: &str = "api";

fn user_tag() -> String {
    let raw = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string());
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>().to_lowercase()
}

/// IPC endpoint path, a function of the user id so parallel users on one
/// machine never collide. `name` distinguishes the coordinator socket from
/// the daemon control socket.
#[cfg(unix)]
pub fn named_endpoint_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("jobpilot-{}-{}.sock", name, user_tag()))
}

#[cfg(unix)]
pub fn endpoint_path() -> PathBuf {
    named_endpoint_path("coord")
}

#[cfg(unix)]
pub type IpcStream = std::os::unix::net::UnixStream;
#[cfg(unix)]
pub type IpcListener = std::os::unix::net::UnixListener;

// Windows 无 std 命名管道监听；用回环 TCP 端口替代，端口由用户名散列得出。
#[cfg(windows)]
pub fn named_endpoint_port(name: &str) -> u16 {
    let tag = format!("{}-{}", name, user_tag());
    let mut h: u32 = 2166136261;
    for b in tag.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(16777619);
    }
    49152 + (h % 10000) as u16
}

#[cfg(windows)]
pub fn endpoint_port() -> u16 {
    named_endpoint_port("coord")
}

#[cfg(windows)]
pub type IpcStream = std::net::TcpStream;
#[cfg(windows)]
pub type IpcListener = std::net::TcpListener;

pub fn pid_file_path() -> PathBuf {
    std::env::temp_dir().join(format!("jobpilot-{}.pid", user_tag()))
}

pub fn endpoint_display() -> String {
    #[cfg(unix)]
    {
        endpoint_path().display().to_string()
    }
    #[cfg(windows)]
    {
        format!("127.0.0.1:{}", endpoint_port())
    }
}

pub fn connect_named(name: &str, timeout: std::time::Duration) -> std::io::Result<IpcStream> {
    #[cfg(unix)]
    let stream = IpcStream::connect(named_endpoint_path(name))?;
    #[cfg(windows)]
    let stream = IpcStream::connect(("127.0.0.1", named_endpoint_port(name)))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

pub fn connect_endpoint(timeout: std::time::Duration) -> std::io::Result<IpcStream> {
    connect_named("coord", timeout)
}

pub fn listen_named(name: &str) -> std::io::Result<IpcListener> {
    #[cfg(unix)]
    {
        let path = named_endpoint_path(name);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        IpcListener::bind(path)
    }
    #[cfg(windows)]
    {
        IpcListener::bind(("127.0.0.1", named_endpoint_port(name)))
    }
}

pub fn remove_named_endpoint(name: &str) {
    #[cfg(unix)]
    {
        let _ = std::fs::remove_file(named_endpoint_path(name));
    }
    #[cfg(windows)]
    {
        let _ = name;
    }
}
