//! Client side of the daemon socket protocol.

use chrono::Utc;
use playtime_daemon_protocol::{Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOCKET_ENV: &str = "PLAYTIME_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 10_000;
const WRITE_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid daemon response: {0}")]
    InvalidResponse(String),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Ok(Self::new(socket_path()?))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Sends one request and returns its `data`, or the daemon's error.
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, ClientError> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(make_request_id()),
            params,
        };
        tracing::debug!(method = ?method, id = ?request.id, "Sending daemon request");

        let response = self.send_request(&request)?;
        if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            let (code, message) = response
                .error
                .map(|err| (err.code, err.message))
                .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
            Err(ClientError::Daemon { code, message })
        }
    }

    fn send_request(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

        serde_json::to_writer(&mut stream, request)
            .map_err(|err| ClientError::InvalidResponse(format!("Failed to write request: {}", err)))?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        read_response(&mut stream)
    }
}

fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(".playtime").join(SOCKET_NAME))
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::InvalidResponse(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ClientError::InvalidResponse(
                    "timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err(ClientError::InvalidResponse(
            "daemon response was empty".to_string(),
        ));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::InvalidResponse(format!("not valid JSON: {}", err)))
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "ctl-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}
