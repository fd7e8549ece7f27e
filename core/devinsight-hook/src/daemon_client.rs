//! Client helper for talking to the DevInsight daemon over its Unix socket.
//!
//! The daemon owns the queue. The hook never buffers or persists anything
//! itself: a request either reaches the daemon (with one quick retry) or the
//! error is surfaced to the caller.

use chrono::Utc;
use devinsight_protocol::{
    ActivityEvent, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const ENABLE_ENV: &str = "DEVINSIGHT_DAEMON_ENABLED";
const SOCKET_ENV: &str = "DEVINSIGHT_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Daemon disabled via DEVINSIGHT_DAEMON_ENABLED")]
    Disabled,

    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket: {0}")]
    Connect(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Invalid daemon response: {0}")]
    InvalidResponse(String),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

impl ClientError {
    /// Validation failures will fail the same way on a second attempt.
    fn is_retryable(&self) -> bool {
        match self {
            ClientError::Disabled | ClientError::NoHome => false,
            ClientError::Daemon { code, .. } => {
                !(code.starts_with("invalid_") || code == "protocol_mismatch")
            }
            _ => true,
        }
    }
}

/// Reports one activity event. Returns the daemon's intake payload
/// (`accepted`, `queued`, `sequence_id`).
///
/// An event without `occurred_at` is stamped here, before the first attempt,
/// so a retry repeats the same heartbeat and the daemon folds it away.
pub fn send_activity(event: &ActivityEvent) -> Result<Value, ClientError> {
    let mut event = event.clone();
    event.occurred_at.get_or_insert_with(|| Utc::now().to_rfc3339());
    let params = serde_json::to_value(&event).map_err(|err| {
        ClientError::InvalidResponse(format!("Failed to serialize event: {}", err))
    })?;
    call(Method::Event, Some(params))
}

/// Sends `method` and returns the response payload.
///
/// A failed attempt is retried once after a short pause, reusing the same
/// request id so the daemon log shows both attempts as one logical request.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    if !daemon_enabled() {
        return Err(ClientError::Disabled);
    }

    let request_id = make_request_id();
    let build = || Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(request_id.clone()),
        params: params.clone(),
    };

    match send_request(build()).and_then(into_payload) {
        Ok(data) => Ok(data),
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, method = ?method, "Daemon request failed; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(build()).and_then(into_payload).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    method = ?method,
                    "Retry failed sending request to daemon"
                );
                retry_err
            })
        }
        Err(err) => Err(err),
    }
}

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(".devinsight").join(SOCKET_NAME))
}

fn into_payload(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(err) => ClientError::Daemon {
            code: err.code,
            message: err.message,
        },
        None => ClientError::Daemon {
            code: "unknown".to_string(),
            message: "Unknown daemon error".to_string(),
        },
    })
}

fn send_request(request: Request) -> Result<Response, ClientError> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket).map_err(ClientError::Connect)?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| ClientError::Io(err.into()))?;
    stream.write_all(b"\n")?;
    stream.flush().ok();

    read_response(&mut stream)
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
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::InvalidResponse("response was empty".to_string()));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::InvalidResponse(format!("not valid JSON: {}", err)))
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "req-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}
