//! DevInsight daemon entrypoint.
//!
//! A small, single-writer service that owns one heartbeat pipeline: the
//! editor-side CLI reports events over a Unix socket, and the pipeline
//! debounces, persists and delivers them. SIGINT/SIGTERM run `dispose`, which
//! gives the final flush a bounded grace period.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use devinsight_core::{load_config, InsightConfig, Pipeline};
use devinsight_protocol::{
    parse_event, ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod params;

use params::parse_summary_params;

const SOCKET_NAME: &str = "daemon.sock";
const DEBUG_LOG_ENV: &str = "DEVINSIGHT_DEBUG_LOG";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let config = match load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            InsightConfig::default()
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    let pipeline = match Pipeline::from_config(config) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(err) => {
            error!(error = %err, "Failed to open heartbeat pipeline");
            std::process::exit(1);
        }
    };

    if let Err(err) = pipeline.initialize() {
        error!(error = %err, "Failed to start heartbeat dispatcher");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    install_shutdown_handler(Arc::clone(&pipeline), socket_path.clone());
    info!(path = %socket_path.display(), "DevInsight daemon started");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || handle_connection(stream, pipeline));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn install_shutdown_handler(pipeline: Arc<Pipeline>, socket_path: PathBuf) {
    let result = ctrlc::set_handler(move || {
        info!("Shutdown signal received; flushing heartbeats");
        let _ = fs::remove_file(&socket_path);
        let finished = pipeline.dispose();
        if !finished {
            warn!("Exiting with heartbeats still queued; they will be sent on next start");
        }
        std::process::exit(0);
    });
    if let Err(err) = result {
        warn!(error = %err, "Failed to install shutdown handler; final flush disabled");
    }
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".devinsight").join(SOCKET_NAME))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, pipeline: Arc<Pipeline>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &pipeline);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, pipeline: &Pipeline) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let queue_size = pipeline.queue_size().ok();
            Response::ok(
                request.id,
                serde_json::json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                    "worker_running": pipeline.is_running(),
                    "queue_size": queue_size,
                }),
            )
        }
        Method::Event => handle_event(request, pipeline),
        Method::Flush => {
            pipeline.flush_now();
            Response::ok(request.id, serde_json::json!({ "requested": true }))
        }
        Method::GetQueueSize => match pipeline.queue_size() {
            Ok(size) => Response::ok(request.id, serde_json::json!({ "size": size })),
            Err(err) => Response::error(
                request.id,
                "queue_error",
                format!("Failed to read queue size: {}", err),
            ),
        },
        Method::GetDiagnostics => match pipeline.diagnostics() {
            Ok(diagnostics) => to_response(request.id, &diagnostics, "diagnostics"),
            Err(err) => Response::error(
                request.id,
                "diagnostics_error",
                format!("Failed to collect diagnostics: {}", err),
            ),
        },
        Method::GetSummary => {
            let since = match parse_summary_params(request.params) {
                Ok(since) => since,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match pipeline.activity_summary(since) {
                Ok(summary) => {
                    tracing::debug!(
                        sessions = summary.sessions.len(),
                        total_secs = summary.total_secs,
                        "Activity summary"
                    );
                    to_response(request.id, &summary, "summary")
                }
                Err(err) => Response::error(
                    request.id,
                    "summary_error",
                    format!("Failed to build activity summary: {}", err),
                ),
            }
        }
    }
}

fn handle_event(request: Request, pipeline: &Pipeline) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "event payload is required"),
    };

    let event = match parse_event(params) {
        Ok(event) => event,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    tracing::debug!(
        entity = %event.entity,
        entity_type = event.entity_type.as_str(),
        is_write = event.is_write,
        "Received event"
    );

    // Intake is fire-and-forget: debounced or rejected events still count as accepted.
    let sequence_id = pipeline.record_event(event);
    Response::ok(
        request.id,
        serde_json::json!({
            "accepted": true,
            "queued": sequence_id.is_some(),
            "sequence_id": sequence_id,
        }),
    )
}

fn to_response<T: serde::Serialize>(id: Option<String>, value: &T, label: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", label, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
