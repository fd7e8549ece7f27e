use devinsight_protocol::{
    ActivityEvent, EntityType, HeartbeatBatch, Method, Request, Response, PROTOCOL_VERSION,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, sleep, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Minimal HTTP collector that records every batch it accepts.
struct FakeCollector {
    endpoint: String,
    batches: Arc<Mutex<Vec<HeartbeatBatch>>>,
    auth_headers: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeCollector {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind collector");
        listener.set_nonblocking(true).expect("nonblocking collector");
        let endpoint = format!(
            "http://{}/api/v1/heartbeats",
            listener.local_addr().expect("collector addr")
        );
        let batches = Arc::new(Mutex::new(Vec::new()));
        let auth_headers = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let batches = Arc::clone(&batches);
            let auth_headers = Arc::clone(&auth_headers);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((mut stream, _)) => {
                            let _ = stream.set_nonblocking(false);
                            let (headers, body) = read_http_request(&mut stream);
                            if let Some(auth) = headers.lines().find(|line| {
                                line.to_ascii_lowercase().starts_with("authorization:")
                            }) {
                                auth_headers.lock().unwrap().push(auth.to_string());
                            }
                            let accepted = match serde_json::from_str::<HeartbeatBatch>(&body) {
                                Ok(batch) => {
                                    let count = batch.heartbeats.len();
                                    batches.lock().unwrap().push(batch);
                                    count
                                }
                                Err(_) => 0,
                            };
                            let body = format!("{{\"accepted\":{}}}", accepted);
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = stream.write_all(response.as_bytes());
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            sleep(Duration::from_millis(10));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            endpoint,
            batches,
            auth_headers,
            stop,
            thread: Some(thread),
        }
    }

    fn delivered_entities(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.heartbeats.iter().map(|record| record.entity.clone()))
            .collect()
    }
}

impl Drop for FakeCollector {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_http_request(stream: &mut TcpStream) -> (String, String) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buffer).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .and_then(|value| value.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            if buffer.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    let text = String::from_utf8_lossy(&buffer).to_string();
    match text.find("\r\n\r\n") {
        Some(index) => (text[..index].to_string(), text[index + 4..].to_string()),
        None => (text, String::new()),
    }
}

fn unreachable_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind free port");
    let addr = listener.local_addr().expect("free port addr");
    drop(listener);
    format!("http://{}/api/v1/heartbeats", addr)
}

fn write_config(home: &Path, endpoint: &str) {
    let dir = home.join(".devinsight");
    std::fs::create_dir_all(&dir).expect("create config dir");
    let config = format!(
        r#"
[api]
endpoint = "{}"
api_key = "test-key"
user_id = "dev-1"
timeout_secs = 2
connect_timeout_secs = 1

[dispatch]
interval_secs = 3600
backoff_base_secs = 1
backoff_max_secs = 2
"#,
        endpoint
    );
    std::fs::write(dir.join("config.toml"), config).expect("write config");
}

fn spawn_daemon(home: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_devinsight-daemon"))
        .env("HOME", home)
        .env_remove("DEVINSIGHT_CONFIG")
        .env_remove("DEVINSIGHT_API_KEY")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn devinsight-daemon")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".devinsight").join("daemon.sock")
}

fn temp_home(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("Failed to create temp HOME")
}

fn can_bind_socket(home: &Path) -> bool {
    let scratch_path = home.join("scratch.sock");
    match UnixListener::bind(&scratch_path) {
        Ok(listener) => {
            drop(listener);
            let _ = std::fs::remove_file(&scratch_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn send_request(socket: &Path, method: Method, params: Option<serde_json::Value>) -> Response {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(format!("{:?}", method)),
        params,
    };
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn send_event(socket: &Path, event: &ActivityEvent) -> Response {
    send_request(
        socket,
        Method::Event,
        Some(serde_json::to_value(event).expect("serialize event")),
    )
}

fn queue_size(socket: &Path) -> u64 {
    let response = send_request(socket, Method::GetQueueSize, None);
    assert!(response.ok, "queue size response was not ok");
    response
        .data
        .as_ref()
        .and_then(|data| data.get("size"))
        .and_then(|value| value.as_u64())
        .expect("size field")
}

fn wait_for_queue_size(socket: &Path, expected: u64, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if queue_size(socket) == expected {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn daemon_event_flush_and_delivery_smoke() {
    let home = temp_home("devinsight-smoke");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let collector = FakeCollector::start();
    write_config(home.path(), &collector.endpoint);

    let socket = socket_path(home.path());
    let child = spawn_daemon(home.path());
    let _guard = DaemonGuard { child };
    wait_for_socket(&socket, Duration::from_secs(5));

    let health = send_request(&socket, Method::GetHealth, None);
    assert!(health.ok, "health response was not ok");
    let data = health.data.expect("health payload");
    assert_eq!(data.get("status").and_then(|v| v.as_str()), Some("ok"));
    assert_eq!(data.get("worker_running").and_then(|v| v.as_bool()), Some(true));

    let repo_root = home.path().join("repo");
    let src_dir = repo_root.join("src");
    std::fs::create_dir_all(&src_dir).expect("create repo dir");
    std::fs::write(repo_root.join("Cargo.toml"), "[package]").expect("write marker");
    std::fs::write(src_dir.join("main.rs"), "fn main() {}").expect("write source");

    let main_rs = src_dir.join("main.rs").to_string_lossy().to_string();
    let saved = send_event(&socket, &ActivityEvent::new(&main_rs, EntityType::File, true));
    assert!(saved.ok, "event response was not ok");
    assert_eq!(
        saved.data.as_ref().and_then(|d| d.get("queued")).and_then(|v| v.as_bool()),
        Some(true)
    );

    // Passive repeat inside the debounce window is accepted but not queued.
    let repeat = send_event(&socket, &ActivityEvent::new(&main_rs, EntityType::File, false));
    assert!(repeat.ok);
    assert_eq!(
        repeat.data.as_ref().and_then(|d| d.get("queued")).and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(queue_size(&socket), 1);

    let flush = send_request(&socket, Method::Flush, None);
    assert!(flush.ok, "flush response was not ok");
    assert!(wait_for_queue_size(&socket, 0, Duration::from_secs(5)), "queue did not drain");

    let batches = collector.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    let record = &batches[0].heartbeats[0];
    assert_eq!(record.entity, main_rs);
    assert_eq!(record.project.as_deref(), Some("repo"));
    assert_eq!(record.language.as_deref(), Some("rust"));
    assert_eq!(record.user_id.as_deref(), Some("dev-1"));
    assert!(record.is_write);
    assert_eq!(
        collector.auth_headers.lock().unwrap()[0].to_ascii_lowercase(),
        "authorization: bearer test-key"
    );

    let diagnostics = send_request(&socket, Method::GetDiagnostics, None);
    assert!(diagnostics.ok);
    let diagnostics = diagnostics.data.expect("diagnostics payload");
    assert_eq!(diagnostics["dispatch"]["delivered_entries"].as_u64(), Some(1));
    assert_eq!(diagnostics["intake"]["suppressed_events"].as_u64(), Some(1));

    let summary = send_request(&socket, Method::GetSummary, Some(serde_json::json!({"days": 1})));
    assert!(summary.ok);
    assert_eq!(summary.data.expect("summary")["heartbeats"].as_u64(), Some(1));
}

#[test]
fn daemon_keeps_queue_across_restart_while_collector_is_down() {
    let home = temp_home("devinsight-restart");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping restart test: unix socket binding not permitted in this environment.");
        return;
    }
    write_config(home.path(), &unreachable_endpoint());
    let socket = socket_path(home.path());

    {
        let child = spawn_daemon(home.path());
        let _guard = DaemonGuard { child };
        wait_for_socket(&socket, Duration::from_secs(5));

        for name in ["a.rs", "b.rs", "c.rs"] {
            let response = send_event(
                &socket,
                &ActivityEvent::new(format!("/work/{}", name), EntityType::File, true),
            );
            assert!(response.ok);
        }
        send_request(&socket, Method::Flush, None);
        sleep(Duration::from_millis(300));
        assert_eq!(queue_size(&socket), 3, "failed delivery must keep entries queued");
    }

    let collector = FakeCollector::start();
    write_config(home.path(), &collector.endpoint);
    let child = spawn_daemon(home.path());
    let _guard = DaemonGuard { child };
    wait_for_socket(&socket, Duration::from_secs(5));

    // Startup flushes the recovered backlog without an explicit request.
    assert!(wait_for_queue_size(&socket, 0, Duration::from_secs(5)), "backlog was not delivered");
    assert_eq!(
        collector.delivered_entities(),
        vec!["/work/a.rs", "/work/b.rs", "/work/c.rs"]
    );
}

#[test]
fn daemon_flushes_on_sigterm() {
    let home = temp_home("devinsight-sigterm");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping sigterm test: unix socket binding not permitted in this environment.");
        return;
    }
    let collector = FakeCollector::start();
    write_config(home.path(), &collector.endpoint);

    let socket = socket_path(home.path());
    let mut child = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let response = send_event(
        &socket,
        &ActivityEvent::new("/work/shutdown.rs", EntityType::File, true),
    );
    assert!(response.ok);

    let status = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .expect("send SIGTERM");
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut exited = false;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            exited = true;
            break;
        }
        sleep(Duration::from_millis(25));
    }
    if !exited {
        let _ = child.kill();
        let _ = child.wait();
        panic!("daemon did not exit after SIGTERM");
    }

    assert_eq!(collector.delivered_entities(), vec!["/work/shutdown.rs"]);
    assert!(!socket.exists(), "socket should be removed on shutdown");
}
