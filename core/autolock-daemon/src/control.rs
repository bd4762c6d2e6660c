//! Control socket: status queries and manual lock requests.
//!
//! One newline-terminated JSON request per connection, one JSON response
//! back. Lock requests are forwarded to the event loop and answered with its
//! outcome, so the loop stays the only writer of lock state.

use autolock_core::{LockOutcome, LockStatusView, MonitorEvent, PreferenceStore};
use chrono::{DateTime, Utc};
use fs_err as fs;
use keyring_autolock_protocol::{
    parse_lock_params, ErrorInfo, LockOutcomeKind, LockReply, Method, Request, Response,
    StatusSnapshot, TimeoutMode, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK_SIZE: usize = 4096;

/// Shared by every connection thread.
#[derive(Clone)]
pub struct ControlContext {
    pub status: LockStatusView,
    pub prefs: Arc<dyn PreferenceStore>,
    pub events: Sender<MonitorEvent>,
    pub started_at: DateTime<Utc>,
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Binds `path`, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self, String> {
        prepare_socket_dir(path)?;
        remove_existing_socket(path)?;
        let listener = UnixListener::bind(path)
            .map_err(|err| format!("Failed to bind {}: {}", path.display(), err))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections on a background thread for the life of the process.
    pub fn spawn(self, context: ControlContext) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("control-socket".to_string())
            .spawn(move || {
                info!(path = %self.path.display(), "Control socket listening");
                for stream in self.listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let context = context.clone();
                            thread::spawn(move || handle_connection(stream, &context));
                        }
                        Err(err) => {
                            warn!(error = %err, "Failed to accept control connection");
                        }
                    }
                }
            })
    }
}

/// Removes the socket file on shutdown. Missing is fine.
pub fn remove_socket(path: &Path) {
    if let Err(err) = remove_existing_socket(path) {
        warn!(error = %err, "Failed to remove control socket");
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    match fs::remove_file(socket_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!("Failed to remove existing socket: {}", err)),
    }
}

pub fn handle_connection(mut stream: UnixStream, context: &ControlContext) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read control request");
            let _ = write_response(&mut stream, Response::error_with_info(None, err));
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Control request received");
    let response = handle_request(request, context, Utc::now());
    if let Err(err) = write_response(&mut stream, response) {
        debug!(error = %err, "Client went away before the response");
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));

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
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
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

    let line = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

pub fn handle_request(request: Request, context: &ControlContext, now: DateTime<Utc>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => Response::ok(
            request.id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "running": context.status.is_running(),
                "started_at": context.started_at.to_rfc3339(),
            }),
        ),
        Method::GetStatus => {
            let snapshot = status_snapshot(context, now);
            match serde_json::to_value(snapshot) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("failed to serialize status: {}", err),
                ),
            }
        }
        Method::Lock => handle_lock(request, context),
    }
}

fn status_snapshot(context: &ControlContext, now: DateTime<Utc>) -> StatusSnapshot {
    let last_unlock_at = context.status.last_unlock_at();
    let timeout_minutes = context.prefs.timeout_minutes();
    StatusSnapshot {
        running: context.status.is_running(),
        locked: context.status.is_locked(),
        last_unlock_at: last_unlock_at.to_rfc3339(),
        idle_minutes: now.signed_duration_since(last_unlock_at).num_minutes().max(0),
        timeout_minutes,
        mode: if timeout_minutes == 0 {
            TimeoutMode::Disarmed
        } else {
            TimeoutMode::Armed
        },
        show_indicator: context.prefs.show_indicator(),
    }
}

fn handle_lock(request: Request, context: &ControlContext) -> Response {
    let params = match parse_lock_params(request.params) {
        Ok(params) => params,
        Err(err) => return Response::error_with_info(request.id, err),
    };
    let source = params.source.as_deref().unwrap_or("unknown");
    info!(source, "Manual lock requested");

    let (reply_tx, reply_rx) = mpsc::channel();
    let sent = context.events.send(MonitorEvent::ManualLockRequested {
        reply: Some(reply_tx),
    });
    if sent.is_err() {
        return Response::error(request.id, "daemon_unavailable", "event loop has stopped");
    }

    let outcome = match reply_rx.recv_timeout(LOCK_REPLY_TIMEOUT) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            warn!(source, "Manual lock timed out waiting for the event loop");
            return Response::error(request.id, "lock_timeout", "lock request timed out");
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Response::error(request.id, "daemon_unavailable", "event loop has stopped");
        }
    };

    let kind = match outcome {
        LockOutcome::Locked => LockOutcomeKind::Locked,
        LockOutcome::AlreadyLocked => LockOutcomeKind::AlreadyLocked,
        LockOutcome::Failed(message) => {
            return Response::error(request.id, "lock_failed", message);
        }
    };
    match serde_json::to_value(LockReply { outcome: kind }) {
        Ok(value) => Response::ok(request.id, value),
        Err(err) => Response::error(
            request.id,
            "serialization_error",
            format!("failed to serialize lock reply: {}", err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
