//! Socket client for the daemon's control protocol.

use chrono::Utc;
use keyring_autolock_protocol::{
    LockParams, LockReply, Method, Request, Response, StatusSnapshot, MAX_REQUEST_BYTES,
};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
// The daemon waits up to 10 s for the lock outcome.
const LOCK_READ_TIMEOUT: Duration = Duration::from_secs(12);

pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn health(&self) -> Result<serde_json::Value, String> {
        let response = self.send(request(Method::GetHealth, None), READ_TIMEOUT)?;
        into_data(response)
    }

    pub fn status(&self) -> Result<StatusSnapshot, String> {
        let response = self.send(request(Method::GetStatus, None), READ_TIMEOUT)?;
        let snapshot: StatusSnapshot = serde_json::from_value(into_data(response)?)
            .map_err(|err| format!("Malformed status from daemon: {}", err))?;
        snapshot
            .validate()
            .map_err(|err| format!("{}: {}", err.code, err.message))?;
        Ok(snapshot)
    }

    pub fn lock(&self, source: Option<&str>) -> Result<LockReply, String> {
        let params = LockParams {
            source: source.map(str::to_string),
        };
        params
            .validate()
            .map_err(|err| format!("{}: {}", err.code, err.message))?;
        let params = serde_json::to_value(params)
            .map_err(|err| format!("Failed to serialize lock params: {}", err))?;
        let response = self.send(request(Method::Lock, Some(params)), LOCK_READ_TIMEOUT)?;
        serde_json::from_value(into_data(response)?)
            .map_err(|err| format!("Malformed lock reply from daemon: {}", err))
    }

    fn send(&self, request: Request, read_timeout: Duration) -> Result<Response, String> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|err| {
            format!(
                "Failed to connect to daemon socket {}: {}",
                self.socket.display(),
                err
            )
        })?;
        let _ = stream.set_read_timeout(Some(read_timeout));
        let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));

        serde_json::to_writer(&mut stream, &request)
            .map_err(|err| format!("Failed to write request: {}", err))?;
        stream
            .write_all(b"\n")
            .map_err(|err| format!("Failed to flush request: {}", err))?;
        stream.flush().ok();

        read_response(&mut stream)
    }
}

fn request(method: Method, params: Option<serde_json::Value>) -> Request {
    let mut request = Request::new(method);
    request.id = Some(format!("ctl-{}", Utc::now().timestamp_millis()));
    request.params = params;
    request
}

fn into_data(response: Response) -> Result<serde_json::Value, String> {
    if !response.ok {
        return Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string()));
    }
    response
        .data
        .ok_or_else(|| "Daemon response carried no data".to_string())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
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
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let line = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if line.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(line).map_err(|err| format!("Failed to parse response JSON: {}", err))
}
