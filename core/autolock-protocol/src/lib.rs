//! Control-socket protocol types for keyring-autolock-daemon.
//!
//! Shared by the daemon and `keyring-autolockctl` so both sides agree on the
//! request/response schema. Each message is a single JSON object terminated by
//! a newline.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
pub const MAX_SOURCE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetStatus,
    Lock,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Scheduler mode as reported over the socket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMode {
    Armed,
    Disarmed,
}

/// Payload of a `get_status` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StatusSnapshot {
    pub running: bool,
    pub locked: bool,
    /// RFC3339 timestamp of the last observed unlock.
    pub last_unlock_at: String,
    pub idle_minutes: i64,
    pub timeout_minutes: u32,
    pub mode: TimeoutMode,
    pub show_indicator: bool,
}

impl StatusSnapshot {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if DateTime::parse_from_rfc3339(&self.last_unlock_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "last_unlock_at must be RFC3339",
            ));
        }
        let expected = if self.timeout_minutes == 0 {
            TimeoutMode::Disarmed
        } else {
            TimeoutMode::Armed
        };
        if self.mode != expected {
            return Err(ErrorInfo::new(
                "inconsistent_mode",
                "mode does not match timeout_minutes",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockOutcomeKind {
    Locked,
    AlreadyLocked,
}

/// Payload of a successful `lock` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockReply {
    pub outcome: LockOutcomeKind,
}

/// Optional parameters of a `lock` request.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LockParams {
    /// Free-form label of the requester, recorded in the daemon log.
    #[serde(default)]
    pub source: Option<String>,
}

impl LockParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(source) = &self.source {
            if source.trim().is_empty() {
                return Err(ErrorInfo::new("invalid_source", "source must not be blank"));
            }
            if source.len() > MAX_SOURCE_LEN {
                return Err(ErrorInfo::new(
                    "invalid_source",
                    format!("source must be {} characters or fewer", MAX_SOURCE_LEN),
                ));
            }
        }
        Ok(())
    }
}

pub fn parse_lock_params(params: Option<Value>) -> Result<LockParams, ErrorInfo> {
    let Some(params) = params else {
        return Ok(LockParams::default());
    };
    let parsed: LockParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("lock params are invalid: {}", err),
        )
    })?;
    parsed.validate()?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            running: true,
            locked: false,
            last_unlock_at: "2026-01-30T12:00:00Z".to_string(),
            idle_minutes: 3,
            timeout_minutes: 15,
            mode: TimeoutMode::Armed,
            show_indicator: true,
        }
    }

    #[test]
    fn request_rejects_unknown_method() {
        let raw = r#"{"protocol_version":1,"method":"unlock"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn request_parses_snake_case_method() {
        let raw = r#"{"protocol_version":1,"method":"get_status","id":"s-1"}"#;
        let request: Request = serde_json::from_str(raw).expect("parse request");
        assert_eq!(request.method, Method::GetStatus);
        assert_eq!(request.id.as_deref(), Some("s-1"));
    }

    #[test]
    fn lock_params_default_when_absent() {
        let params = parse_lock_params(None).expect("params");
        assert_eq!(params, LockParams::default());
    }

    #[test]
    fn lock_params_reject_blank_source() {
        let err = parse_lock_params(Some(json!({"source": "  "}))).unwrap_err();
        assert_eq!(err.code, "invalid_source");
    }

    #[test]
    fn lock_params_reject_long_source() {
        let err = parse_lock_params(Some(json!({"source": "a".repeat(65)}))).unwrap_err();
        assert_eq!(err.code, "invalid_source");
    }

    #[test]
    fn lock_params_reject_unknown_fields() {
        let err = parse_lock_params(Some(json!({"force": true}))).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn status_snapshot_validates() {
        assert!(snapshot().validate().is_ok());
    }

    #[test]
    fn status_snapshot_rejects_mode_mismatch() {
        let mut status = snapshot();
        status.timeout_minutes = 0;
        assert_eq!(status.validate().unwrap_err().code, "inconsistent_mode");
    }

    #[test]
    fn status_snapshot_rejects_bad_timestamp() {
        let mut status = snapshot();
        status.last_unlock_at = "yesterday".to_string();
        assert_eq!(status.validate().unwrap_err().code, "invalid_timestamp");
    }

    #[test]
    fn error_response_omits_data() {
        let response = Response::error(Some("x".to_string()), "lock_failed", "boom");
        let value = serde_json::to_value(&response).expect("serialize");
        assert!(value.get("data").is_none());
        assert_eq!(value["error"]["code"], "lock_failed");
    }
}
