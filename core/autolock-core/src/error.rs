//! Error types for keyring-autolock-core operations.

use std::path::PathBuf;

/// All errors that can occur while monitoring the secret service.
///
/// Start-up failures ([`AutolockError::is_fatal`]) abort `start()`; everything
/// else is reported for the one call that failed and the monitor keeps going.
#[derive(Debug, thiserror::Error)]
pub enum AutolockError {
    // ─────────────────────────────────────────────────────────────────────
    // Bus Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session bus unreachable: {context}: {details}")]
    BusUnreachable { context: String, details: String },

    #[error("Bus refused monitor declaration: {0}")]
    MonitorRejected(String),

    #[error("Bus call failed: {call}: {details}")]
    CallFailed { call: String, details: String },

    #[error("Unexpected reply to {call}: {details}")]
    UnexpectedReply { call: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Preference and Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Preferences file malformed: {path}: {details}")]
    PreferencesMalformed { path: PathBuf, details: String },

    #[error("Daemon config malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("No {0} directory could be determined")]
    NoDirectory(&'static str),

    // ─────────────────────────────────────────────────────────────────────
    // Indicator Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Indicator update failed: {path}: {source}")]
    IndicatorWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O and Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Monitor is already running")]
    AlreadyRunning,
}

impl AutolockError {
    pub fn call_failed(call: &str, details: impl ToString) -> Self {
        AutolockError::CallFailed {
            call: call.to_string(),
            details: details.to_string(),
        }
    }

    pub fn unreachable(context: &str, details: impl ToString) -> Self {
        AutolockError::BusUnreachable {
            context: context.to_string(),
            details: details.to_string(),
        }
    }

    /// Bus-level failures that make the whole feature unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AutolockError::BusUnreachable { .. } | AutolockError::MonitorRejected(_)
        )
    }
}

/// Convenience type alias for Results using AutolockError.
pub type Result<T> = std::result::Result<T, AutolockError>;

impl From<AutolockError> for String {
    fn from(err: AutolockError) -> String {
        err.to_string()
    }
}
