//! Events delivered to the monitor's loop.

use crate::prefs::PreferenceKey;
use chrono::{DateTime, Utc};
use std::sync::mpsc::Sender;

#[derive(Debug)]
pub enum MonitorEvent {
    /// A secret prompt completed, observed on the monitor connection.
    UnlockCompleted { observed_at: DateTime<Utc> },
    TimerTick,
    PreferenceChanged(PreferenceKey),
    /// User asked for an immediate lock. The outcome is sent to `reply` when
    /// present.
    ManualLockRequested { reply: Option<Sender<LockOutcome>> },
    /// The monitor connection ended on its own; unlocks can no longer be seen.
    BusLost { reason: String },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    AlreadyLocked,
    Failed(String),
}

impl LockOutcome {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockOutcome::Locked | LockOutcome::AlreadyLocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}
