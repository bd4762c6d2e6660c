use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Believed lock status of the secret collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub locked: bool,
    pub last_unlock_at: DateTime<Utc>,
}

impl LockState {
    /// Unlock time starts at `now` so a fresh monitor does not lock at once.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            locked: false,
            last_unlock_at: now,
        }
    }

    pub fn mark_unlocked(&mut self, at: DateTime<Utc>) {
        self.locked = false;
        self.last_unlock_at = at;
    }

    pub fn mark_locked(&mut self) {
        self.locked = true;
    }
}

#[derive(Debug)]
struct StatusCell {
    running: AtomicBool,
    locked: AtomicBool,
    last_unlock_ms: AtomicI64,
}

/// Read-only view of the monitor's state for other threads.
#[derive(Debug, Clone)]
pub struct LockStatusView {
    cell: Arc<StatusCell>,
}

impl LockStatusView {
    pub(crate) fn new(state: &LockState) -> Self {
        Self {
            cell: Arc::new(StatusCell {
                running: AtomicBool::new(false),
                locked: AtomicBool::new(state.locked),
                last_unlock_ms: AtomicI64::new(state.last_unlock_at.timestamp_millis()),
            }),
        }
    }

    pub(crate) fn publish(&self, state: &LockState, running: bool) {
        self.cell
            .last_unlock_ms
            .store(state.last_unlock_at.timestamp_millis(), Ordering::SeqCst);
        self.cell.locked.store(state.locked, Ordering::SeqCst);
        self.cell.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.cell.running.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.cell.locked.load(Ordering::SeqCst)
    }

    pub fn last_unlock_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.cell.last_unlock_ms.load(Ordering::SeqCst))
            .unwrap_or_default()
    }
}
