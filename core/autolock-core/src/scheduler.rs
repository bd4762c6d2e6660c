//! Periodic idle-timeout evaluation.
//!
//! The timer is coarse on purpose: a lock can land up to one tick after the
//! configured threshold. Deadlines use the monotonic clock; idle time is
//! measured on the wall clock because unlock timestamps come from bus events.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::{Duration, Instant};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_TIMEOUT_MINUTES: u32 = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Armed { threshold_minutes: u32 },
    Disarmed,
}

impl SchedulerMode {
    pub fn from_threshold(threshold_minutes: u32) -> Self {
        if threshold_minutes == 0 {
            SchedulerMode::Disarmed
        } else {
            SchedulerMode::Armed { threshold_minutes }
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, SchedulerMode::Armed { .. })
    }
}

/// What a tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    AlreadyLocked,
    Disarmed,
    Waiting { remaining: ChronoDuration },
    Lock { idle: ChronoDuration },
}

#[derive(Debug, Clone)]
pub struct IdleTimeoutScheduler {
    interval: Duration,
    next_tick: Option<Instant>,
}

impl Default for IdleTimeoutScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

impl IdleTimeoutScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.clamp(MIN_TICK_INTERVAL, MAX_TICK_INTERVAL),
            next_tick: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&mut self, now: Instant) {
        self.next_tick = Some(self.deadline_after(now));
    }

    // Saturates at `from` if the clock cannot represent the sum.
    fn deadline_after(&self, from: Instant) -> Instant {
        from.checked_add(self.interval).unwrap_or(from)
    }

    pub fn stop(&mut self) {
        self.next_tick = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    /// `None` while stopped.
    pub fn time_until_next_tick(&self, now: Instant) -> Option<Duration> {
        self.next_tick
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Returns `true` when a tick is due and re-arms the timer.
    ///
    /// The next deadline keeps the original cadence unless the caller fell a
    /// full interval behind (e.g. after suspend), in which case it restarts
    /// from `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.next_tick else {
            return false;
        };
        if now < deadline {
            return false;
        }
        let mut next = self.deadline_after(deadline);
        if next <= now {
            next = self.deadline_after(now);
        }
        self.next_tick = Some(next);
        true
    }

    /// Pure tick evaluation against the live threshold.
    pub fn evaluate(
        locked: bool,
        threshold_minutes: u32,
        last_unlock_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TickDecision {
        if locked {
            return TickDecision::AlreadyLocked;
        }
        let SchedulerMode::Armed { threshold_minutes } =
            SchedulerMode::from_threshold(threshold_minutes)
        else {
            return TickDecision::Disarmed;
        };

        let idle = now
            .signed_duration_since(last_unlock_at)
            .max(ChronoDuration::zero());
        let threshold = ChronoDuration::minutes(i64::from(threshold_minutes));
        if idle >= threshold {
            TickDecision::Lock { idle }
        } else {
            TickDecision::Waiting {
                remaining: threshold - idle,
            }
        }
    }
}
