//! The lock-state machine.
//!
//! [`LockStateMonitor`] owns every subscription, connection and timer the
//! daemon holds while running. It is driven by [`MonitorEvent`]s applied one
//! at a time from the event loop; nothing else mutates its state.
//!
//! ```text
//!   stopped ──start()──▶ running ──stop() / Shutdown──▶ stopped
//!                          │
//!          UnlockCompleted │ locked = false, last_unlock_at = t
//!          TimerTick       │ idle >= threshold ─▶ LockService ─▶ locked = true
//!          ManualLock      │ unless locked ─▶ LockService ─▶ locked = true
//!          BusLost         │ ─▶ stopped, reason kept in connection_lost()
//! ```

mod state;

#[cfg(test)]
mod integration_tests;

pub use state::{LockState, LockStatusView};

use crate::bus::{BusConnector, MonitorBus, SubscriptionId};
use crate::error::{AutolockError, Result};
use crate::event::{LockOutcome, LoopControl, MonitorEvent};
use crate::indicator::{Glyph, Indicator};
use crate::prefs::{PreferenceKey, PreferenceStore};
use crate::registry::{SignalRegistry, SignalSource};
use crate::scheduler::{IdleTimeoutScheduler, SchedulerMode, TickDecision, DEFAULT_TICK_INTERVAL};
use crate::secret_service::{self, SecretServiceClient, DEFAULT_COLLECTION};
use chrono::{DateTime, Utc};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const NOT_RUNNING: &str = "monitor is not running";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOptions {
    pub tick_interval: Duration,
    /// Collection alias whose `Locked` property is tracked.
    pub collection: String,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

/// What a teardown released, plus the steps that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub signals_disconnected: usize,
    pub unlock_unsubscribed: bool,
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct LockStateMonitor<B, P, I>
where
    B: BusConnector,
    P: PreferenceStore + SignalSource + 'static,
    I: Indicator,
{
    connector: B,
    prefs: Arc<P>,
    indicator: I,
    events: Sender<MonitorEvent>,
    options: MonitorOptions,
    registry: SignalRegistry,
    scheduler: IdleTimeoutScheduler,
    state: LockState,
    status: LockStatusView,
    client: Option<SecretServiceClient<B::Session>>,
    monitor_bus: Option<B::Monitor>,
    unlock_subscription: Option<SubscriptionId>,
    connection_lost: Option<String>,
    running: bool,
}

impl<B, P, I> LockStateMonitor<B, P, I>
where
    B: BusConnector,
    P: PreferenceStore + SignalSource + 'static,
    I: Indicator,
{
    /// Builds a stopped monitor. `events` is where bus and preference
    /// callbacks deliver their events.
    pub fn new(
        connector: B,
        prefs: Arc<P>,
        indicator: I,
        events: Sender<MonitorEvent>,
        options: MonitorOptions,
    ) -> Self {
        let state = LockState::new(Utc::now());
        Self {
            connector,
            prefs,
            indicator,
            events,
            scheduler: IdleTimeoutScheduler::new(options.tick_interval),
            options,
            registry: SignalRegistry::new(),
            status: LockStatusView::new(&state),
            state,
            client: None,
            monitor_bus: None,
            unlock_subscription: None,
            connection_lost: None,
            running: false,
        }
    }

    /// Acquires connections, subscriptions and the timer, then reads the
    /// current lock state.
    ///
    /// On failure everything acquired so far is released and the monitor
    /// stays stopped.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.running {
            return Err(AutolockError::AlreadyRunning);
        }
        self.state = LockState::new(now);
        self.connection_lost = None;

        if let Err(err) = self.acquire() {
            error!(error = %err, "Monitor start-up failed; releasing acquired resources");
            let report = self.teardown();
            if !report.is_clean() {
                warn!(failures = report.errors.len(), "Teardown after failed start was incomplete");
            }
            self.publish_status();
            return Err(err);
        }

        self.running = true;
        self.publish_status();
        info!(
            collection = %self.options.collection,
            locked = self.state.locked,
            timeout_minutes = self.prefs.timeout_minutes(),
            tick_secs = self.scheduler.interval().as_secs(),
            "Keyring auto-lock monitor started"
        );
        Ok(())
    }

    fn acquire(&mut self) -> Result<()> {
        self.apply_visibility();

        let source: Arc<dyn SignalSource> = self.prefs.clone();
        for key in PreferenceKey::ALL {
            let events = self.events.clone();
            self.registry.connect(
                Some(&source),
                &key.changed_signal(),
                Box::new(move |_| {
                    if events.send(MonitorEvent::PreferenceChanged(key)).is_err() {
                        debug!(key = key.as_str(), "Event loop gone; preference change dropped");
                    }
                }),
            );
        }

        let session = self.connector.open_session()?;
        self.client = Some(SecretServiceClient::new(session, &self.options.collection));

        let monitor_bus = self.monitor_bus.insert(self.connector.open_monitor()?);
        let events = self.events.clone();
        monitor_bus.on_connection_lost(Box::new(move |reason: &str| {
            let event = MonitorEvent::BusLost {
                reason: reason.to_string(),
            };
            if events.send(event).is_err() {
                debug!("Event loop gone; lost monitor connection not reported");
            }
        }));
        let events = self.events.clone();
        let subscription = secret_service::subscribe_unlock_completed(
            monitor_bus,
            Box::new(move |signal| {
                trace!(sender = ?signal.sender, path = ?signal.path, "Secret prompt completed");
                let event = MonitorEvent::UnlockCompleted {
                    observed_at: Utc::now(),
                };
                if events.send(event).is_err() {
                    debug!("Event loop gone; unlock dropped");
                }
            }),
        )?;
        self.unlock_subscription = Some(subscription);

        self.scheduler.start(Instant::now());

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AutolockError::call_failed("Locked", "session connection missing"))?;
        self.state.locked = client.is_locked()?;
        self.show_glyph();
        Ok(())
    }

    /// Releases everything in reverse acquisition order. Safe to call twice.
    pub fn stop(&mut self) -> TeardownReport {
        if !self.running {
            debug!("Stop requested on a stopped monitor");
            return TeardownReport::default();
        }
        self.running = false;
        let report = self.teardown();
        self.publish_status();
        info!(
            signals = report.signals_disconnected,
            failures = report.errors.len(),
            "Keyring auto-lock monitor stopped"
        );
        report
    }

    fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport {
            signals_disconnected: self.registry.disconnect_all(),
            ..TeardownReport::default()
        };

        if let Some(id) = self.unlock_subscription.take() {
            if let Some(monitor_bus) = self.monitor_bus.as_mut() {
                report.unlock_unsubscribed = monitor_bus.unsubscribe(id);
            }
        }

        if let Some(mut client) = self.client.take() {
            if let Err(err) = client.close() {
                report.errors.push(format!("close session connection: {err}"));
            }
        }

        if let Some(mut monitor_bus) = self.monitor_bus.take() {
            if let Err(err) = monitor_bus.close() {
                report.errors.push(format!("close monitor connection: {err}"));
            }
        }

        self.scheduler.stop();

        if let Err(err) = self.indicator.remove() {
            report.errors.push(format!("remove indicator: {err}"));
        }

        for failure in &report.errors {
            warn!(failure = %failure, "Teardown step failed");
        }
        report
    }

    /// Applies one event. Returns [`LoopControl::Exit`] after shutdown.
    pub fn handle(&mut self, event: MonitorEvent, now: DateTime<Utc>) -> LoopControl {
        match event {
            MonitorEvent::Shutdown => {
                self.stop();
                return LoopControl::Exit;
            }
            MonitorEvent::ManualLockRequested { reply } => {
                let outcome = self.request_manual_lock();
                if let Some(reply) = reply {
                    if reply.send(outcome).is_err() {
                        debug!("Manual lock requester went away before the reply");
                    }
                }
            }
            other if !self.running => {
                debug!(event = ?other, "Ignoring event; monitor is stopped");
            }
            MonitorEvent::BusLost { reason } => {
                error!(reason = %reason, "Monitor connection lost; stopping");
                self.connection_lost = Some(reason);
                self.stop();
                return LoopControl::Exit;
            }
            MonitorEvent::UnlockCompleted { observed_at } => self.on_unlock(observed_at),
            MonitorEvent::TimerTick => self.on_tick(now),
            MonitorEvent::PreferenceChanged(key) => self.on_preference_changed(key),
        }
        LoopControl::Continue
    }

    /// Locks the keyring now unless it is already believed locked.
    pub fn request_manual_lock(&mut self) -> LockOutcome {
        if !self.running {
            return LockOutcome::Failed(NOT_RUNNING.to_string());
        }
        if self.state.locked {
            debug!("Manual lock skipped; keyring already locked");
            return LockOutcome::AlreadyLocked;
        }
        self.force_lock("manual")
    }

    fn force_lock(&mut self, reason: &'static str) -> LockOutcome {
        let Some(client) = self.client.as_ref() else {
            return LockOutcome::Failed("session connection is closed".to_string());
        };
        match client.force_lock() {
            Ok(()) => {
                self.state.mark_locked();
                self.show_glyph();
                self.publish_status();
                info!(reason, "Keyring locked");
                LockOutcome::Locked
            }
            Err(err) => {
                warn!(reason, error = %err, "LockService failed; keyring state unchanged");
                LockOutcome::Failed(err.to_string())
            }
        }
    }

    fn on_unlock(&mut self, observed_at: DateTime<Utc>) {
        self.state.mark_unlocked(observed_at);
        self.show_glyph();
        self.publish_status();
        info!(at = %observed_at.to_rfc3339(), "Keyring unlocked");
    }

    fn on_tick(&mut self, now: DateTime<Utc>) {
        let threshold = self.prefs.timeout_minutes();
        let decision =
            IdleTimeoutScheduler::evaluate(self.state.locked, threshold, self.state.last_unlock_at, now);
        match decision {
            TickDecision::Lock { idle } => {
                info!(
                    idle_minutes = idle.num_minutes(),
                    threshold_minutes = threshold,
                    "Idle timeout reached"
                );
                self.force_lock("timeout");
            }
            TickDecision::Waiting { remaining } => {
                debug!(remaining_secs = remaining.num_seconds(), "Idle timeout not reached");
            }
            TickDecision::AlreadyLocked | TickDecision::Disarmed => {
                trace!(?decision, "Tick skipped");
            }
        }
    }

    fn on_preference_changed(&mut self, key: PreferenceKey) {
        match key {
            PreferenceKey::ShowIndicator => self.apply_visibility(),
            PreferenceKey::TimeoutMinutes => {
                let mode = SchedulerMode::from_threshold(self.prefs.timeout_minutes());
                info!(?mode, "Idle timeout changed");
            }
        }
    }

    fn apply_visibility(&mut self) {
        let visible = self.prefs.show_indicator();
        let result = if visible {
            self.indicator.show()
        } else {
            self.indicator.hide()
        };
        if let Err(err) = result {
            warn!(visible, error = %err, "Failed to update indicator visibility");
        }
    }

    fn show_glyph(&mut self) {
        let glyph = Glyph::for_state(self.state.locked);
        if let Err(err) = self.indicator.set_glyph(glyph) {
            warn!(?glyph, error = %err, "Failed to update indicator glyph");
        }
    }

    fn publish_status(&self) {
        self.status.publish(&self.state, self.running);
    }

    pub fn is_locked(&self) -> bool {
        self.state.locked
    }

    pub fn lock_state(&self) -> LockState {
        self.state
    }

    /// Thread-safe view for the control socket.
    pub fn status_view(&self) -> LockStatusView {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Why the last run ended on a lost monitor connection, if it did.
    pub fn connection_lost(&self) -> Option<&str> {
        self.connection_lost.as_deref()
    }

    pub fn tracked_signal_count(&self) -> usize {
        self.registry.tracked_count()
    }

    pub fn scheduler(&self) -> &IdleTimeoutScheduler {
        &self.scheduler
    }

    pub fn preferences(&self) -> &Arc<P> {
        &self.prefs
    }

    /// Time until the timer is due; `None` while stopped.
    pub fn next_tick_in(&self, now: Instant) -> Option<Duration> {
        self.scheduler.time_until_next_tick(now)
    }

    /// Returns `true` (and re-arms) when a tick is due.
    pub fn poll_timer(&mut self, now: Instant) -> bool {
        self.scheduler.poll(now)
    }
}

impl<B, P, I> Drop for LockStateMonitor<B, P, I>
where
    B: BusConnector,
    P: PreferenceStore + SignalSource + 'static,
    I: Indicator,
{
    fn drop(&mut self) {
        if self.running {
            self.stop();
        }
    }
}
