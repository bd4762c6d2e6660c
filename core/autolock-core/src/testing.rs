//! In-memory collaborators for driving the monitor without a desktop session.
//!
//! Compiled for unit tests and behind the `test-helpers` feature.

use crate::bus::{
    BusConnector, BusSignal, BusSignalHandler, ConnectionLostHandler, MonitorBus, SessionBus,
    SignalFilter, SubscriptionId,
};
use crate::error::{AutolockError, Result};
use crate::indicator::{Glyph, Indicator};
use crate::prefs::{PreferenceKey, PreferenceStore, Preferences};
use crate::registry::{HandlerId, SignalHandler, SignalHub, SignalSource};
use crate::secret_service::LOCK_SERVICE_METHOD;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

type CallRecord = (String, String, String, String);
type SharedBusHandler = Arc<dyn Fn(&BusSignal) + Send + Sync>;

#[derive(Default)]
struct FakeBusState {
    locked: bool,
    fail_open_session: bool,
    fail_open_monitor: bool,
    reject_monitor: bool,
    fail_queries: bool,
    fail_locks: bool,
    property_reads: Vec<CallRecord>,
    method_calls: Vec<CallRecord>,
    monitor_rules: Vec<String>,
    lost_handler: Option<ConnectionLostHandler>,
    next_subscription: SubscriptionId,
    subscriptions: BTreeMap<SubscriptionId, (SignalFilter, SharedBusHandler)>,
    unsubscribed: Vec<SubscriptionId>,
    sessions_opened: usize,
    sessions_closed: usize,
    monitors_opened: usize,
    monitors_closed: usize,
}

/// Point-in-time copy of what the fake bus has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeBusSnapshot {
    pub locked: bool,
    pub property_reads: Vec<CallRecord>,
    pub method_calls: Vec<CallRecord>,
    pub monitor_rules: Vec<String>,
    pub live_subscriptions: usize,
    pub unsubscribed: Vec<SubscriptionId>,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub monitors_opened: usize,
    pub monitors_closed: usize,
}

impl FakeBusSnapshot {
    /// Number of `LockService` calls, successful or not.
    pub fn lock_calls(&self) -> usize {
        self.method_calls
            .iter()
            .filter(|(_, _, _, method)| method == LOCK_SERVICE_METHOD)
            .count()
    }
}

/// Shared in-memory bus. Clones observe the same state.
#[derive(Clone, Default)]
pub struct FakeBus {
    state: Arc<Mutex<FakeBusState>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeBusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the collection's `Locked` property as the service reports it.
    pub fn set_locked(&self, locked: bool) {
        self.state().locked = locked;
    }

    pub fn fail_open_session(&self, fail: bool) {
        self.state().fail_open_session = fail;
    }

    pub fn fail_open_monitor(&self, fail: bool) {
        self.state().fail_open_monitor = fail;
    }

    pub fn reject_monitor(&self, reject: bool) {
        self.state().reject_monitor = reject;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state().fail_queries = fail;
    }

    pub fn fail_locks(&self, fail: bool) {
        self.state().fail_locks = fail;
    }

    pub fn snapshot(&self) -> FakeBusSnapshot {
        let state = self.state();
        FakeBusSnapshot {
            locked: state.locked,
            property_reads: state.property_reads.clone(),
            method_calls: state.method_calls.clone(),
            monitor_rules: state.monitor_rules.clone(),
            live_subscriptions: state.subscriptions.len(),
            unsubscribed: state.unsubscribed.clone(),
            sessions_opened: state.sessions_opened,
            sessions_closed: state.sessions_closed,
            monitors_opened: state.monitors_opened,
            monitors_closed: state.monitors_closed,
        }
    }

    /// Drops the monitor connection as a bus restart would. Returns whether a
    /// lost-connection callback ran.
    pub fn drop_monitor_connection(&self, reason: &str) -> bool {
        let handler = self.state().lost_handler.take();
        match handler {
            Some(handler) => {
                handler(reason);
                true
            }
            None => false,
        }
    }

    /// Delivers a signal to matching subscriptions and returns how many ran.
    pub fn emit_signal(&self, interface: &str, member: &str) -> usize {
        let signal = BusSignal {
            interface: interface.to_string(),
            member: member.to_string(),
            sender: Some(":1.42".to_string()),
            path: Some("/org/freedesktop/secrets/prompt/p1".to_string()),
        };
        let targets: Vec<SharedBusHandler> = self
            .state()
            .subscriptions
            .values()
            .filter(|(filter, _)| filter.matches(&signal))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &targets {
            handler(&signal);
        }
        targets.len()
    }
}

impl BusConnector for FakeBus {
    type Session = FakeSession;
    type Monitor = FakeMonitor;

    fn open_session(&self) -> Result<FakeSession> {
        let mut state = self.state();
        if state.fail_open_session {
            return Err(AutolockError::unreachable("session connection", "fake bus is down"));
        }
        state.sessions_opened += 1;
        Ok(FakeSession {
            bus: self.clone(),
            closed: false,
        })
    }

    fn open_monitor(&self) -> Result<FakeMonitor> {
        let mut state = self.state();
        if state.fail_open_monitor {
            return Err(AutolockError::unreachable("monitor connection", "fake bus is down"));
        }
        state.monitors_opened += 1;
        Ok(FakeMonitor {
            bus: self.clone(),
            owned: Vec::new(),
            closed: false,
        })
    }
}

pub struct FakeSession {
    bus: FakeBus,
    closed: bool,
}

impl SessionBus for FakeSession {
    fn get_bool_property(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<bool> {
        let mut state = self.bus.state();
        if self.closed {
            return Err(AutolockError::call_failed(property, "connection closed"));
        }
        state.property_reads.push((
            destination.to_string(),
            path.to_string(),
            interface.to_string(),
            property.to_string(),
        ));
        if state.fail_queries {
            return Err(AutolockError::call_failed(property, "no such object"));
        }
        Ok(state.locked)
    }

    fn call_unit_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Result<()> {
        let mut state = self.bus.state();
        if self.closed {
            return Err(AutolockError::call_failed(method, "connection closed"));
        }
        state.method_calls.push((
            destination.to_string(),
            path.to_string(),
            interface.to_string(),
            method.to_string(),
        ));
        if method == LOCK_SERVICE_METHOD {
            if state.fail_locks {
                return Err(AutolockError::call_failed(method, "access denied"));
            }
            state.locked = true;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.bus.state().sessions_closed += 1;
        }
        Ok(())
    }
}

pub struct FakeMonitor {
    bus: FakeBus,
    owned: Vec<SubscriptionId>,
    closed: bool,
}

impl MonitorBus for FakeMonitor {
    fn become_monitor(&mut self, match_rules: &[String]) -> Result<()> {
        let mut state = self.bus.state();
        if state.reject_monitor {
            return Err(AutolockError::MonitorRejected(
                "org.freedesktop.DBus.Error.AccessDenied".to_string(),
            ));
        }
        state.monitor_rules.extend(match_rules.iter().cloned());
        Ok(())
    }

    fn subscribe(
        &mut self,
        filter: SignalFilter,
        handler: BusSignalHandler,
    ) -> Result<SubscriptionId> {
        if self.closed {
            return Err(AutolockError::call_failed("AddMatch", "connection closed"));
        }
        let mut state = self.bus.state();
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(id, (filter, Arc::from(handler)));
        self.owned.push(id);
        Ok(id)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.owned.retain(|owned| *owned != id);
        let mut state = self.bus.state();
        let removed = state.subscriptions.remove(&id).is_some();
        if removed {
            state.unsubscribed.push(id);
        }
        removed
    }

    fn on_connection_lost(&mut self, handler: ConnectionLostHandler) {
        if !self.closed {
            self.bus.state().lost_handler = Some(handler);
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.bus.state();
        state.lost_handler = None;
        for id in self.owned.drain(..) {
            state.subscriptions.remove(&id);
        }
        state.monitors_closed += 1;
        Ok(())
    }
}

/// Preference store held in memory; setters emit change signals.
#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<Preferences>,
    hub: SignalHub,
}

impl MemoryPreferences {
    pub fn new(show_indicator: bool, timeout_minutes: u32) -> Self {
        Self {
            values: Mutex::new(Preferences {
                show_indicator,
                timeout_minutes,
            }),
            hub: SignalHub::new(),
        }
    }

    fn values(&self) -> MutexGuard<'_, Preferences> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_show_indicator(&self, show: bool) {
        let changed = {
            let mut values = self.values();
            let changed = values.show_indicator != show;
            values.show_indicator = show;
            changed
        };
        if changed {
            self.hub
                .emit(&PreferenceKey::ShowIndicator.changed_signal());
        }
    }

    pub fn set_timeout_minutes(&self, minutes: u32) {
        let changed = {
            let mut values = self.values();
            let changed = values.timeout_minutes != minutes;
            values.timeout_minutes = minutes;
            changed
        };
        if changed {
            self.hub
                .emit(&PreferenceKey::TimeoutMinutes.changed_signal());
        }
    }

    /// Handlers currently attached, across all keys.
    pub fn handler_count(&self) -> usize {
        self.hub.handler_count()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn show_indicator(&self) -> bool {
        self.values().show_indicator
    }

    fn timeout_minutes(&self) -> u32 {
        self.values().timeout_minutes
    }
}

impl SignalSource for MemoryPreferences {
    fn connect(&self, signal: &str, handler: SignalHandler) -> HandlerId {
        self.hub.connect(signal, handler)
    }

    fn disconnect(&self, id: HandlerId) -> bool {
        self.hub.disconnect(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorCall {
    Show,
    Hide,
    Glyph(Glyph),
    Remove,
}

/// Indicator that records every call. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingIndicator {
    calls: Arc<Mutex<Vec<IndicatorCall>>>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: IndicatorCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    pub fn calls(&self) -> Vec<IndicatorCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last_glyph(&self) -> Option<Glyph> {
        self.calls().into_iter().rev().find_map(|call| match call {
            IndicatorCall::Glyph(glyph) => Some(glyph),
            _ => None,
        })
    }

    /// Visibility implied by the most recent show/hide call.
    pub fn visible(&self) -> Option<bool> {
        self.calls().into_iter().rev().find_map(|call| match call {
            IndicatorCall::Show => Some(true),
            IndicatorCall::Hide => Some(false),
            _ => None,
        })
    }

    pub fn count(&self, wanted: IndicatorCall) -> usize {
        self.calls().into_iter().filter(|call| *call == wanted).count()
    }
}

impl Indicator for RecordingIndicator {
    fn show(&mut self) -> Result<()> {
        self.record(IndicatorCall::Show);
        Ok(())
    }

    fn hide(&mut self) -> Result<()> {
        self.record(IndicatorCall::Hide);
        Ok(())
    }

    fn set_glyph(&mut self, glyph: Glyph) -> Result<()> {
        self.record(IndicatorCall::Glyph(glyph));
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        self.record(IndicatorCall::Remove);
        Ok(())
    }
}
