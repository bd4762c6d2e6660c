//! Message bus abstraction.
//!
//! The monitor needs two independent connections:
//!
//! - a **session** connection for ordinary method calls (property reads,
//!   `LockService`), and
//! - a **monitor** connection that has declared itself a bus monitor and
//!   therefore sees signal traffic addressed to other peers.
//!
//! Both are reached through [`BusConnector`] so tests can substitute an
//! in-memory bus (see `crate::testing`).

mod dbus;

use crate::error::Result;

pub use dbus::{ZbusConnector, ZbusMonitor, ZbusSession};

pub type SubscriptionId = u64;

/// Signal observed on the monitor connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSignal {
    pub interface: String,
    pub member: String,
    pub sender: Option<String>,
    pub path: Option<String>,
}

pub type BusSignalHandler = Box<dyn Fn(&BusSignal) + Send + Sync>;

/// Runs at most once, when a monitor connection ends without `close()`.
pub type ConnectionLostHandler = Box<dyn FnOnce(&str) + Send>;

/// Interface/member pair a monitor subscription matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFilter {
    pub interface: String,
    pub member: String,
}

impl SignalFilter {
    pub fn new(interface: &str, member: &str) -> Self {
        Self {
            interface: interface.to_string(),
            member: member.to_string(),
        }
    }

    /// Bus daemon match rule selecting the same traffic.
    pub fn match_rule(&self) -> String {
        format!("interface='{}',member='{}'", self.interface, self.member)
    }

    pub fn matches(&self, signal: &BusSignal) -> bool {
        signal.interface == self.interface && signal.member == self.member
    }
}

/// Ordinary session-bus connection used for blocking calls.
pub trait SessionBus: Send {
    /// `org.freedesktop.DBus.Properties.Get` for a boolean property.
    fn get_bool_property(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<bool>;

    /// Calls a method that takes no arguments and returns nothing.
    fn call_unit_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Connection that observes traffic in monitor mode.
pub trait MonitorBus: Send {
    /// `org.freedesktop.DBus.Monitoring.BecomeMonitor`. One-time per
    /// connection; without it subscriptions never fire.
    fn become_monitor(&mut self, match_rules: &[String]) -> Result<()>;

    fn subscribe(&mut self, filter: SignalFilter, handler: BusSignalHandler)
        -> Result<SubscriptionId>;

    /// Returns `false` when `id` was not subscribed.
    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;

    /// Replaces the callback for the connection dropping underneath us. Not
    /// called after `close()`.
    fn on_connection_lost(&mut self, handler: ConnectionLostHandler);

    fn close(&mut self) -> Result<()>;
}

/// Opens the connections the monitor owns for its lifetime.
pub trait BusConnector {
    type Session: SessionBus;
    type Monitor: MonitorBus;

    fn open_session(&self) -> Result<Self::Session>;

    fn open_monitor(&self) -> Result<Self::Monitor>;
}
