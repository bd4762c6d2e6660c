//! D-Bus implementation of the bus traits on top of `zbus`' blocking API.

use super::{
    BusConnector, BusSignal, ConnectionLostHandler, MonitorBus, SessionBus, SignalFilter,
    SubscriptionId,
};
use crate::error::{AutolockError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};
use zbus::blocking::{Connection, MessageIterator};
use zbus::message::Type as MessageType;
use zbus::zvariant::OwnedValue;

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const MONITORING_INTERFACE: &str = "org.freedesktop.DBus.Monitoring";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const READER_THREAD_NAME: &str = "bus-monitor";

type SharedBusHandler = Arc<dyn Fn(&BusSignal) + Send + Sync>;
type SubscriptionTable = Arc<Mutex<BTreeMap<SubscriptionId, (SignalFilter, SharedBusHandler)>>>;
type LostSlot = Arc<Mutex<Option<ConnectionLostHandler>>>;

/// Opens fresh session-bus connections through `zbus`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZbusConnector;

impl ZbusConnector {
    pub fn new() -> Self {
        Self
    }
}

impl BusConnector for ZbusConnector {
    type Session = ZbusSession;
    type Monitor = ZbusMonitor;

    fn open_session(&self) -> Result<ZbusSession> {
        let connection = Connection::session()
            .map_err(|err| AutolockError::unreachable("session connection", err))?;
        debug!(unique_name = ?connection.unique_name(), "Session bus connection opened");
        Ok(ZbusSession {
            connection: Some(connection),
        })
    }

    fn open_monitor(&self) -> Result<ZbusMonitor> {
        // `Connection::session()` always builds a new connection, which is what
        // monitor mode needs: BecomeMonitor turns the whole connection receive-only.
        let connection = Connection::session()
            .map_err(|err| AutolockError::unreachable("monitor connection", err))?;
        debug!(unique_name = ?connection.unique_name(), "Monitor bus connection opened");
        Ok(ZbusMonitor {
            connection: Some(connection),
            subscriptions: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: 0,
            closed: Arc::new(AtomicBool::new(false)),
            lost: Arc::new(Mutex::new(None)),
            reader: None,
        })
    }
}

pub struct ZbusSession {
    connection: Option<Connection>,
}

impl ZbusSession {
    fn connection(&self, call: &str) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| AutolockError::call_failed(call, "connection is closed"))
    }
}

impl SessionBus for ZbusSession {
    fn get_bool_property(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<bool> {
        let call = format!("{}.{}", interface, property);
        let reply = self
            .connection(&call)?
            .call_method(
                Some(destination),
                path,
                Some(PROPERTIES_INTERFACE),
                "Get",
                &(interface, property),
            )
            .map_err(|err| AutolockError::call_failed(&call, err))?;

        let value: OwnedValue =
            reply
                .body()
                .deserialize()
                .map_err(|err| AutolockError::UnexpectedReply {
                    call: call.clone(),
                    details: err.to_string(),
                })?;
        value
            .downcast_ref::<bool>()
            .map_err(|err| AutolockError::UnexpectedReply {
                call,
                details: format!("property is not a boolean: {}", err),
            })
    }

    fn call_unit_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Result<()> {
        let call = format!("{}.{}", interface, method);
        self.connection(&call)?
            .call_method(Some(destination), path, Some(interface), method, &())
            .map_err(|err| AutolockError::call_failed(&call, err))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(connection) => connection
                .close()
                .map_err(|err| AutolockError::call_failed("close session connection", err)),
            None => Ok(()),
        }
    }
}

/// Monitor-mode connection. Once declared, a reader thread dispatches matching
/// signals to subscribed handlers until the connection is closed.
pub struct ZbusMonitor {
    connection: Option<Connection>,
    subscriptions: SubscriptionTable,
    next_id: SubscriptionId,
    closed: Arc<AtomicBool>,
    lost: LostSlot,
    reader: Option<JoinHandle<()>>,
}

impl ZbusMonitor {
    fn spawn_reader(&mut self, connection: &Connection) -> Result<()> {
        let messages = MessageIterator::from(connection.clone());
        let subscriptions = Arc::clone(&self.subscriptions);
        let closed = Arc::clone(&self.closed);
        let lost = Arc::clone(&self.lost);
        let handle = thread::Builder::new()
            .name(READER_THREAD_NAME.to_string())
            .spawn(move || read_signals(messages, subscriptions, closed, lost))
            .map_err(|source| AutolockError::Io {
                context: "spawn bus monitor reader".to_string(),
                source,
            })?;
        self.reader = Some(handle);
        Ok(())
    }
}

impl MonitorBus for ZbusMonitor {
    fn become_monitor(&mut self, match_rules: &[String]) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let connection = self
            .connection
            .clone()
            .ok_or_else(|| AutolockError::MonitorRejected("connection is closed".to_string()))?;

        let rules: Vec<&str> = match_rules.iter().map(String::as_str).collect();
        connection
            .call_method(
                Some(DBUS_SERVICE),
                DBUS_PATH,
                Some(MONITORING_INTERFACE),
                "BecomeMonitor",
                &(rules, 0u32),
            )
            .map_err(|err| AutolockError::MonitorRejected(err.to_string()))?;

        debug!(rules = ?match_rules, "Declared bus monitor");
        self.spawn_reader(&connection)
    }

    fn subscribe(
        &mut self,
        filter: SignalFilter,
        handler: super::BusSignalHandler,
    ) -> Result<SubscriptionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AutolockError::call_failed(
                "subscribe",
                "monitor connection is closed",
            ));
        }
        self.next_id = self.next_id.saturating_add(1);
        let id = self.next_id;
        lock_table(&self.subscriptions).insert(id, (filter, Arc::from(handler)));
        Ok(id)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        lock_table(&self.subscriptions).remove(&id).is_some()
    }

    fn on_connection_lost(&mut self, handler: ConnectionLostHandler) {
        *lock_slot(&self.lost) = Some(handler);
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        lock_table(&self.subscriptions).clear();
        lock_slot(&self.lost).take();
        // The reader exits on its own once the stream ends; it no longer
        // dispatches now that `closed` is set.
        self.reader = None;
        match self.connection.take() {
            Some(connection) => connection
                .close()
                .map_err(|err| AutolockError::call_failed("close monitor connection", err)),
            None => Ok(()),
        }
    }
}

impl Drop for ZbusMonitor {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn lock_table(
    table: &SubscriptionTable,
) -> MutexGuard<'_, BTreeMap<SubscriptionId, (SignalFilter, SharedBusHandler)>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_slot(slot: &LostSlot) -> MutexGuard<'_, Option<ConnectionLostHandler>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_signals(
    messages: MessageIterator,
    subscriptions: SubscriptionTable,
    closed: Arc<AtomicBool>,
    lost: LostSlot,
) {
    for message in messages {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Failed to read monitored bus message");
                continue;
            }
        };
        if message.message_type() != MessageType::Signal {
            continue;
        }

        let header = message.header();
        let (Some(interface), Some(member)) = (header.interface(), header.member()) else {
            continue;
        };
        let signal = BusSignal {
            interface: interface.to_string(),
            member: member.to_string(),
            sender: header.sender().map(|sender| sender.to_string()),
            path: header.path().map(|path| path.to_string()),
        };
        dispatch_signal(&signal, &subscriptions, &closed);
    }
    finish_reader(&closed, &lost, "monitor message stream ended");
}

/// Runs every handler whose filter matches `signal`; returns how many ran.
/// Handlers are called outside the table lock.
fn dispatch_signal(signal: &BusSignal, subscriptions: &SubscriptionTable, closed: &AtomicBool) -> usize {
    if closed.load(Ordering::SeqCst) {
        return 0;
    }
    let handlers: Vec<SharedBusHandler> = lock_table(subscriptions)
        .values()
        .filter(|(filter, _)| filter.matches(signal))
        .map(|(_, handler)| Arc::clone(handler))
        .collect();
    for handler in &handlers {
        handler(signal);
    }
    handlers.len()
}

/// Reports the connection as lost unless it was closed on purpose. Returns
/// whether a callback ran.
fn finish_reader(closed: &AtomicBool, lost: &LostSlot, reason: &str) -> bool {
    if closed.load(Ordering::SeqCst) {
        debug!("Bus monitor reader stopped");
        return false;
    }
    error!(reason, "Bus monitor connection lost; unlocks are no longer observed");
    let handler = lock_slot(lost).take();
    match handler {
        Some(handler) => {
            handler(reason);
            true
        }
        None => {
            warn!("No handler registered for a lost monitor connection");
            false
        }
    }
}
