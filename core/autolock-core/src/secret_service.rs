//! Calls against the freedesktop Secret Service as implemented by
//! gnome-keyring.
//!
//! Names below are fixed external contracts and must match the service
//! exactly.

use crate::bus::{BusSignalHandler, MonitorBus, SessionBus, SignalFilter, SubscriptionId};
use crate::error::{AutolockError, Result};
use tracing::{debug, info};

pub const SECRETS_SERVICE: &str = "org.freedesktop.secrets";
pub const COLLECTION_PATH_PREFIX: &str = "/org/freedesktop/secrets/collection";
pub const COLLECTION_INTERFACE: &str = "org.freedesktop.Secret.Collection";
pub const LOCKED_PROPERTY: &str = "Locked";

pub const KEYRING_SERVICE: &str = "org.gnome.keyring";
pub const SECRETS_PATH: &str = "/org/freedesktop/secrets";
pub const SERVICE_INTERFACE: &str = "org.freedesktop.Secret.Service";
pub const LOCK_SERVICE_METHOD: &str = "LockService";

pub const PROMPT_INTERFACE: &str = "org.freedesktop.Secret.Prompt";
pub const COMPLETED_MEMBER: &str = "Completed";

pub const DEFAULT_COLLECTION: &str = "login";

/// Thin wrapper over a session connection.
pub struct SecretServiceClient<S: SessionBus> {
    session: S,
    collection_path: String,
}

impl<S: SessionBus> SecretServiceClient<S> {
    pub fn new(session: S, collection: &str) -> Self {
        Self {
            session,
            collection_path: collection_path(collection),
        }
    }

    pub fn collection_path(&self) -> &str {
        &self.collection_path
    }

    /// Reads the collection's `Locked` property. Blocks on the bus.
    pub fn is_locked(&self) -> Result<bool> {
        let locked = self.session.get_bool_property(
            SECRETS_SERVICE,
            &self.collection_path,
            COLLECTION_INTERFACE,
            LOCKED_PROPERTY,
        )?;
        debug!(collection = %self.collection_path, locked, "Queried collection lock state");
        Ok(locked)
    }

    /// Locks every collection of the service, not just the monitored one.
    pub fn force_lock(&self) -> Result<()> {
        self.session.call_unit_method(
            KEYRING_SERVICE,
            SECRETS_PATH,
            SERVICE_INTERFACE,
            LOCK_SERVICE_METHOD,
        )
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}

/// Declares monitor intent on `monitor` and subscribes `handler` to prompt
/// completion signals.
///
/// If the declaration is refused nothing is subscribed: a filter on a
/// non-monitor connection would never fire.
pub fn subscribe_unlock_completed<M: MonitorBus>(
    monitor: &mut M,
    handler: BusSignalHandler,
) -> Result<SubscriptionId> {
    let filter = unlock_filter();
    monitor
        .become_monitor(&[filter.match_rule()])
        .map_err(|err| match err {
            AutolockError::MonitorRejected(_) => err,
            other => AutolockError::MonitorRejected(other.to_string()),
        })?;
    let id = monitor.subscribe(filter, handler)?;
    info!(subscription = id, "Watching secret prompt completions");
    Ok(id)
}

pub fn collection_path(collection: &str) -> String {
    format!("{}/{}", COLLECTION_PATH_PREFIX, collection)
}

pub fn unlock_filter() -> SignalFilter {
    SignalFilter::new(PROMPT_INTERFACE, COMPLETED_MEMBER)
}
