//! Signal subscription bookkeeping.
//!
//! Emitters ([`SignalSource`]) hand out a [`HandlerId`] per connected handler.
//! [`SignalRegistry`] remembers which ids belong to which emitter so that
//! everything can be disconnected in one idempotent sweep on shutdown.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub type HandlerId = u64;

/// Callback invoked with the name of the emitted signal.
pub type SignalHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Anything handlers can be attached to by signal name.
pub trait SignalSource: Send + Sync {
    fn connect(&self, signal: &str, handler: SignalHandler) -> HandlerId;

    /// Returns `false` when `id` was not connected.
    fn disconnect(&self, id: HandlerId) -> bool;
}

type SharedHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: HandlerId,
    handlers: BTreeMap<HandlerId, (String, SharedHandler)>,
}

/// In-process handler table that emitters embed to implement [`SignalSource`].
#[derive(Default)]
pub struct SignalHub {
    inner: Mutex<HubInner>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invokes every handler connected to `signal`, returning how many ran.
    ///
    /// Handlers run after the table lock is released, so they may connect or
    /// disconnect on this hub.
    pub fn emit(&self, signal: &str) -> usize {
        let targets: Vec<SharedHandler> = self
            .lock()
            .handlers
            .values()
            .filter(|(name, _)| name == signal)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &targets {
            handler(signal);
        }
        targets.len()
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }
}

impl SignalSource for SignalHub {
    fn connect(&self, signal: &str, handler: SignalHandler) -> HandlerId {
        let mut inner = self.lock();
        inner.next_id = inner.next_id.saturating_add(1);
        let id = inner.next_id;
        inner
            .handlers
            .insert(id, (signal.to_string(), Arc::from(handler)));
        id
    }

    fn disconnect(&self, id: HandlerId) -> bool {
        self.lock().handlers.remove(&id).is_some()
    }
}

struct TrackedSource {
    source: Arc<dyn SignalSource>,
    handles: BTreeSet<HandlerId>,
}

/// Table of live subscriptions, keyed by emitter identity.
#[derive(Default)]
pub struct SignalRegistry {
    tracked: HashMap<usize, TrackedSource>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `handler` to `signal` on `source` and records the handle.
    ///
    /// A missing source is a no-op: some emitters do not exist in degraded
    /// environments.
    pub fn connect(
        &mut self,
        source: Option<&Arc<dyn SignalSource>>,
        signal: &str,
        handler: SignalHandler,
    ) -> Option<HandlerId> {
        let Some(source) = source else {
            debug!(signal, "Skipping signal connection; emitter is absent");
            return None;
        };

        let id = source.connect(signal, handler);
        self.tracked
            .entry(source_key(source))
            .or_insert_with(|| TrackedSource {
                source: Arc::clone(source),
                handles: BTreeSet::new(),
            })
            .handles
            .insert(id);
        debug!(signal, handler_id = id, "Signal connected");
        Some(id)
    }

    /// Cancels every recorded handle and empties the table.
    ///
    /// Entries are drained as they are cancelled, so a second call finds
    /// nothing and returns 0.
    pub fn disconnect_all(&mut self) -> usize {
        let mut cancelled = 0usize;
        for (_, tracked) in self.tracked.drain() {
            for id in tracked.handles {
                if !tracked.source.disconnect(id) {
                    debug!(handler_id = id, "Emitter had already dropped handler");
                }
                cancelled = cancelled.saturating_add(1);
            }
        }
        cancelled
    }

    /// Number of live handles across all emitters.
    pub fn tracked_count(&self) -> usize {
        self.tracked.values().map(|tracked| tracked.handles.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}

fn source_key(source: &Arc<dyn SignalSource>) -> usize {
    Arc::as_ptr(source) as *const () as usize
}
