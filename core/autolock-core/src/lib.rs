//! # keyring-autolock-core
//!
//! Watches the desktop secret service ("keyring") and locks it again once it
//! has stayed unlocked longer than the configured idle budget.
//!
//! ## Design Principles
//!
//! - **Synchronous**: bus calls block; there is no async runtime dependency.
//! - **Single writer**: [`LockStateMonitor`] is the only owner of lock state.
//!   Bus readers, file watchers and socket threads only *send*
//!   [`MonitorEvent`]s; [`event_loop::run`] applies them one at a time.
//! - **Injected collaborators**: the bus ([`BusConnector`]), the preference
//!   store ([`PreferenceStore`]) and the indicator ([`Indicator`]) are traits so
//!   the state machine runs against fakes in tests.
//! - **Leak-free teardown**: every subscription goes through
//!   [`SignalRegistry`] or is tracked by the monitor, and `stop()` releases all
//!   of it even if individual steps fail.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use autolock_core::{
//!     event_loop, FileIndicator, FilePreferences, LockStateMonitor, MonitorOptions, ZbusConnector,
//! };
//!
//! let prefs = Arc::new(FilePreferences::load(preferences_path)?);
//! let (tx, rx) = std::sync::mpsc::channel();
//! let mut monitor = LockStateMonitor::new(
//!     ZbusConnector::new(),
//!     prefs,
//!     FileIndicator::new(indicator_path),
//!     tx,
//!     MonitorOptions::default(),
//! );
//! monitor.start(chrono::Utc::now())?;
//! event_loop::run(&mut monitor, &rx, &SHUTDOWN);
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod indicator;
pub mod monitor;
pub mod prefs;
pub mod registry;
pub mod scheduler;
pub mod secret_service;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use bus::{
    BusConnector, BusSignal, BusSignalHandler, ConnectionLostHandler, MonitorBus, SessionBus,
    SignalFilter, SubscriptionId, ZbusConnector,
};
pub use error::{AutolockError, Result};
pub use event::{LockOutcome, LoopControl, MonitorEvent};
pub use indicator::{FileIndicator, Glyph, Indicator, IndicatorSnapshot};
pub use monitor::{LockState, LockStateMonitor, LockStatusView, MonitorOptions, TeardownReport};
pub use prefs::{FilePreferences, PreferenceKey, PreferenceStore, Preferences, PreferencesWatcher};
pub use registry::{HandlerId, SignalHandler, SignalHub, SignalRegistry, SignalSource};
pub use scheduler::{IdleTimeoutScheduler, SchedulerMode, TickDecision};
pub use secret_service::SecretServiceClient;
