//! Single-consumer loop that drives a [`LockStateMonitor`].
//!
//! Waits on the event channel until the scheduler's next deadline, so timer
//! ticks and external events are applied on the same thread in arrival order.
//! The OS shutdown flag is checked at least every [`SHUTDOWN_POLL_INTERVAL`].

use crate::bus::BusConnector;
use crate::event::{LoopControl, MonitorEvent};
use crate::indicator::Indicator;
use crate::monitor::{LockStateMonitor, TeardownReport};
use crate::prefs::PreferenceStore;
use crate::registry::SignalSource;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs until a `Shutdown` event, a lost monitor connection, the `shutdown`
/// flag, or a closed channel, then makes sure the monitor is stopped.
pub fn run<B, P, I>(
    monitor: &mut LockStateMonitor<B, P, I>,
    events: &Receiver<MonitorEvent>,
    shutdown: &AtomicBool,
) -> TeardownReport
where
    B: BusConnector,
    P: PreferenceStore + SignalSource + 'static,
    I: Indicator,
{
    debug!("Event loop running");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Shutdown signal received");
            break;
        }

        let now = Instant::now();
        if monitor.poll_timer(now) {
            if monitor.handle(MonitorEvent::TimerTick, Utc::now()) == LoopControl::Exit {
                break;
            }
            continue;
        }

        let wait = monitor
            .next_tick_in(now)
            .map_or(SHUTDOWN_POLL_INTERVAL, |until| until.min(SHUTDOWN_POLL_INTERVAL));
        match events.recv_timeout(wait) {
            Ok(event) => {
                if monitor.handle(event, Utc::now()) == LoopControl::Exit {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Event channel closed; leaving loop");
                break;
            }
        }
    }
    monitor.stop()
}
