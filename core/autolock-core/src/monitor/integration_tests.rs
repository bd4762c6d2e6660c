//! Monitor scenarios driven end to end through the in-memory bus.

use super::*;
use crate::secret_service::{COMPLETED_MEMBER, PROMPT_INTERFACE};
use crate::testing::{FakeBus, IndicatorCall, MemoryPreferences, RecordingIndicator};
use chrono::Duration as ChronoDuration;
use std::sync::mpsc::{self, Receiver};

type TestMonitor = LockStateMonitor<FakeBus, MemoryPreferences, RecordingIndicator>;

struct Harness {
    bus: FakeBus,
    prefs: Arc<MemoryPreferences>,
    indicator: RecordingIndicator,
    rx: Receiver<MonitorEvent>,
    monitor: TestMonitor,
}

impl Harness {
    fn new(timeout_minutes: u32) -> Self {
        Self::with_options(timeout_minutes, MonitorOptions::default())
    }

    fn with_options(timeout_minutes: u32, options: MonitorOptions) -> Self {
        let bus = FakeBus::new();
        let prefs = Arc::new(MemoryPreferences::new(true, timeout_minutes));
        let indicator = RecordingIndicator::new();
        let (tx, rx) = mpsc::channel();
        let monitor = LockStateMonitor::new(
            bus.clone(),
            Arc::clone(&prefs),
            indicator.clone(),
            tx,
            options,
        );
        Self {
            bus,
            prefs,
            indicator,
            rx,
            monitor,
        }
    }

    /// Applies every queued event, as the loop would.
    fn drain(&mut self, now: DateTime<Utc>) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.monitor.handle(event, now);
            applied += 1;
        }
        applied
    }

    fn tick(&mut self, now: DateTime<Utc>) {
        self.monitor.handle(MonitorEvent::TimerTick, now);
    }

    fn lock_calls(&self) -> usize {
        self.bus.snapshot().lock_calls()
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
        .expect("parse")
        .with_timezone(&Utc)
}

fn minutes(n: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::minutes(n)
}

#[test]
fn start_reads_lock_state_and_wires_everything() {
    let mut h = Harness::new(5);
    h.bus.set_locked(true);

    h.monitor.start(t0()).expect("start");

    assert!(h.monitor.is_running());
    assert!(h.monitor.is_locked());
    assert_eq!(
        h.indicator.calls(),
        vec![IndicatorCall::Show, IndicatorCall::Glyph(Glyph::Locked)]
    );
    assert_eq!(h.monitor.tracked_signal_count(), 2);
    assert_eq!(h.prefs.handler_count(), 2);
    assert!(h.monitor.scheduler().is_running());

    let bus = h.bus.snapshot();
    assert_eq!(bus.sessions_opened, 1);
    assert_eq!(bus.monitors_opened, 1);
    assert_eq!(bus.live_subscriptions, 1);
    assert_eq!(bus.monitor_rules.len(), 1);
    assert_eq!(bus.property_reads.len(), 1);
}

#[test]
fn hidden_indicator_preference_applies_at_start() {
    let mut h = Harness::new(5);
    h.prefs.set_show_indicator(false);

    h.monitor.start(t0()).expect("start");

    assert_eq!(h.indicator.visible(), Some(false));
    assert_eq!(h.indicator.last_glyph(), Some(Glyph::Unlocked));
}

#[test]
fn second_start_is_rejected() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");

    let err = h.monitor.start(minutes(1)).unwrap_err();

    assert!(matches!(err, AutolockError::AlreadyRunning));
    assert_eq!(h.bus.snapshot().sessions_opened, 1);
    assert!(h.monitor.is_running());
}

#[test]
fn every_unlock_delivery_resets_idle_time() {
    let mut h = Harness::new(5);
    h.bus.set_locked(true);
    h.monitor.start(t0()).expect("start");

    for offset in [3, 9, 9, 20] {
        h.monitor.handle(
            MonitorEvent::UnlockCompleted {
                observed_at: minutes(offset),
            },
            minutes(offset),
        );
        assert!(!h.monitor.is_locked());
        assert_eq!(h.monitor.lock_state().last_unlock_at, minutes(offset));
    }
    assert_eq!(h.indicator.count(IndicatorCall::Glyph(Glyph::Unlocked)), 4);
}

#[test]
fn prompt_completed_signal_reaches_the_loop() {
    let mut h = Harness::new(5);
    let started = Utc::now() - ChronoDuration::hours(1);
    h.bus.set_locked(true);
    h.monitor.start(started).expect("start");

    assert_eq!(h.bus.emit_signal(PROMPT_INTERFACE, COMPLETED_MEMBER), 1);
    assert_eq!(h.drain(Utc::now()), 1);

    assert!(!h.monitor.is_locked());
    assert!(h.monitor.lock_state().last_unlock_at > started);
    assert_eq!(h.indicator.last_glyph(), Some(Glyph::Unlocked));
}

#[test]
fn locks_once_when_threshold_elapses() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");

    for minute in 1..=4 {
        h.tick(minutes(minute));
        assert_eq!(h.lock_calls(), 0, "no lock expected at minute {minute}");
    }

    h.tick(minutes(5));
    assert_eq!(h.lock_calls(), 1);
    assert!(h.monitor.is_locked());
    assert_eq!(h.indicator.last_glyph(), Some(Glyph::Locked));

    h.tick(minutes(6));
    h.tick(minutes(7));
    assert_eq!(h.lock_calls(), 1);
}

#[test]
fn zero_threshold_disables_timeout_until_raised() {
    let mut h = Harness::new(10);
    h.monitor.start(t0()).expect("start");
    h.tick(minutes(8));

    h.prefs.set_timeout_minutes(0);
    assert_eq!(h.drain(minutes(8)), 1);
    for minute in [9, 10, 60, 600] {
        h.tick(minutes(minute));
    }
    assert_eq!(h.lock_calls(), 0);

    h.prefs.set_timeout_minutes(10);
    h.drain(minutes(601));
    h.tick(minutes(601));
    assert_eq!(h.lock_calls(), 1);
    assert!(h.monitor.is_locked());
}

#[test]
fn lock_then_unlock_round_trips_glyph() {
    let mut h = Harness::new(1);
    h.monitor.start(t0()).expect("start");

    h.tick(minutes(1));
    assert!(h.monitor.is_locked());

    h.monitor.handle(
        MonitorEvent::UnlockCompleted {
            observed_at: minutes(2),
        },
        minutes(2),
    );
    assert!(!h.monitor.is_locked());
    assert_eq!(h.indicator.last_glyph(), Some(Glyph::Unlocked));

    h.tick(minutes(2));
    assert_eq!(h.lock_calls(), 1);
    h.tick(minutes(3));
    assert_eq!(h.lock_calls(), 2);
}

#[test]
fn failed_lock_leaves_state_unlocked_and_next_tick_retries() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");
    h.bus.fail_locks(true);

    h.tick(minutes(5));
    assert_eq!(h.lock_calls(), 1);
    assert!(!h.monitor.is_locked());
    assert_ne!(h.indicator.last_glyph(), Some(Glyph::Locked));

    h.bus.fail_locks(false);
    h.tick(minutes(6));
    assert_eq!(h.lock_calls(), 2);
    assert!(h.monitor.is_locked());
}

#[test]
fn manual_lock_while_locked_makes_no_bus_call() {
    let mut h = Harness::new(5);
    h.bus.set_locked(true);
    h.monitor.start(t0()).expect("start");

    assert_eq!(h.monitor.request_manual_lock(), LockOutcome::AlreadyLocked);
    assert_eq!(h.lock_calls(), 0);
}

#[test]
fn manual_lock_event_replies_with_outcome() {
    let mut h = Harness::new(0);
    h.monitor.start(t0()).expect("start");
    let (reply_tx, reply_rx) = mpsc::channel();

    let control = h.monitor.handle(
        MonitorEvent::ManualLockRequested {
            reply: Some(reply_tx),
        },
        minutes(1),
    );

    assert_eq!(control, LoopControl::Continue);
    assert_eq!(reply_rx.recv().expect("reply"), LockOutcome::Locked);
    assert!(h.monitor.is_locked());
    assert!(h.monitor.status_view().is_locked());
}

#[test]
fn manual_lock_failure_is_reported() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");
    h.bus.fail_locks(true);

    let outcome = h.monitor.request_manual_lock();

    assert!(matches!(outcome, LockOutcome::Failed(_)));
    assert!(!outcome.is_locked());
    assert!(!h.monitor.is_locked());
}

#[test]
fn show_indicator_change_toggles_visibility() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");

    h.prefs.set_show_indicator(false);
    h.drain(minutes(1));
    assert_eq!(h.indicator.visible(), Some(false));

    h.prefs.set_show_indicator(true);
    h.drain(minutes(2));
    assert_eq!(h.indicator.visible(), Some(true));
}

#[test]
fn stop_before_any_tick_releases_everything() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");

    let report = h.monitor.stop();

    assert!(report.is_clean());
    assert_eq!(report.signals_disconnected, 2);
    assert!(report.unlock_unsubscribed);
    assert_eq!(h.monitor.tracked_signal_count(), 0);
    assert_eq!(h.prefs.handler_count(), 0);
    assert!(!h.monitor.scheduler().is_running());
    assert_eq!(h.monitor.next_tick_in(std::time::Instant::now()), None);
    assert!(!h.monitor.is_running());
    assert!(!h.monitor.status_view().is_running());

    let bus = h.bus.snapshot();
    assert_eq!(bus.live_subscriptions, 0);
    assert_eq!(bus.unsubscribed.len(), 1);
    assert_eq!(bus.sessions_closed, 1);
    assert_eq!(bus.monitors_closed, 1);
    assert_eq!(h.indicator.calls().last(), Some(&IndicatorCall::Remove));
}

#[test]
fn stopping_twice_cancels_nothing_twice() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");
    h.monitor.stop();

    let second = h.monitor.stop();

    assert_eq!(second, TeardownReport::default());
    let bus = h.bus.snapshot();
    assert_eq!(bus.unsubscribed.len(), 1);
    assert_eq!(bus.sessions_closed, 1);
    assert_eq!(bus.monitors_closed, 1);
    assert_eq!(h.indicator.count(IndicatorCall::Remove), 1);
}

#[test]
fn events_after_stop_are_ignored() {
    let mut h = Harness::new(1);
    h.monitor.start(t0()).expect("start");
    h.monitor.stop();
    let before = h.monitor.lock_state();

    h.monitor.handle(
        MonitorEvent::UnlockCompleted {
            observed_at: minutes(30),
        },
        minutes(30),
    );
    h.tick(minutes(60));
    h.prefs.set_show_indicator(false);
    assert_eq!(h.drain(minutes(60)), 0);

    assert_eq!(h.monitor.lock_state(), before);
    assert_eq!(h.lock_calls(), 0);
    assert_eq!(
        h.monitor.request_manual_lock(),
        LockOutcome::Failed("monitor is not running".to_string())
    );
}

#[test]
fn shutdown_event_stops_and_exits() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");

    let control = h.monitor.handle(MonitorEvent::Shutdown, minutes(1));

    assert_eq!(control, LoopControl::Exit);
    assert!(!h.monitor.is_running());
    assert_eq!(h.bus.snapshot().live_subscriptions, 0);
}

#[test]
fn refused_monitor_declaration_aborts_start_cleanly() {
    let mut h = Harness::new(5);
    h.bus.reject_monitor(true);

    let err = h.monitor.start(t0()).unwrap_err();

    assert!(matches!(err, AutolockError::MonitorRejected(_)));
    assert!(err.is_fatal());
    assert!(!h.monitor.is_running());
    assert_eq!(h.monitor.tracked_signal_count(), 0);
    assert_eq!(h.prefs.handler_count(), 0);
    assert!(!h.monitor.scheduler().is_running());

    let bus = h.bus.snapshot();
    assert_eq!(bus.live_subscriptions, 0);
    assert_eq!(bus.sessions_closed, 1);
    assert_eq!(bus.monitors_closed, 1);
}

#[test]
fn unreachable_bus_aborts_start() {
    let mut h = Harness::new(5);
    h.bus.fail_open_session(true);

    let err = h.monitor.start(t0()).unwrap_err();

    assert!(matches!(err, AutolockError::BusUnreachable { .. }));
    assert!(err.is_fatal());
    assert_eq!(h.prefs.handler_count(), 0);
    assert_eq!(h.bus.snapshot().monitors_opened, 0);
}

#[test]
fn failed_initial_query_releases_connections() {
    let mut h = Harness::new(5);
    h.bus.fail_queries(true);

    let err = h.monitor.start(t0()).unwrap_err();

    assert!(matches!(err, AutolockError::CallFailed { .. }));
    assert!(!err.is_fatal());
    let bus = h.bus.snapshot();
    assert_eq!(bus.live_subscriptions, 0);
    assert_eq!(bus.sessions_closed, 1);
    assert_eq!(bus.monitors_closed, 1);
    assert!(!h.monitor.scheduler().is_running());
}

#[test]
fn monitor_can_restart_after_stop() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");
    h.monitor.stop();

    h.monitor.start(minutes(10)).expect("restart");

    assert!(h.monitor.is_running());
    assert_eq!(h.monitor.tracked_signal_count(), 2);
    assert_eq!(h.monitor.lock_state().last_unlock_at, minutes(10));
    assert_eq!(h.bus.snapshot().sessions_opened, 2);
}

#[test]
fn lost_monitor_connection_stops_and_exits() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");

    assert!(h.bus.drop_monitor_connection("monitor message stream ended"));
    let event = h.rx.try_recv().expect("lost event queued");
    let control = h.monitor.handle(event, minutes(1));

    assert_eq!(control, LoopControl::Exit);
    assert!(!h.monitor.is_running());
    assert_eq!(h.monitor.connection_lost(), Some("monitor message stream ended"));
    assert_eq!(h.indicator.calls().last(), Some(&IndicatorCall::Remove));
    let bus = h.bus.snapshot();
    assert_eq!(bus.live_subscriptions, 0);
    assert_eq!(bus.sessions_closed, 1);
    assert_eq!(bus.monitors_closed, 1);
}

#[test]
fn deliberate_stop_never_reports_a_lost_connection() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");
    h.monitor.stop();

    assert!(!h.bus.drop_monitor_connection("monitor message stream ended"));
    assert!(h.rx.try_recv().is_err());
    assert_eq!(h.monitor.connection_lost(), None);
}

#[test]
fn restart_clears_lost_connection() {
    let mut h = Harness::new(5);
    h.monitor.start(t0()).expect("start");
    h.bus.drop_monitor_connection("bus restarted");
    h.drain(minutes(1));
    assert!(h.monitor.connection_lost().is_some());

    h.monitor.start(minutes(2)).expect("restart");

    assert_eq!(h.monitor.connection_lost(), None);
    assert!(h.bus.drop_monitor_connection("bus restarted again"));
}

#[test]
fn callbacks_survive_a_vanished_event_loop() {
    let Harness {
        bus,
        prefs,
        rx,
        mut monitor,
        ..
    } = Harness::new(5);
    monitor.start(t0()).expect("start");
    drop(rx);

    prefs.set_timeout_minutes(9);
    assert_eq!(bus.emit_signal(PROMPT_INTERFACE, COMPLETED_MEMBER), 1);
    assert!(bus.drop_monitor_connection("stream ended"));

    assert!(monitor.is_running());
    monitor.stop();
}

#[test]
fn oversized_tick_interval_starts_without_overflow() {
    let options = MonitorOptions {
        tick_interval: Duration::from_secs(i64::MAX as u64),
        ..MonitorOptions::default()
    };
    let mut h = Harness::with_options(5, options);

    h.monitor.start(t0()).expect("start");

    assert!(h.monitor.scheduler().is_running());
    assert_eq!(
        h.monitor.scheduler().interval(),
        crate::scheduler::MAX_TICK_INTERVAL
    );
}
