//! keyring-autolock daemon entrypoint.
//!
//! Owns the lock-state monitor for one desktop session: watches the secret
//! service for unlocks, re-locks it after the idle timeout, and serves status
//! and manual lock requests on a Unix socket.

use autolock_core::config::{self, DaemonConfig};
use autolock_core::{event_loop, FileIndicator, FilePreferences, LockStateMonitor, ZbusConnector};
use chrono::Utc;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{error, info, warn};

mod control;
mod logging;
mod signals;

use control::{ControlContext, ControlServer};

fn main() {
    // The guard flushes the file log when dropped, so it must go before exit.
    let code = {
        let _logging_guard = logging::init();
        run()
    };
    std::process::exit(code);
}

fn run() -> i32 {
    let shutdown = match signals::install() {
        Ok(flag) => flag,
        Err(err) => {
            error!(error = %err, "Failed to install signal handlers");
            return 1;
        }
    };

    let config = match config::load_daemon_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    };

    let preferences_path = match config::preferences_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve preferences path");
            return 1;
        }
    };
    let prefs = Arc::new(FilePreferences::load_or_default(preferences_path));
    info!(
        path = %prefs.path().display(),
        show_indicator = prefs.snapshot().show_indicator,
        timeout_minutes = prefs.snapshot().timeout_minutes,
        "Preferences loaded"
    );

    let (events_tx, events_rx) = mpsc::channel();
    let mut monitor = LockStateMonitor::new(
        ZbusConnector::new(),
        Arc::clone(&prefs),
        FileIndicator::new(config.indicator_path()),
        events_tx.clone(),
        config.monitor_options(),
    );

    if let Err(err) = monitor.start(Utc::now()) {
        error!(error = %err, fatal = err.is_fatal(), "Failed to start keyring monitor");
        return 1;
    }

    let watcher = match prefs.spawn_watcher() {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(error = %err, "Failed to start preference watcher; changes need a restart");
            None
        }
    };

    let socket_path = config.socket_path();
    let socket_bound = match ControlServer::bind(&socket_path) {
        Ok(server) => {
            let context = ControlContext {
                status: monitor.status_view(),
                prefs: prefs.clone(),
                events: events_tx,
                started_at: Utc::now(),
            };
            let path = server.path().display().to_string();
            if let Err(err) = server.spawn(context) {
                warn!(error = %err, path = %path, "Failed to start control socket thread");
            }
            true
        }
        Err(err) => {
            warn!(error = %err, path = %socket_path.display(), "Control socket unavailable");
            false
        }
    };

    info!(pid = std::process::id(), "Keyring auto-lock daemon started");

    let report = event_loop::run(&mut monitor, &events_rx, shutdown);

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    if socket_bound {
        control::remove_socket(&socket_path);
    }

    info!(
        signals_disconnected = report.signals_disconnected,
        clean = report.is_clean(),
        "Keyring auto-lock daemon stopped"
    );

    match monitor.connection_lost() {
        Some(reason) => {
            error!(reason = %reason, "Exiting after losing the monitor connection");
            1
        }
        None => 0,
    }
}
