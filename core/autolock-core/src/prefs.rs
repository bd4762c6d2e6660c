//! User preferences: indicator visibility and idle timeout.
//!
//! Stored as TOML so they can be edited by hand:
//!
//! ```toml
//! show-indicator = true
//! timeout-minutes = 15
//! ```
//!
//! [`FilePreferences`] re-reads the file when it changes on disk and emits
//! `changed::<key>` for every key whose value differs. [`PreferencesWatcher`]
//! drives the re-reads from filesystem notifications on the parent directory,
//! so editors that save by writing a temp file and renaming it are seen too.

use crate::error::{AutolockError, Result};
use crate::registry::{HandlerId, SignalHandler, SignalHub, SignalSource};
use crate::scheduler::MAX_TIMEOUT_MINUTES;
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const SHOW_INDICATOR_KEY: &str = "show-indicator";
pub const TIMEOUT_MINUTES_KEY: &str = "timeout-minutes";
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceKey {
    ShowIndicator,
    TimeoutMinutes,
}

impl PreferenceKey {
    pub const ALL: [PreferenceKey; 2] = [PreferenceKey::ShowIndicator, PreferenceKey::TimeoutMinutes];

    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceKey::ShowIndicator => SHOW_INDICATOR_KEY,
            PreferenceKey::TimeoutMinutes => TIMEOUT_MINUTES_KEY,
        }
    }

    /// Signal name emitted when this key changes.
    pub fn changed_signal(&self) -> String {
        format!("changed::{}", self.as_str())
    }

    pub fn from_signal(signal: &str) -> Option<Self> {
        let key = signal.strip_prefix("changed::")?;
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == key)
    }
}

/// Read access to the live preference values.
pub trait PreferenceStore: Send + Sync {
    fn show_indicator(&self) -> bool;

    /// Idle budget in minutes, `0..=1440`; 0 disables auto-lock.
    fn timeout_minutes(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Preferences {
    #[serde(default = "default_show_indicator")]
    pub show_indicator: bool,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            show_indicator: default_show_indicator(),
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

fn default_show_indicator() -> bool {
    true
}

fn default_timeout_minutes() -> u32 {
    DEFAULT_TIMEOUT_MINUTES
}

impl Preferences {
    /// Parses TOML, clamping an over-long timeout to the maximum.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let mut prefs: Preferences =
            toml::from_str(content).map_err(|err| AutolockError::PreferencesMalformed {
                path: path.to_path_buf(),
                details: err.to_string(),
            })?;
        if prefs.timeout_minutes > MAX_TIMEOUT_MINUTES {
            warn!(
                path = %path.display(),
                value = prefs.timeout_minutes,
                max = MAX_TIMEOUT_MINUTES,
                "timeout-minutes out of range; clamping"
            );
            prefs.timeout_minutes = MAX_TIMEOUT_MINUTES;
        }
        Ok(prefs)
    }

    pub fn changed_keys(&self, other: &Preferences) -> Vec<PreferenceKey> {
        let mut changed = Vec::new();
        if self.show_indicator != other.show_indicator {
            changed.push(PreferenceKey::ShowIndicator);
        }
        if self.timeout_minutes != other.timeout_minutes {
            changed.push(PreferenceKey::TimeoutMinutes);
        }
        changed
    }
}

/// Preference store backed by a TOML file.
pub struct FilePreferences {
    path: PathBuf,
    values: RwLock<Preferences>,
    modified: Mutex<Option<SystemTime>>,
    hub: SignalHub,
}

impl FilePreferences {
    /// Loads `path`; a missing file yields defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let modified = modified_time(&path);
        let values = read_preferences(&path)?;
        debug!(path = %path.display(), ?values, "Preferences loaded");
        Ok(Self {
            path,
            values: RwLock::new(values),
            modified: Mutex::new(modified),
            hub: SignalHub::new(),
        })
    }

    /// Like [`FilePreferences::load`], but a malformed or unreadable file is
    /// logged and replaced by defaults until it next changes.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(prefs) => prefs,
            Err(err) => {
                warn!(error = %err, "Failed to load preferences; using defaults");
                Self {
                    modified: Mutex::new(modified_time(&path)),
                    path,
                    values: RwLock::new(Preferences::default()),
                    hub: SignalHub::new(),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Preferences {
        *self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Re-reads the file and emits a change signal per changed key.
    ///
    /// On a parse error the previous values stay in effect.
    pub fn reload(&self) -> Result<Vec<PreferenceKey>> {
        let fresh = read_preferences(&self.path)?;
        let changed = {
            let mut values = self
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = values.changed_keys(&fresh);
            *values = fresh;
            changed
        };
        for key in &changed {
            info!(key = key.as_str(), "Preference changed");
            self.hub.emit(&key.changed_signal());
        }
        Ok(changed)
    }

    /// Reloads only if the file's modification time moved (or it appeared or
    /// disappeared).
    pub fn refresh_if_modified(&self) -> Result<Vec<PreferenceKey>> {
        let current = modified_time(&self.path);
        {
            let mut last = self
                .modified
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *last == current {
                return Ok(Vec::new());
            }
            *last = current;
        }
        self.reload()
    }

    /// Re-reads the file after a filesystem event touched it.
    ///
    /// Unlike [`FilePreferences::refresh_if_modified`] this does not skip on an
    /// unchanged mtime: a write split across two events can land within one
    /// timestamp tick.
    fn refresh_after_event(&self) -> Result<Vec<PreferenceKey>> {
        *self
            .modified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = modified_time(&self.path);
        self.reload()
    }

    fn is_own_event(&self, event: &Event) -> bool {
        match event.kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {}
            EventKind::Access(_) => return false,
            _ => {}
        }
        let Some(name) = self.path.file_name() else {
            return false;
        };
        event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(name))
    }

    /// Watches the preferences file's directory and reloads on every change
    /// to the file. The returned watcher stops when dropped.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<PreferencesWatcher> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs_err::create_dir_all(&dir).map_err(|source| AutolockError::Io {
            context: "create preferences directory".to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::channel::<WatchMessage>();
        let forward = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = forward.send(WatchMessage::Fs(res));
        })
        .map_err(|err| watch_error("create preferences watcher", err))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| watch_error("watch preferences directory", err))?;

        let prefs = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("prefs-watcher".to_string())
            .spawn(move || {
                for message in rx {
                    match message {
                        WatchMessage::Stop => break,
                        WatchMessage::Fs(Err(err)) => {
                            warn!(error = %err, "Preference watch error");
                        }
                        WatchMessage::Fs(Ok(event)) if prefs.is_own_event(&event) => {
                            debug!(kind = ?event.kind, "Preferences file changed");
                            if let Err(err) = prefs.refresh_after_event() {
                                warn!(error = %err, "Failed to reload preferences; keeping previous values");
                            }
                        }
                        WatchMessage::Fs(Ok(_)) => {}
                    }
                }
                debug!("Preference watcher stopped");
            })
            .map_err(|source| AutolockError::Io {
                context: "spawn preferences watcher".to_string(),
                source,
            })?;

        debug!(dir = %dir.display(), "Preference watcher started");
        Ok(PreferencesWatcher {
            watcher: Some(watcher),
            stop: tx,
            thread: Some(thread),
        })
    }
}

enum WatchMessage {
    Fs(notify::Result<Event>),
    Stop,
}

fn watch_error(context: &str, err: notify::Error) -> AutolockError {
    AutolockError::Io {
        context: context.to_string(),
        source: std::io::Error::other(err),
    }
}

/// Handle to a running preferences watcher.
pub struct PreferencesWatcher {
    watcher: Option<RecommendedWatcher>,
    stop: Sender<WatchMessage>,
    thread: Option<JoinHandle<()>>,
}

impl PreferencesWatcher {
    /// Stops watching and joins the watcher thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.watcher.take());
        let _ = self.stop.send(WatchMessage::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Preference watcher panicked");
            }
        }
    }
}

impl Drop for PreferencesWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PreferenceStore for FilePreferences {
    fn show_indicator(&self) -> bool {
        self.snapshot().show_indicator
    }

    fn timeout_minutes(&self) -> u32 {
        self.snapshot().timeout_minutes
    }
}

impl SignalSource for FilePreferences {
    fn connect(&self, signal: &str, handler: SignalHandler) -> HandlerId {
        self.hub.connect(signal, handler)
    }

    fn disconnect(&self, id: HandlerId) -> bool {
        self.hub.disconnect(id)
    }
}

fn read_preferences(path: &Path) -> Result<Preferences> {
    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Preferences::default())
        }
        Err(source) => {
            return Err(AutolockError::Io {
                context: "read preferences".to_string(),
                source,
            })
        }
    };
    Preferences::parse(&content, path)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs_err::metadata(path)
        .ok()
        .and_then(|metadata| metadata.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempdir().expect("temp dir");
        let prefs = FilePreferences::load(dir.path().join("preferences.toml")).expect("load");
        assert!(prefs.show_indicator());
        assert_eq!(prefs.timeout_minutes(), DEFAULT_TIMEOUT_MINUTES);
    }

    #[test]
    fn parses_kebab_case_keys() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        fs_err::write(&path, "show-indicator = false\ntimeout-minutes = 0\n").expect("write");

        let prefs = FilePreferences::load(&path).expect("load");
        assert!(!prefs.show_indicator());
        assert_eq!(prefs.timeout_minutes(), 0);
    }

    #[test]
    fn clamps_timeout_above_one_day() {
        let prefs = Preferences::parse("timeout-minutes = 5000", Path::new("p.toml")).expect("parse");
        assert_eq!(prefs.timeout_minutes, MAX_TIMEOUT_MINUTES);
    }

    #[test]
    fn rejects_negative_timeout() {
        let err = Preferences::parse("timeout-minutes = -3", Path::new("p.toml")).unwrap_err();
        assert!(matches!(err, AutolockError::PreferencesMalformed { .. }));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = Preferences::parse("to-max = 3", Path::new("p.toml")).unwrap_err();
        assert!(matches!(err, AutolockError::PreferencesMalformed { .. }));
    }

    #[test]
    fn reload_emits_only_changed_keys() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        fs_err::write(&path, "show-indicator = true\ntimeout-minutes = 10\n").expect("write");
        let prefs = FilePreferences::load(&path).expect("load");

        let timeout_hits = Arc::new(AtomicUsize::new(0));
        let indicator_hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&timeout_hits);
        prefs.connect(
            &PreferenceKey::TimeoutMinutes.changed_signal(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&indicator_hits);
        prefs.connect(
            &PreferenceKey::ShowIndicator.changed_signal(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        fs_err::write(&path, "show-indicator = true\ntimeout-minutes = 0\n").expect("write");
        let changed = prefs.reload().expect("reload");

        assert_eq!(changed, vec![PreferenceKey::TimeoutMinutes]);
        assert_eq!(prefs.timeout_minutes(), 0);
        assert_eq!(timeout_hits.load(Ordering::SeqCst), 1);
        assert_eq!(indicator_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_reload_keeps_previous_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        fs_err::write(&path, "timeout-minutes = 7\n").expect("write");
        let prefs = FilePreferences::load(&path).expect("load");

        fs_err::write(&path, "timeout-minutes = \"soon\"\n").expect("write");
        assert!(prefs.reload().is_err());
        assert_eq!(prefs.timeout_minutes(), 7);
    }

    #[test]
    fn refresh_detects_file_appearing() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        let prefs = FilePreferences::load(&path).expect("load");
        assert!(prefs.refresh_if_modified().expect("refresh").is_empty());

        fs_err::write(&path, "show-indicator = false\n").expect("write");
        let changed = prefs.refresh_if_modified().expect("refresh");
        assert_eq!(changed, vec![PreferenceKey::ShowIndicator]);
        assert!(prefs.refresh_if_modified().expect("refresh").is_empty());
    }

    #[test]
    fn malformed_file_at_startup_falls_back_to_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        fs_err::write(&path, "show-indicator = maybe\n").expect("write");

        let prefs = FilePreferences::load_or_default(&path);
        assert_eq!(prefs.snapshot(), Preferences::default());
        assert!(prefs.refresh_if_modified().expect("refresh").is_empty());
    }

    #[test]
    fn signal_names_round_trip_to_keys() {
        for key in PreferenceKey::ALL {
            assert_eq!(PreferenceKey::from_signal(&key.changed_signal()), Some(key));
        }
        assert_eq!(PreferenceKey::from_signal("changed::unknown"), None);
        assert_eq!(PreferenceKey::from_signal("show-indicator"), None);
    }

    #[test]
    fn watcher_reloads_on_write() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        fs_err::write(&path, "timeout-minutes = 10\n").expect("write");
        let prefs = Arc::new(FilePreferences::load(&path).expect("load"));
        let watcher = prefs.spawn_watcher().expect("watcher");

        fs_err::write(&path, "timeout-minutes = 3\n").expect("write");

        assert!(wait_until(Duration::from_secs(5), || prefs.timeout_minutes() == 3));
        watcher.stop();
    }

    #[test]
    fn watcher_sees_atomic_replace() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        let prefs = Arc::new(FilePreferences::load(&path).expect("load"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        prefs.connect(
            &PreferenceKey::ShowIndicator.changed_signal(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let watcher = prefs.spawn_watcher().expect("watcher");

        let tmp = dir.path().join(".preferences.toml.swp");
        fs_err::write(&tmp, "show-indicator = false\n").expect("write tmp");
        fs_err::rename(&tmp, &path).expect("rename");

        assert!(wait_until(Duration::from_secs(5), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        assert!(!prefs.show_indicator());
        watcher.stop();
    }

    #[test]
    fn watcher_ignores_sibling_files() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("preferences.toml");
        let prefs = Arc::new(FilePreferences::load(&path).expect("load"));
        let watcher = prefs.spawn_watcher().expect("watcher");

        fs_err::write(dir.path().join("daemon.toml"), "show-indicator = false\n").expect("write");
        thread::sleep(Duration::from_millis(300));

        assert!(prefs.show_indicator());
        watcher.stop();
    }

    #[test]
    fn stopping_watcher_is_immediate() {
        let dir = tempdir().expect("temp dir");
        let prefs = Arc::new(
            FilePreferences::load(dir.path().join("preferences.toml")).expect("load"),
        );
        let watcher = prefs.spawn_watcher().expect("watcher");

        let started = Instant::now();
        watcher.stop();
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "stop took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn watcher_creates_missing_directory() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("keyring-autolock").join("preferences.toml");
        let prefs = Arc::new(FilePreferences::load(&path).expect("load"));

        let watcher = prefs.spawn_watcher().expect("watcher");
        assert!(path.parent().expect("parent").is_dir());
        drop(watcher);
    }
}
