//! File locations and daemon settings.
//!
//! Paths follow the XDG base directories:
//! - `$XDG_CONFIG_HOME/keyring-autolock/{preferences,daemon}.toml`
//! - `$XDG_RUNTIME_DIR/keyring-autolock/{indicator.json,daemon.sock}`
//! - `$XDG_STATE_HOME/keyring-autolock/logs/`

use crate::error::{AutolockError, Result};
use crate::monitor::MonitorOptions;
use crate::scheduler::{DEFAULT_TICK_INTERVAL, MAX_TICK_INTERVAL};
use crate::secret_service::DEFAULT_COLLECTION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_DIR: &str = "keyring-autolock";
pub const PREFERENCES_FILE: &str = "preferences.toml";
pub const DAEMON_CONFIG_FILE: &str = "daemon.toml";
pub const INDICATOR_FILE: &str = "indicator.json";
pub const SOCKET_FILE: &str = "daemon.sock";
pub const SOCKET_ENV: &str = "KEYRING_AUTOLOCK_SOCKET";

pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(AutolockError::NoDirectory("config"))
}

/// Falls back to the temp dir where no runtime dir exists.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

pub fn state_dir() -> Result<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join(APP_DIR))
        .ok_or(AutolockError::NoDirectory("state"))
}

pub fn preferences_path() -> Result<PathBuf> {
    config_dir().map(|dir| dir.join(PREFERENCES_FILE))
}

pub fn daemon_config_path() -> Result<PathBuf> {
    config_dir().map(|dir| dir.join(DAEMON_CONFIG_FILE))
}

pub fn default_indicator_path() -> PathBuf {
    runtime_dir().join(INDICATOR_FILE)
}

/// `$KEYRING_AUTOLOCK_SOCKET` when set and non-empty, else the runtime dir.
pub fn default_socket_path() -> PathBuf {
    match std::env::var(SOCKET_ENV) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => runtime_dir().join(SOCKET_FILE),
    }
}

pub fn log_dir() -> Result<PathBuf> {
    state_dir().map(|dir| dir.join("logs"))
}

/// Settings read from `daemon.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub tick_interval_secs: u64,
    pub collection: String,
    pub indicator_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL.as_secs(),
            collection: DEFAULT_COLLECTION.to_string(),
            indicator_path: None,
            socket_path: None,
        }
    }
}

impl DaemonConfig {
    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            collection: self.collection.clone(),
        }
    }

    pub fn indicator_path(&self) -> PathBuf {
        self.indicator_path
            .clone()
            .unwrap_or_else(default_indicator_path)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

/// Loads `daemon.toml`; a missing file yields defaults.
pub fn load_daemon_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => daemon_config_path()?,
    };

    let content = match fs_err::read_to_string(&config_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(DaemonConfig::default())
        }
        Err(source) => {
            return Err(AutolockError::Io {
                context: "read daemon config".to_string(),
                source,
            })
        }
    };

    let config: DaemonConfig =
        toml::from_str(&content).map_err(|err| AutolockError::ConfigMalformed {
            path: config_path.clone(),
            details: err.to_string(),
        })?;
    if config.tick_interval_secs > MAX_TICK_INTERVAL.as_secs() {
        return Err(AutolockError::ConfigMalformed {
            path: config_path,
            details: format!(
                "tick-interval-secs must be at most {}",
                MAX_TICK_INTERVAL.as_secs()
            ),
        });
    }
    if config.collection.trim().is_empty() {
        return Err(AutolockError::ConfigMalformed {
            path: config_path,
            details: "collection must not be empty".to_string(),
        });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempdir().expect("temp dir");
        let config = load_daemon_config(Some(&dir.path().join("daemon.toml"))).expect("load");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.monitor_options(), MonitorOptions::default());
    }

    #[test]
    fn parses_partial_config() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("daemon.toml");
        fs_err::write(
            &path,
            r#"
tick-interval-secs = 30
collection = "session"
socket-path = "/tmp/autolock-test.sock"
"#,
        )
        .expect("write");

        let config = load_daemon_config(Some(&path)).expect("load");
        assert_eq!(config.tick_interval_secs, 30);
        assert_eq!(config.monitor_options().collection, "session");
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/autolock-test.sock"));
    }

    #[test]
    fn rejects_unknown_keys_and_empty_collection() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("daemon.toml");

        fs_err::write(&path, "tick-seconds = 5\n").expect("write");
        assert!(matches!(
            load_daemon_config(Some(&path)),
            Err(AutolockError::ConfigMalformed { .. })
        ));

        fs_err::write(&path, "collection = \"  \"\n").expect("write");
        assert!(matches!(
            load_daemon_config(Some(&path)),
            Err(AutolockError::ConfigMalformed { .. })
        ));
    }

    #[test]
    fn rejects_tick_interval_longer_than_a_day() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("daemon.toml");

        fs_err::write(&path, "tick-interval-secs = 9223372036854775807\n").expect("write");
        let err = load_daemon_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("tick-interval-secs"));

        fs_err::write(&path, "tick-interval-secs = 86400\n").expect("write");
        let config = load_daemon_config(Some(&path)).expect("load");
        assert_eq!(config.monitor_options().tick_interval, MAX_TICK_INTERVAL);
    }

    #[test]
    fn runtime_files_share_app_dir() {
        assert_eq!(
            default_indicator_path().parent(),
            Some(runtime_dir().as_path())
        );
    }
}
