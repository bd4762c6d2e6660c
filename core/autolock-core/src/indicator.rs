//! Lock status indicator.
//!
//! The daemon has no panel of its own; [`FileIndicator`] publishes the
//! indicator as a small JSON document that status bars (waybar, polybar
//! custom modules, ...) can render.

use crate::error::{AutolockError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOCKED_SYMBOL: &str = "🔒";
pub const UNLOCKED_SYMBOL: &str = "🔓";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Glyph {
    Locked,
    Unlocked,
}

impl Glyph {
    pub fn for_state(locked: bool) -> Self {
        if locked {
            Glyph::Locked
        } else {
            Glyph::Unlocked
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Glyph::Locked => LOCKED_SYMBOL,
            Glyph::Unlocked => UNLOCKED_SYMBOL,
        }
    }
}

/// Presentation collaborator driven by the monitor.
pub trait Indicator: Send {
    fn show(&mut self) -> Result<()>;

    fn hide(&mut self) -> Result<()>;

    fn set_glyph(&mut self, glyph: Glyph) -> Result<()>;

    /// Tears the indicator down when the monitor stops.
    fn remove(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub visible: bool,
    pub locked: bool,
    pub glyph: String,
    pub updated_at: String,
}

/// Indicator rendered to a JSON file, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileIndicator {
    path: PathBuf,
    visible: bool,
    glyph: Glyph,
}

impl FileIndicator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            visible: true,
            glyph: Glyph::Unlocked,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        IndicatorSnapshot {
            visible: self.visible,
            locked: self.glyph == Glyph::Locked,
            glyph: if self.visible {
                self.glyph.symbol().to_string()
            } else {
                String::new()
            },
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    fn write_error(&self, source: std::io::Error) -> AutolockError {
        AutolockError::IndicatorWrite {
            path: self.path.clone(),
            source,
        }
    }

    fn publish(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|err| self.write_error(err))?;
        }
        let payload = serde_json::to_vec(&self.snapshot())
            .map_err(|err| self.write_error(std::io::Error::other(err)))?;
        let tmp_path = self.path.with_extension("tmp");
        fs_err::write(&tmp_path, payload).map_err(|err| self.write_error(err))?;
        fs_err::rename(&tmp_path, &self.path).map_err(|err| self.write_error(err))?;
        Ok(())
    }
}

impl Indicator for FileIndicator {
    fn show(&mut self) -> Result<()> {
        self.visible = true;
        self.publish()
    }

    fn hide(&mut self) -> Result<()> {
        self.visible = false;
        self.publish()
    }

    fn set_glyph(&mut self, glyph: Glyph) -> Result<()> {
        self.glyph = glyph;
        self.publish()
    }

    fn remove(&mut self) -> Result<()> {
        match fs_err::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.write_error(err)),
        }
    }
}
