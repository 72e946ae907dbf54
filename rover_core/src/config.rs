//! Host configuration, loaded from a TOML file.

use crate::error::{RoverError, RoverResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SPEEDLIM: u8 = 45;
pub const MAX_CONFIGURABLE_SPEEDLIM: u8 = 70;

/// Host configuration.
///
/// Every field has a default so a missing or partial file still yields a
/// usable configuration; an unreadable or malformed file is a startup error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// TCP port the client listener binds to.
    pub tcp_port: u16,

    /// Path of the character device for the motion-control MCU link.
    pub mcu_device: PathBuf,

    /// Directory holding the pose file, charger pose file and map pages.
    pub data_dir: PathBuf,

    /// Default speed limit applied at startup and on out-of-range requests.
    pub default_speedlim: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tcp_port: 22222,
            mcu_device: PathBuf::from("/dev/ttyAMA0"),
            data_dir: PathBuf::from("."),
            default_speedlim: DEFAULT_SPEEDLIM,
        }
    }
}

impl HostConfig {
    /// Load from a TOML file, or fall back to defaults when the file does
    /// not exist.
    pub fn load(path: &Path) -> RoverResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| RoverError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn robot_pos_file(&self) -> PathBuf {
        self.data_dir.join("robot_pos.txt")
    }

    pub fn charger_pos_file(&self) -> PathBuf {
        self.data_dir.join("charger_pos.txt")
    }

    pub fn map_page_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }
}
