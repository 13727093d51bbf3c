//! `config.toml` settings, read from the store root.

use crate::CoreError;
use podroid_registry::RegistryConfig;
use podroid_runtime::DEFAULT_WRITABLE_DIRS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub registry: RegistryConfig,
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// `proot`, or `mock` to run commands directly on the host.
    pub backend: String,
    /// Path or name of the proot binary.
    pub proot: String,
    pub fake_root: bool,
    pub stop_timeout_secs: u64,
    pub startup_grace_ms: u64,
    pub writable_dirs: Vec<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            backend: "proot".to_owned(),
            proot: "proot".to_owned(),
            fake_root: true,
            stop_timeout_secs: 10,
            startup_grace_ms: 500,
            writable_dirs: DEFAULT_WRITABLE_DIRS.iter().map(|d| (*d).to_owned()).collect(),
        }
    }
}

impl RuntimeSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

impl Settings {
    /// Settings from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content).map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }
}
