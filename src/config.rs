use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime settings of an [`Environment`](crate::Environment).
///
/// Every field has a default, so a settings file only needs to list what it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Polling interval of [`Environment::run_until_idle`](crate::Environment::run_until_idle).
    pub tick_interval_ms: u64,
    /// Whether generation tasks run on the worker pool by default.
    pub threaded: bool,
    /// Whether generation tasks are shown to the user by default.
    pub visual: bool,
    /// Configurations per model evaluation in the built-in producers.
    pub batch_size: usize,
    /// Default directory for cache persistence.
    pub cache_dir: Option<Utf8PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            threaded: true,
            visual: true,
            batch_size: 64,
            cache_dir: None,
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}
