use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};

/// lower entry used as the root of every descriptor chain
pub const DEFAULT_BASE_LAYER: &str = "/opt/overlaybd/baselayers/.commit";

/// diagnostic log written by the block backend, relative to zdfsmeta
pub const DEFAULT_RESULT_FILE: &str = "init-debug.log";

/// preparation settings, stored as toml
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// file referenced by the first lower of a base layer
    pub base_layer: PathBuf,
    /// name of the diagnostic log inside each layer's zdfsmeta dir
    pub result_file_name: String,
    /// trace path recorded in descriptors; empty disables trace recording
    pub record_trace_path: String,
    /// optional flock target serializing preparation across processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_file: Option<PathBuf>,
    /// snapshotter state dir holding `snapshots/<id>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots_dir: Option<PathBuf>,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// directory of a snapshot id, relative to the working dir when no
    /// `snapshots_dir` is configured
    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.snapshots_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
            .join("snapshots")
            .join(id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_layer: PathBuf::from(DEFAULT_BASE_LAYER),
            result_file_name: DEFAULT_RESULT_FILE.to_string(),
            record_trace_path: String::new(),
            lock_file: None,
            snapshots_dir: None,
        }
    }
}
