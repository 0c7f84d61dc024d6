//! Loopback configuration.
//!
//! Read from the TOML file given as the first argument, or from
//! `onetox-loopback.toml` in the working directory. A missing file means
//! defaults.

use std::path::{Path, PathBuf};

use onetox_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "onetox-loopback.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Transfer manager tunables, shared by both sides.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Resume ledger of the receiving side.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Where received files are written.
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,

    /// File to send. A generated file is sent when unset.
    #[serde(default)]
    pub source_file: Option<PathBuf>,

    /// Size of the generated file.
    #[serde(default = "default_demo_bytes")]
    pub demo_bytes: u64,

    /// Pause the download, drop the connection and reconnect mid-transfer.
    #[serde(default = "default_true")]
    pub simulate_interruption: bool,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("onetox-loopback/resume.json")
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("onetox-loopback/downloads")
}

fn default_demo_bytes() -> u64 {
    256 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            ledger_path: default_ledger_path(),
            downloads_dir: default_downloads_dir(),
            source_file: None,
            demo_bytes: default_demo_bytes(),
            simulate_interruption: default_true(),
        }
    }
}

impl LoopbackConfig {
    /// Loads configuration from `path`, or from the default file.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoopbackConfig = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration read");
        Ok(config)
    }

    /// Directory holding generated files and the ledger.
    pub fn work_dir(&self) -> PathBuf {
        self.ledger_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}
