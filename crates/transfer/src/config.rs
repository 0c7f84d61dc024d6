use std::time::Duration;

use onetox_protocol::{MAX_AVATAR_SIZE, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_LEDGER_CAPACITY;

/// Tunables for the transfer manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// How often the progress tracker polls running transfers.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Maximum number of entries in the resume ledger.
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,

    /// Largest avatar accepted in either direction.
    #[serde(default = "default_max_avatar_bytes")]
    pub max_avatar_bytes: u64,

    /// Chunk size used by in-process sessions that generate their own
    /// chunk requests.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_ledger_capacity() -> usize {
    DEFAULT_LEDGER_CAPACITY
}

fn default_max_avatar_bytes() -> u64 {
    MAX_AVATAR_SIZE
}

fn default_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            ledger_capacity: default_ledger_capacity(),
            max_avatar_bytes: default_max_avatar_bytes(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl TransferConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.progress_interval(), Duration::from_millis(250));
        assert_eq!(cfg.ledger_capacity, 1000);
        assert_eq!(cfg.max_avatar_bytes, 65536);
        assert_eq!(cfg.chunk_size, 1371);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let cfg: TransferConfig = serde_json::from_str(r#"{"ledger_capacity":3}"#).unwrap();
        assert_eq!(cfg.ledger_capacity, 3);
        assert_eq!(cfg.progress_interval_ms, 250);
        assert_eq!(cfg.max_avatar_bytes, 65536);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = TransferConfig {
            progress_interval_ms: 0,
            ..TransferConfig::default()
        };
        assert_eq!(cfg.progress_interval(), Duration::from_millis(1));
    }
}
