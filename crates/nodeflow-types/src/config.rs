//! Engine configuration types.
//!
//! `EngineConfig` is stored in `config.toml` under the data directory. Every
//! field has a serde default so partial files load cleanly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each per-node queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Bound of each instance's dead-letter queue.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Lease granted on checked-out messages.
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    /// Period of the expired-lease reclaim pass.
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,
    /// Node timeout applied when a node definition sets none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_node_timeout_secs: Option<u64>,
    /// Save a checkpoint after each node completion and at terminal status.
    #[serde(default = "default_auto_checkpoint")]
    pub auto_checkpoint: bool,
    /// Directory for durable checkpoints (defaults to `<data_dir>/checkpoints`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_lease_duration_secs() -> u64 {
    300
}

fn default_reclaim_interval_ms() -> u64 {
    1000
}

fn default_auto_checkpoint() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            dead_letter_capacity: default_dead_letter_capacity(),
            event_buffer: default_event_buffer(),
            lease_duration_secs: default_lease_duration_secs(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            default_node_timeout_secs: None,
            auto_checkpoint: default_auto_checkpoint(),
            checkpoint_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms.max(1))
    }

    pub fn default_node_timeout(&self) -> Option<Duration> {
        self.default_node_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.queue_capacity, 1024);
        assert!(config.auto_checkpoint);
    }

    #[test]
    fn partial_toml_overrides_selected_fields() {
        let config: EngineConfig =
            toml::from_str("dead_letter_capacity = 10\nauto_checkpoint = false").unwrap();
        assert_eq!(config.dead_letter_capacity, 10);
        assert!(!config.auto_checkpoint);
        assert_eq!(config.lease_duration(), Duration::from_secs(300));
    }

    #[test]
    fn reclaim_interval_never_zero() {
        let config = EngineConfig {
            reclaim_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.reclaim_interval(), Duration::from_millis(1));
    }
}
