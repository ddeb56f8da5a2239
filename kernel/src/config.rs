// Changelog Configuration
//
// Tuning knobs for the counter-record scheme and purge batching.

use serde::{Deserialize, Serialize};

/// Changelog configuration loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangelogConfig {
    /// Real records between two counter records. Zero disables them.
    pub counter_window: u64,

    /// Deletions per store transaction while purging.
    pub purge_batch_size: usize,

    /// Transactions per `purge_up_to` call.
    pub purge_max_batches: usize,
}

impl ChangelogConfig {
    /// Default built-in configuration (used if no config is provided).
    pub fn default_config() -> Self {
        Self {
            counter_window: 1000,
            purge_batch_size: 50,
            purge_max_batches: 100,
        }
    }
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self::default_config()
    }
}
