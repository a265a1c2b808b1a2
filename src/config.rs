//! Dispatcher-level configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by the dispatcher, storage adapters, and reapers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqConfig {
    /// Name of the message table in backing storage.
    pub table_name: String,

    /// Retention window. Messages older than this (by `create_time`) are
    /// purged regardless of status; also the cadence of the retention reaper.
    pub message_expire: Duration,

    /// Maximum time to wait for workers to drain during graceful shutdown
    /// before forcing exit.
    pub exit_timeout: Duration,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            table_name: "mq_message".to_string(),
            message_expire: Duration::from_secs(7 * 24 * 60 * 60),
            exit_timeout: Duration::from_secs(30),
        }
    }
}
