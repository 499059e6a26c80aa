//! Supervision configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and capacity settings for the supervision engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Interval between supervision sweeps
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Time an operation may go without progress before it is marked FAILED
    #[serde(default = "default_max_operation_wait_ms")]
    pub max_operation_wait_ms: u64,

    /// Time a replica may stay silent before it is marked OFF_LINE
    #[serde(default = "default_max_status_wait_ms")]
    pub max_status_wait_ms: u64,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Compare-and-swap attempts before an update gives up
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,
}

fn default_scan_interval_ms() -> u64 {
    10_000
}

fn default_max_operation_wait_ms() -> u64 {
    200_000
}

fn default_max_status_wait_ms() -> u64 {
    150_000
}

fn default_event_channel_capacity() -> usize {
    4096
}

fn default_max_update_retries() -> u32 {
    32
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            max_operation_wait_ms: default_max_operation_wait_ms(),
            max_status_wait_ms: default_max_status_wait_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            max_update_retries: default_max_update_retries(),
        }
    }
}

impl SupervisionConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn max_operation_wait(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.max_operation_wait_ms).unwrap_or(i64::MAX))
    }

    pub fn max_status_wait(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.max_status_wait_ms).unwrap_or(i64::MAX))
    }
}
