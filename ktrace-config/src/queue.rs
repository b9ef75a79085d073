//! Queue and backpressure tunables.
//!
//! Every sink descriptor snapshots these values when it is created:
//! - hard queue bound and the delayed wake-up threshold
//! - coalescing delays for plain files and interactive sinks
//! - the bounded synchronous-wait timeout

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Backpressure configuration shared by all sink descriptors.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
#[validate(schema(function = validation::validate_queue_bounds))]
pub struct QueueConfig {
    /// Hard cap on queued records per sink; submissions beyond it overflow.
    #[serde(default = "default_max_queue_length")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_queue_length: usize,

    /// Queue length above which fire-and-forget submissions wake the writer at once.
    #[serde(default = "default_delay_queue_count")]
    pub delay_queue_count: usize,

    /// Coalescing delay for regular file sinks (milliseconds).
    #[serde(default = "default_wake_delay_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub wake_delay_ms: u64,

    /// Coalescing delay for interactive sinks such as pipes (milliseconds).
    #[serde(default = "default_interactive_wake_delay_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub interactive_wake_delay_ms: u64,

    /// Upper bound on a producer's synchronous wait for the writer (milliseconds).
    #[serde(default = "default_sync_wait_timeout_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub sync_wait_timeout_ms: u64,

    /// Payloads at or above this size take the synchronous path when waiting is allowed.
    #[serde(default = "default_large_payload_threshold")]
    #[validate(range(min = 1))]
    pub large_payload_threshold: usize,

    /// Largest record body the entry allocator will reserve.
    #[serde(default = "default_max_entry_size")]
    #[validate(range(min = 64, max = 268_435_456))]
    pub max_entry_size: usize,
}

fn default_max_queue_length() -> usize {
    1000
}

fn default_delay_queue_count() -> usize {
    100
}

fn default_wake_delay_ms() -> u64 {
    5000
}

fn default_interactive_wake_delay_ms() -> u64 {
    100
}

fn default_sync_wait_timeout_ms() -> u64 {
    5000
}

fn default_large_payload_threshold() -> usize {
    4096
}

fn default_max_entry_size() -> usize {
    1 << 20
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_length: default_max_queue_length(),
            delay_queue_count: default_delay_queue_count(),
            wake_delay_ms: default_wake_delay_ms(),
            interactive_wake_delay_ms: default_interactive_wake_delay_ms(),
            sync_wait_timeout_ms: default_sync_wait_timeout_ms(),
            large_payload_threshold: default_large_payload_threshold(),
            max_entry_size: default_max_entry_size(),
        }
    }
}

impl QueueConfig {
    pub fn wake_delay(&self) -> Duration {
        Duration::from_millis(self.wake_delay_ms)
    }

    pub fn interactive_wake_delay(&self) -> Duration {
        Duration::from_millis(self.interactive_wake_delay_ms)
    }

    pub fn sync_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_wait_timeout_ms)
    }
}
