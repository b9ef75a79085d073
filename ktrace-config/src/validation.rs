//! Custom validation functions for configuration.
//!
//! Cross-field checks that the `range` attributes cannot express.

use validator::ValidationError;

use crate::QueueConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// The delayed wake-up threshold must sit inside the hard queue cap, and the
/// interactive delay may only shorten the regular one.
pub fn validate_queue_bounds(config: &QueueConfig) -> Result<(), ValidationError> {
    if config.delay_queue_count > config.max_queue_length {
        return Err(ValidationError::new("delay_queue_count_exceeds_max"));
    }
    if config.interactive_wake_delay_ms > config.wake_delay_ms {
        return Err(ValidationError::new("interactive_delay_exceeds_wake_delay"));
    }
    Ok(())
}

/// Validate a `tracing` level name.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}
