//! # ktrace Telemetry
//!
//! Crate for logging initialisation and pipeline metrics.

pub mod logging;
pub mod metrics;

pub use logging::TraceLogger;
pub use metrics::{DropReason, TraceMetrics};
