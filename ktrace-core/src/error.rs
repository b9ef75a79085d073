use std::io;

use ktrace_config::ConfigError;
use thiserror::Error;

/// Failure of a trace operation.
///
/// Producers treat every variant as "this event was not recorded"; only the
/// requester of an attach/detach operation acts on the result.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("context is not being traced")]
    NotTracing,

    #[error("not permitted to change tracing of the target")]
    PermissionDenied,

    #[error("trace entry storage exhausted")]
    ResourceExhausted,

    #[error("trace queue is full")]
    Overflow,

    #[error("tracing is already active in this context")]
    Busy,

    #[error("sink error: {0}")]
    Sink(#[from] io::Error),
}

/// Result code surfaced to collaborators (command parsers, ioctl shims).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TraceStatus {
    Ok,
    NotTracing,
    PermissionDenied,
    ResourceExhausted,
    Overflow,
    SinkError,
}

impl TraceError {
    pub fn status(&self) -> TraceStatus {
        match self {
            TraceError::NotTracing => TraceStatus::NotTracing,
            TraceError::PermissionDenied => TraceStatus::PermissionDenied,
            TraceError::ResourceExhausted | TraceError::Busy => TraceStatus::ResourceExhausted,
            TraceError::Overflow => TraceStatus::Overflow,
            TraceError::Sink(_) => TraceStatus::SinkError,
        }
    }

    /// Per-event drop conditions, which never fail the instrumented operation.
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            TraceError::ResourceExhausted | TraceError::Busy | TraceError::Overflow
        )
    }
}

impl<T> From<&Result<T, TraceError>> for TraceStatus {
    fn from(result: &Result<T, TraceError>) -> Self {
        match result {
            Ok(_) => TraceStatus::Ok,
            Err(e) => e.status(),
        }
    }
}

/// Failure while building a tracer.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] ktrace_telemetry::metrics::PrometheusError),
}
