//! ## ktrace-telemetry::logging
//! **Structured logging with `tracing`**
//!
//! Writer threads are named after their sink, so thread names are on by default;
//! every diagnostic emitted by the pipeline carries `sink`/`context` fields.

use ktrace_config::TelemetryConfig;
use tracing::Span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Debug)]
pub struct TraceLogger;

impl TraceLogger {
    /// Installs the global fmt subscriber. `RUST_LOG` overrides the configured level.
    ///
    /// Returns `false` if a subscriber was already installed.
    pub fn init(config: &TelemetryConfig) -> bool {
        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
            )
            .with_thread_names(config.thread_names)
            .with_span_events(FmtSpan::NONE)
            .try_init()
            .is_ok()
    }

    /// Span entered by a sink's writer thread for its whole lifetime.
    #[inline]
    pub fn writer_span(descriptor: u64, sink: &str) -> Span {
        tracing::info_span!("ktrace_writer", descriptor = descriptor, sink = sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn writer_span_fields_reach_the_log() {
        let span = TraceLogger::writer_span(7, "inode:1:2");
        let _entered = span.enter();
        tracing::info!("writer started");
        assert!(logs_contain("writer started"));
        assert!(logs_contain("descriptor=7"));
    }
}
