//! ## ktrace-telemetry::metrics
//! **Prometheus counters for the trace pipeline**
//!
//! The registry is owned by one tracer instance rather than the process-wide
//! default registry, so several tracers (and parallel tests) never collide.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub use prometheus::Error as PrometheusError;

/// Why a record never reached its sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Queue was at its hard cap.
    Overflow,
    /// Entry storage could not be reserved.
    NoMemory,
    /// Recursion guard was already held by the producing context.
    Busy,
    /// The sink had already been torn down.
    Done,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Overflow => "overflow",
            DropReason::NoMemory => "no_memory",
            DropReason::Busy => "busy",
            DropReason::Done => "done",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceMetrics {
    pub registry: Registry,
    pub entries_submitted: IntCounter,
    pub entries_dropped: IntCounterVec,
    pub entries_written: IntCounter,
    pub bytes_written: IntCounter,
    pub sync_waits: IntCounter,
    pub sync_timeouts: IntCounter,
    pub sink_failures: IntCounter,
    pub active_sinks: IntGauge,
    pub write_batch_entries: Histogram,
}

impl TraceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let entries_submitted = IntCounter::new(
            "ktrace_entries_submitted_total",
            "Trace records accepted into a sink queue",
        )?;
        let entries_dropped = IntCounterVec::new(
            Opts::new(
                "ktrace_entries_dropped_total",
                "Trace records discarded before reaching a sink",
            ),
            &["reason"],
        )?;
        let entries_written = IntCounter::new(
            "ktrace_entries_written_total",
            "Trace records written by sink writers",
        )?;
        let bytes_written =
            IntCounter::new("ktrace_bytes_written_total", "Bytes written to trace sinks")?;
        let sync_waits = IntCounter::new(
            "ktrace_sync_waits_total",
            "Producer submissions that waited for the writer",
        )?;
        let sync_timeouts = IntCounter::new(
            "ktrace_sync_timeouts_total",
            "Synchronous waits that gave up and marked the sink blocking",
        )?;
        let sink_failures = IntCounter::new(
            "ktrace_sink_failures_total",
            "Sinks torn down after a fatal write error",
        )?;
        let active_sinks = IntGauge::new("ktrace_active_sinks", "Sinks with a running writer")?;
        let write_batch_entries = Histogram::with_opts(
            HistogramOpts::new(
                "ktrace_write_batch_entries",
                "Records drained per writer wake-up",
            )
            .buckets(vec![1.0, 4.0, 16.0, 64.0, 256.0, 1024.0]),
        )?;

        registry.register(Box::new(entries_submitted.clone()))?;
        registry.register(Box::new(entries_dropped.clone()))?;
        registry.register(Box::new(entries_written.clone()))?;
        registry.register(Box::new(bytes_written.clone()))?;
        registry.register(Box::new(sync_waits.clone()))?;
        registry.register(Box::new(sync_timeouts.clone()))?;
        registry.register(Box::new(sink_failures.clone()))?;
        registry.register(Box::new(active_sinks.clone()))?;
        registry.register(Box::new(write_batch_entries.clone()))?;

        Ok(Self {
            registry,
            entries_submitted,
            entries_dropped,
            entries_written,
            bytes_written,
            sync_waits,
            sync_timeouts,
            sink_failures,
            active_sinks,
            write_batch_entries,
        })
    }

    #[inline]
    pub fn record_drop(&self, reason: DropReason) {
        self.entries_dropped
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.entries_dropped
            .with_label_values(&[reason.as_str()])
            .get()
    }

    #[inline]
    pub fn record_batch(&self, entries: usize, bytes: usize) {
        self.entries_written.inc_by(entries as u64);
        self.bytes_written.inc_by(bytes as u64);
        self.write_batch_entries.observe(entries as f64);
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reasons_are_labelled() {
        let metrics = TraceMetrics::new().unwrap();
        metrics.record_drop(DropReason::Overflow);
        metrics.record_drop(DropReason::Overflow);
        metrics.record_drop(DropReason::Busy);
        assert_eq!(metrics.dropped(DropReason::Overflow), 2);
        assert_eq!(metrics.dropped(DropReason::Busy), 1);
        assert_eq!(metrics.dropped(DropReason::Done), 0);

        let text = metrics.gather().unwrap();
        assert!(text.contains("ktrace_entries_dropped_total{reason=\"overflow\"} 2"));
    }

    #[test]
    fn batches_update_written_counters() {
        let metrics = TraceMetrics::new().unwrap();
        metrics.record_batch(3, 120);
        assert_eq!(metrics.entries_written.get(), 3);
        assert_eq!(metrics.bytes_written.get(), 120);
        assert_eq!(metrics.write_batch_entries.get_sample_count(), 1);
    }

    #[test]
    fn independent_registries_do_not_collide() {
        let a = TraceMetrics::new().unwrap();
        let b = TraceMetrics::new().unwrap();
        a.entries_submitted.inc();
        assert_eq!(b.entries_submitted.get(), 0);
    }
}
