//! The per-sink writer thread.
//!
//! It is the only reader of the queue and the only user of the sink. Each
//! wake-up detaches the whole queue as one batch and writes it with vectored
//! writes; a hard write error stops tracing to the sink for every producer.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::Backoff;
use ktrace_telemetry::TraceLogger;
use parking_lot::MutexGuard;
use tracing::{debug, error, warn};

use super::{DescriptorFlags, SinkDescriptor, SinkOwner};
use crate::entry::TraceEntry;
use crate::sink::TraceSink;

/// Most I/O slices handed to a single write call.
const MAX_IOV: usize = 64;

/// Pause between retries once spinning on `WouldBlock` stops helping.
const WOULD_BLOCK_PAUSE: Duration = Duration::from_millis(1);

pub(super) fn spawn(
    descriptor: Arc<SinkDescriptor>,
    sink: Box<dyn TraceSink>,
    owner: Arc<dyn SinkOwner>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("ktrace-writer-{}", descriptor.serial))
        .spawn(move || {
            Writer {
                descriptor,
                sink,
                owner,
                failed: false,
            }
            .run()
        })
}

struct Writer {
    descriptor: Arc<SinkDescriptor>,
    sink: Box<dyn TraceSink>,
    owner: Arc<dyn SinkOwner>,
    /// Set after a hard write error; later batches are discarded unwritten.
    failed: bool,
}

impl Writer {
    fn run(mut self) {
        let span = TraceLogger::writer_span(
            self.descriptor.serial,
            &self.descriptor.identity.to_string(),
        );
        let _entered = span.enter();
        debug!("writer started");

        let descriptor = self.descriptor.clone();
        let mut state = descriptor.state.lock();
        loop {
            if state.queue.is_empty() {
                if state.flags.contains(DescriptorFlags::WAIT) {
                    state
                        .flags
                        .remove(DescriptorFlags::WAIT | DescriptorFlags::BLOCKING);
                    descriptor.sync_cv.notify_all();
                }
                if state.refs == 0 {
                    break;
                }
                state.wake_requested = false;
                state.wake_deadline = None;
                descriptor.writer_sleep(&mut state);
                continue;
            }

            if !state.wake_requested && !state.flags.contains(DescriptorFlags::DONE) {
                // Coalescing window still open.
                descriptor.writer_sleep(&mut state);
                continue;
            }

            let batch = std::mem::take(&mut state.queue);
            let errors = std::mem::take(&mut state.errors);
            let error_count = std::mem::take(&mut state.error_count);

            let written = MutexGuard::unlocked(&mut state, || {
                if error_count > 0 {
                    warn!(
                        errors = ?errors,
                        count = error_count,
                        "ktrace failed to record some events"
                    );
                }
                self.write_batch(batch)
            });
            if !written {
                // Set before WAIT is cleared so a flush sees it.
                state.flags |= DescriptorFlags::FAILED;
            }
        }

        state.exited = true;
        descriptor.sync_cv.notify_all();
        drop(state);

        descriptor.metrics.active_sinks.dec();
        self.owner.retire(&descriptor);
        debug!("writer exited");
    }

    /// `false` if the batch was discarded.
    fn write_batch(&mut self, batch: VecDeque<TraceEntry>) -> bool {
        if self.failed {
            return false;
        }
        let entries = batch.len();
        let bytes: usize = batch.iter().map(TraceEntry::wire_len).sum();

        match self.write_all(&batch) {
            Ok(()) => {
                self.descriptor.metrics.record_batch(entries, bytes);
                true
            }
            Err(e) => {
                self.failed = true;
                self.descriptor.metrics.sink_failures.inc();
                error!(error = %e, "ktrace write failed, tracing stopped");
                self.owner.detach_all(&self.descriptor);
                false
            }
        }
        // Entries are freed here on every path.
    }

    fn write_all(&mut self, batch: &VecDeque<TraceEntry>) -> io::Result<()> {
        let mut segments = batch.iter().flat_map(TraceEntry::segments).peekable();
        while segments.peek().is_some() {
            let mut slices: Vec<IoSlice<'_>> =
                segments.by_ref().take(MAX_IOV).map(IoSlice::new).collect();
            self.write_slices(&mut slices)?;
        }
        self.sink.flush()
    }

    fn write_slices(&mut self, slices: &mut [IoSlice<'_>]) -> io::Result<()> {
        let mut bufs = slices;
        let backoff = Backoff::new();
        while !bufs.is_empty() {
            match self.sink.write_vectored(bufs) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    IoSlice::advance_slices(&mut bufs, n);
                    backoff.reset();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if backoff.is_completed() {
                        thread::sleep(WOULD_BLOCK_PAUSE);
                    } else {
                        backoff.snooze();
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextId, TraceContext};
    use crate::descriptor::Tunables;
    use crate::entry::{decode_stream, EntryBuilder};
    use crate::facility::EventKind;
    use crate::sink::MemorySink;
    use ktrace_telemetry::TraceMetrics;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingOwner {
        detached: Mutex<Vec<u64>>,
        retired: Mutex<Vec<u64>>,
    }

    impl SinkOwner for RecordingOwner {
        fn detach_all(&self, descriptor: &Arc<SinkDescriptor>) {
            self.detached.lock().push(descriptor.serial());
            descriptor.release();
        }

        fn retire(&self, descriptor: &Arc<SinkDescriptor>) {
            self.retired.lock().push(descriptor.serial());
        }
    }

    fn started(sink: &MemorySink) -> (Arc<SinkDescriptor>, Arc<RecordingOwner>) {
        let descriptor = SinkDescriptor::new(
            sink.identity().unwrap(),
            sink.is_interactive(),
            Tunables {
                max_entries: 64,
                delay_queue_count: 32,
                wake_delay: Duration::from_secs(30),
                interactive_wake_delay: Duration::from_millis(200),
                sync_timeout: Duration::from_secs(2),
            },
            Arc::new(TraceMetrics::new().unwrap()),
        );
        let owner = Arc::new(RecordingOwner::default());
        descriptor
            .start(Box::new(sink.clone()), owner.clone())
            .unwrap();
        (descriptor, owner)
    }

    fn entry(seq: u64, payload: &[u8]) -> TraceEntry {
        let ctx = TraceContext::new(ContextId::new(3, 1), "w", 0);
        let mut builder =
            EntryBuilder::allocate(&ctx, EventKind::USER, b"", payload.len(), seq, 1 << 16)
                .unwrap();
        builder.put_payload(payload).unwrap();
        builder.finish().0
    }

    fn sequences(sink: &MemorySink) -> Vec<u64> {
        decode_stream(&sink.contents())
            .into_iter()
            .map(|(_, _, seq, _)| seq)
            .collect()
    }

    #[test]
    fn flush_writes_in_submission_order() {
        let sink = MemorySink::new();
        let (d, _owner) = started(&sink);
        for seq in 0..10 {
            d.submit(entry(seq, b"payload"), false).unwrap();
        }
        assert!(d.flush(Duration::from_secs(5)));
        assert_eq!(sequences(&sink), (0..10).collect::<Vec<_>>());
        d.release();
        assert!(d.join());
        assert!(d.has_exited());
    }

    #[test]
    fn partial_and_would_block_writes_are_retried() {
        let sink = MemorySink::new();
        sink.set_max_write(Some(7));
        sink.set_would_block(3);
        let (d, _owner) = started(&sink);
        for seq in 0..5 {
            d.submit(entry(seq, &[seq as u8; 33]), false).unwrap();
        }
        assert!(d.flush(Duration::from_secs(5)));
        assert_eq!(sequences(&sink), vec![0, 1, 2, 3, 4]);
        d.release();
        assert!(d.join());
    }

    #[test]
    fn many_entries_span_several_vectored_writes() {
        let sink = MemorySink::new();
        let (d, _owner) = started(&sink);
        for seq in 0..40 {
            d.submit(entry(seq, b"x"), false).unwrap();
        }
        assert!(d.flush(Duration::from_secs(5)));
        // 80 segments at most 64 per call.
        assert!(sink.write_calls() >= 2);
        assert_eq!(sequences(&sink).len(), 40);
        d.release();
        assert!(d.join());
    }

    #[test]
    fn hard_error_detaches_and_discards() {
        let sink = MemorySink::new();
        sink.set_fault(Some(io::ErrorKind::BrokenPipe));
        let (d, owner) = started(&sink);
        d.submit(entry(0, b"lost"), false).unwrap();
        d.wake();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !d.has_exited() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(d.join());
        assert!(d.has_exited());
        assert_eq!(owner.detached.lock().as_slice(), &[d.serial()]);
        assert_eq!(owner.retired.lock().as_slice(), &[d.serial()]);
        assert!(sink.is_empty());
        assert_eq!(d.metrics.sink_failures.get(), 1);
    }

    #[test]
    fn flush_after_a_write_failure_reports_the_loss() {
        let sink = MemorySink::new();
        let (d, owner) = started(&sink);
        // Second reference keeps the descriptor alive past the detach.
        assert!(d.try_acquire());
        sink.set_fault(Some(io::ErrorKind::BrokenPipe));
        d.submit(entry(0, b"lost"), false).unwrap();

        assert!(!d.flush(Duration::from_secs(2)));
        assert!(d.has_failed());
        assert!(!d.has_exited());
        assert!(sink.is_empty());
        assert_eq!(owner.detached.lock().as_slice(), &[d.serial()]);

        d.submit(entry(1, b"also lost"), false).unwrap();
        assert!(!d.flush(Duration::from_secs(2)));

        d.release();
        assert!(d.join());
        assert!(!d.flush(Duration::from_millis(10)));
        assert!(sink.is_empty());
    }

    #[test]
    fn last_release_flushes_remaining_entries_then_exits() {
        let sink = MemorySink::new();
        let (d, owner) = started(&sink);
        d.submit(entry(0, b"a"), false).unwrap();
        d.submit(entry(1, b"b"), false).unwrap();
        d.release();
        assert!(d.join());
        assert_eq!(sequences(&sink), vec![0, 1]);
        assert!(owner.detached.lock().is_empty());
        assert_eq!(d.refs(), 0);
    }

    #[test]
    fn coalescing_deadline_triggers_a_single_write() {
        let sink = MemorySink::interactive();
        let (d, _owner) = started(&sink);
        assert!(d.is_interactive());
        for seq in 0..5 {
            d.submit(entry(seq, b"burst"), false).unwrap();
        }
        assert!(sink.is_empty(), "nothing written before the delay elapses");

        let deadline = Instant::now() + Duration::from_secs(5);
        while sequences(&sink).len() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sequences(&sink), vec![0, 1, 2, 3, 4]);
        assert_eq!(sink.write_calls(), 1);
        d.release();
        assert!(d.join());
    }

    #[test]
    fn spawn_names_the_thread_after_the_descriptor() {
        let sink = MemorySink::new();
        let (d, _owner) = started(&sink);
        let name = d
            .worker
            .lock()
            .as_ref()
            .and_then(|h| h.thread().name().map(str::to_owned));
        assert_eq!(name, Some(format!("ktrace-writer-{}", d.serial())));
        d.release();
        assert!(d.join());
    }
}
