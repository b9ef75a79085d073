//! ## ktrace-core::descriptor
//! **One trace destination: its queue, backpressure policy and writer**
//!
//! Producers append under the descriptor lock and then pick one of three
//! paths:
//! - wait for the writer (bounded by the sync timeout) when they may block and
//!   the queue is half full, another waiter is pending, or the record is large;
//! - wake the writer now once the queue passes the delay threshold;
//! - otherwise arm a single coalescing deadline so a burst costs one wake-up.
//!
//! A wait that times out marks the descriptor blocking: later submissions stop
//! waiting until the writer catches up and clears the mark.
//!
//! The reference count, flags and queue share one lock. The count reaching zero
//! sets `DONE` exactly once; the writer then flushes what is left and exits.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use ktrace_config::QueueConfig;
use ktrace_telemetry::{DropReason, TraceMetrics};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::entry::TraceEntry;
use crate::error::TraceError;
use crate::sink::{SinkIdentity, TraceSink};

mod writer;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct DescriptorFlags: u8 {
        /// A producer is waiting for the writer to drain the queue.
        const WAIT = 1 << 0;
        /// Reference count reached zero; no new records are accepted.
        const DONE = 1 << 1;
        /// A synchronous wait timed out; producers stop waiting.
        const BLOCKING = 1 << 2;
        /// Sink is a pipe, terminal or socket.
        const INTERACTIVE = 1 << 3;
        /// A write failed; queued records are discarded unwritten.
        const FAILED = 1 << 4;
    }
}

bitflags! {
    /// Drop conditions accumulated between two writer batches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SinkErrors: u8 {
        const NO_MEMORY = 1 << 0;
        const NO_SPACE = 1 << 1;
    }
}

/// Per-descriptor snapshot of the queue tunables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Tunables {
    pub(crate) max_entries: usize,
    pub(crate) delay_queue_count: usize,
    pub(crate) wake_delay: Duration,
    pub(crate) interactive_wake_delay: Duration,
    pub(crate) sync_timeout: Duration,
}

impl From<&QueueConfig> for Tunables {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_entries: config.max_queue_length,
            delay_queue_count: config.delay_queue_count,
            wake_delay: config.wake_delay(),
            interactive_wake_delay: config.interactive_wake_delay(),
            sync_timeout: config.sync_wait_timeout(),
        }
    }
}

pub(crate) struct DescriptorState {
    queue: VecDeque<TraceEntry>,
    refs: usize,
    flags: DescriptorFlags,
    errors: SinkErrors,
    error_count: u64,
    /// Writer should drain without waiting for the coalescing deadline.
    wake_requested: bool,
    /// Pending delayed wake-up.
    wake_deadline: Option<Instant>,
    exited: bool,
}

/// The side of the tracer a writer reports back to.
pub(crate) trait SinkOwner: Send + Sync {
    /// Unbinds every context still referencing `descriptor`, without authorization.
    fn detach_all(&self, descriptor: &Arc<SinkDescriptor>);

    /// Called once by the writer after it has exited.
    fn retire(&self, descriptor: &Arc<SinkDescriptor>);
}

pub struct SinkDescriptor {
    serial: u64,
    identity: SinkIdentity,
    tunables: Tunables,
    state: Mutex<DescriptorState>,
    worker_cv: Condvar,
    sync_cv: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<TraceMetrics>,
}

impl fmt::Debug for SinkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkDescriptor")
            .field("serial", &self.serial)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl SinkDescriptor {
    /// A descriptor with one transient reference held by its creator and no writer yet.
    pub(crate) fn new(
        identity: SinkIdentity,
        interactive: bool,
        tunables: Tunables,
        metrics: Arc<TraceMetrics>,
    ) -> Arc<Self> {
        let mut flags = DescriptorFlags::empty();
        if interactive {
            flags |= DescriptorFlags::INTERACTIVE;
        }
        Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            identity,
            tunables,
            state: Mutex::new(DescriptorState {
                queue: VecDeque::new(),
                refs: 1,
                flags,
                errors: SinkErrors::empty(),
                error_count: 0,
                wake_requested: false,
                wake_deadline: None,
                exited: false,
            }),
            worker_cv: Condvar::new(),
            sync_cv: Condvar::new(),
            worker: Mutex::new(None),
            metrics,
        })
    }

    /// Spawns the writer thread, which takes exclusive ownership of `sink`.
    ///
    /// On failure the descriptor is left done and exited.
    pub(crate) fn start(
        self: &Arc<Self>,
        sink: Box<dyn TraceSink>,
        owner: Arc<dyn SinkOwner>,
    ) -> io::Result<()> {
        match writer::spawn(self.clone(), sink, owner) {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                self.metrics.active_sinks.inc();
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.flags |= DescriptorFlags::DONE;
                state.exited = true;
                Err(e)
            }
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn identity(&self) -> SinkIdentity {
        self.identity
    }

    pub fn is_interactive(&self) -> bool {
        self.state
            .lock()
            .flags
            .contains(DescriptorFlags::INTERACTIVE)
    }

    pub fn refs(&self) -> usize {
        self.state.lock().refs
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().flags.contains(DescriptorFlags::DONE)
    }

    pub fn is_blocking(&self) -> bool {
        self.state.lock().flags.contains(DescriptorFlags::BLOCKING)
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().exited
    }

    /// `true` once a write to the sink has failed.
    pub fn has_failed(&self) -> bool {
        self.state.lock().flags.contains(DescriptorFlags::FAILED)
    }

    /// Drop conditions recorded since the writer last reported them.
    pub fn pending_errors(&self) -> (SinkErrors, u64) {
        let state = self.state.lock();
        (state.errors, state.error_count)
    }

    /// Takes a reference unless the descriptor is already torn down.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.flags.contains(DescriptorFlags::DONE) {
            return false;
        }
        state.refs += 1;
        true
    }

    /// Drops a reference; the last one marks the descriptor done and wakes the writer.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.refs > 0, "descriptor released more often than acquired");
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 && !state.flags.contains(DescriptorFlags::DONE) {
            state.flags |= DescriptorFlags::DONE;
            debug!(descriptor = self.serial, sink = %self.identity, "last reference released");
            self.wake_locked(&mut state);
        }
    }

    /// Counts a drop condition for the writer's next diagnostic summary.
    pub(crate) fn record_error(&self, error: SinkErrors) {
        let mut state = self.state.lock();
        state.errors |= error;
        state.error_count += 1;
    }

    /// Queues `entry` and applies the backpressure policy.
    ///
    /// Records for a torn-down sink are dropped silently. A full queue rejects
    /// the record with [`TraceError::Overflow`].
    pub(crate) fn submit(&self, entry: TraceEntry, wait_ok: bool) -> Result<(), TraceError> {
        let mut state = self.state.lock();

        if state.flags.contains(DescriptorFlags::DONE) {
            self.metrics.record_drop(DropReason::Done);
            return Ok(());
        }
        if state.queue.len() >= self.tunables.max_entries {
            state.errors |= SinkErrors::NO_SPACE;
            state.error_count += 1;
            self.metrics.record_drop(DropReason::Overflow);
            return Err(TraceError::Overflow);
        }

        let large = entry.is_large();
        state.queue.push_back(entry);
        self.metrics.entries_submitted.inc();

        if state.flags.contains(DescriptorFlags::BLOCKING) {
            return Ok(());
        }

        if wait_ok
            && (large
                || state.flags.contains(DescriptorFlags::WAIT)
                || state.queue.len() > self.tunables.max_entries / 2)
        {
            self.wait_for_writer(&mut state);
        } else if state.queue.len() > self.tunables.delay_queue_count {
            self.wake_locked(&mut state);
        } else if state.wake_deadline.is_none() {
            let delay = if state.flags.contains(DescriptorFlags::INTERACTIVE) {
                self.tunables.interactive_wake_delay
            } else {
                self.tunables.wake_delay
            };
            state.wake_deadline = Some(Instant::now() + delay);
            // Let a sleeping writer pick up the new deadline.
            self.worker_cv.notify_one();
        }
        Ok(())
    }

    /// One bounded wait for the writer. On timeout the descriptor is marked
    /// blocking and the record stays queued.
    fn wait_for_writer(&self, state: &mut MutexGuard<'_, DescriptorState>) {
        self.metrics.sync_waits.inc();
        let deadline = Instant::now() + self.tunables.sync_timeout;
        loop {
            state.flags |= DescriptorFlags::WAIT;
            self.wake_locked(state);
            let timed_out = self.sync_cv.wait_until(state, deadline).timed_out();
            let flags = state.flags & (DescriptorFlags::WAIT | DescriptorFlags::DONE);
            if flags != DescriptorFlags::WAIT || state.exited {
                return;
            }
            if timed_out {
                state.flags |= DescriptorFlags::BLOCKING;
                self.metrics.sync_timeouts.inc();
                warn!(
                    descriptor = self.serial,
                    sink = %self.identity,
                    queued = state.queue.len(),
                    "ktrace timeout, producers stop waiting for this sink"
                );
                return;
            }
        }
    }

    /// Wakes the writer immediately, cancelling any pending delayed wake-up.
    pub fn wake(&self) {
        let mut state = self.state.lock();
        self.wake_locked(&mut state);
    }

    fn wake_locked(&self, state: &mut MutexGuard<'_, DescriptorState>) {
        state.wake_requested = true;
        state.wake_deadline = None;
        self.worker_cv.notify_one();
    }

    /// Waits until everything queued before the call has been written.
    ///
    /// Returns `false` if `timeout` elapsed first or the sink has failed, since
    /// a failed writer discards what it drains. Unlike a producer's wait, a
    /// timed-out flush leaves the blocking mark alone.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.flags.contains(DescriptorFlags::FAILED) {
                return false;
            }
            if state.exited {
                return state.queue.is_empty();
            }
            state.flags |= DescriptorFlags::WAIT;
            self.wake_locked(&mut state);
            let timed_out = self.sync_cv.wait_until(&mut state, deadline).timed_out();
            if !state.flags.contains(DescriptorFlags::WAIT) {
                return !state.flags.contains(DescriptorFlags::FAILED);
            }
            if timed_out {
                return state.exited
                    && state.queue.is_empty()
                    && !state.flags.contains(DescriptorFlags::FAILED);
            }
        }
    }

    /// Waits for the writer thread to finish. Returns `false` if it panicked.
    pub fn join(&self) -> bool {
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }

    /// Sleeps the writer until woken or the coalescing deadline passes.
    fn writer_sleep(&self, state: &mut MutexGuard<'_, DescriptorState>) {
        match state.wake_deadline {
            Some(deadline) => {
                self.worker_cv.wait_until(state, deadline);
                if state.wake_deadline.is_some_and(|d| Instant::now() >= d) {
                    state.wake_deadline = None;
                    state.wake_requested = true;
                }
            }
            None => self.worker_cv.wait(state),
        }
    }
}
