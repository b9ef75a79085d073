//! In-memory sink.
//!
//! Every clone is another handle to the same buffer and shares its identity, so
//! clones unify onto one descriptor the way duplicated file handles do. Faults
//! and stalls can be injected from any handle.

use std::io::{self, IoSlice, Write};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{SinkIdentity, TraceSink};

#[derive(Debug, Default)]
struct Shared {
    buffer: Vec<u8>,
    fault: Option<io::ErrorKind>,
    would_block: usize,
    max_write: Option<usize>,
    stalled: bool,
    writes: usize,
}

#[derive(Clone, Debug)]
pub struct MemorySink {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    identity: SinkIdentity,
    interactive: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            identity: SinkIdentity::unique(),
            interactive: false,
        }
    }

    /// A sink that selects the interactive wake-up delay.
    pub fn interactive() -> Self {
        Self {
            interactive: true,
            ..Self::new()
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.shared.0.lock().buffer.clone()
    }

    pub fn len(&self) -> usize {
        self.shared.0.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful write calls, i.e. how many times the writer reached the sink.
    pub fn write_calls(&self) -> usize {
        self.shared.0.lock().writes
    }

    /// Every following write fails with `kind` until cleared.
    pub fn set_fault(&self, kind: Option<io::ErrorKind>) {
        self.shared.0.lock().fault = kind;
    }

    /// The next `count` writes report `WouldBlock`.
    pub fn set_would_block(&self, count: usize) {
        self.shared.0.lock().would_block = count;
    }

    /// Caps how many bytes a single write call accepts, forcing partial writes.
    pub fn set_max_write(&self, limit: Option<usize>) {
        self.shared.0.lock().max_write = limit;
    }

    /// While stalled, writes block until the stall is lifted.
    pub fn set_stalled(&self, stalled: bool) {
        let (lock, cvar) = &*self.shared;
        lock.lock().stalled = stalled;
        cvar.notify_all();
    }

    fn accept(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock();
        while shared.stalled {
            cvar.wait(&mut shared);
        }
        if let Some(kind) = shared.fault {
            return Err(io::Error::new(kind, "injected sink fault"));
        }
        if shared.would_block > 0 {
            shared.would_block -= 1;
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut budget = shared.max_write.unwrap_or(usize::MAX);
        let mut written = 0;
        for buf in bufs {
            let take = buf.len().min(budget);
            shared.buffer.extend_from_slice(&buf[..take]);
            written += take;
            budget -= take;
            if budget == 0 {
                break;
            }
        }
        shared.writes += 1;
        Ok(written)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.accept(&[IoSlice::new(buf)])
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.accept(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TraceSink for MemorySink {
    fn identity(&self) -> io::Result<SinkIdentity> {
        Ok(self.identity)
    }

    fn is_interactive(&self) -> bool {
        self.interactive
    }
}
