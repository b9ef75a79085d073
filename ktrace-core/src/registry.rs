//! Process-wide list of live sink descriptors.
//!
//! Descriptors are keyed by [`SinkIdentity`], so two handles to the same
//! underlying object share one queue and one writer. The lock is held only for
//! list scans and edits, never across I/O or thread start-up.

use std::sync::Arc;

use ktrace_telemetry::TraceMetrics;
use parking_lot::Mutex;
use tracing::debug;

use crate::descriptor::{SinkDescriptor, SinkOwner, Tunables};
use crate::error::TraceError;
use crate::sink::{SinkIdentity, TraceSink};

#[derive(Debug, Default)]
pub(crate) struct Registry {
    descriptors: Mutex<Vec<Arc<SinkDescriptor>>>,
}

impl Registry {
    /// Live descriptor for `identity` with a reference taken on behalf of the caller.
    ///
    /// Descriptors already marked done are skipped even if their writer is
    /// still flushing, so a torn-down sink is never handed out again.
    pub(crate) fn acquire(&self, identity: SinkIdentity) -> Option<Arc<SinkDescriptor>> {
        let descriptors = self.descriptors.lock();
        descriptors
            .iter()
            .filter(|d| d.identity() == identity)
            .find(|d| d.try_acquire())
            .cloned()
    }

    /// Returns the descriptor for `sink`'s identity, creating and starting one
    /// if none is live. The returned descriptor carries one reference for the
    /// caller; `true` means it was created by this call.
    ///
    /// A new descriptor is listed only once its writer is running, so a
    /// concurrent lookup never picks up one whose start may still fail. When a
    /// descriptor already exists, `sink` is dropped.
    pub(crate) fn lookup_or_create(
        &self,
        sink: Box<dyn TraceSink>,
        tunables: Tunables,
        metrics: &Arc<TraceMetrics>,
        owner: Arc<dyn SinkOwner>,
    ) -> Result<(Arc<SinkDescriptor>, bool), TraceError> {
        let identity = sink.identity()?;
        if let Some(existing) = self.acquire(identity) {
            return Ok((existing, false));
        }

        let candidate =
            SinkDescriptor::new(identity, sink.is_interactive(), tunables, metrics.clone());
        candidate.start(sink, owner)?;
        Ok(self.publish(candidate))
    }

    /// Lists a started descriptor unless another live one for the same
    /// identity won the race, in which case the candidate is released and its
    /// writer exits.
    fn publish(&self, candidate: Arc<SinkDescriptor>) -> (Arc<SinkDescriptor>, bool) {
        let mut descriptors = self.descriptors.lock();
        let winner = descriptors
            .iter()
            .filter(|d| d.identity() == candidate.identity())
            .find(|d| d.try_acquire())
            .cloned();
        match winner {
            Some(existing) => {
                drop(descriptors);
                debug!(
                    descriptor = candidate.serial(),
                    winner = existing.serial(),
                    "lost sink creation race, discarding descriptor"
                );
                candidate.release();
                (existing, false)
            }
            None => {
                descriptors.push(candidate.clone());
                drop(descriptors);
                debug!(
                    descriptor = candidate.serial(),
                    sink = %candidate.identity(),
                    interactive = candidate.is_interactive(),
                    "sink descriptor created"
                );
                (candidate, true)
            }
        }
    }

    /// Drops `descriptor` from the list. No-op if it is not present.
    pub(crate) fn remove(&self, descriptor: &Arc<SinkDescriptor>) -> bool {
        let mut descriptors = self.descriptors.lock();
        let before = descriptors.len();
        descriptors.retain(|d| !Arc::ptr_eq(d, descriptor));
        descriptors.len() != before
    }

    pub(crate) fn list(&self) -> Vec<Arc<SinkDescriptor>> {
        self.descriptors.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.descriptors.lock().len()
    }
}
