//! ## ktrace-core::tracer
//! **The process-wide trace pipeline**
//!
//! A [`Tracer`] owns the sink registry, the tunables and the metrics. It is
//! created once, passed by reference to instrumented code, and torn down with
//! [`Tracer::shutdown`]. Dropping it without a shutdown still detaches every
//! context so writer threads drain and exit on their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ktrace_config::{ConfigError, KtraceConfig, QueueConfig};
use ktrace_telemetry::{DropReason, TraceMetrics};
use parking_lot::RwLock;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::attach::{self, AllowAll, AttachOutcome, Authorizer};
use crate::context::{ContextId, ContextTable, TraceContext};
use crate::descriptor::{SinkDescriptor, SinkErrors, SinkOwner, Tunables};
use crate::entry::EntryBuilder;
use crate::error::{SetupError, TraceError};
use crate::facility::{EventKind, Facilities};
use crate::registry::Registry;
use crate::sink::{SinkIdentity, TraceSink};

struct TracerShared {
    config: RwLock<QueueConfig>,
    registry: Registry,
    contexts: Arc<dyn ContextTable>,
    authorizer: Arc<dyn Authorizer>,
    metrics: Arc<TraceMetrics>,
    sequence: AtomicU64,
}

impl TracerShared {
    fn detach_everything(&self) -> Vec<Arc<SinkDescriptor>> {
        let descriptors = self.registry.list();
        for descriptor in &descriptors {
            attach::detach_all(&*self.contexts, descriptor, None);
        }
        descriptors
    }
}

/// Writers report back through a weak handle so a running writer never keeps
/// the tracer alive.
struct OwnerHandle(Weak<TracerShared>);

impl SinkOwner for OwnerHandle {
    fn detach_all(&self, descriptor: &Arc<SinkDescriptor>) {
        if let Some(shared) = self.0.upgrade() {
            attach::detach_all(&*shared.contexts, descriptor, None);
        }
    }

    fn retire(&self, descriptor: &Arc<SinkDescriptor>) {
        if let Some(shared) = self.0.upgrade() {
            shared.registry.remove(descriptor);
        }
    }
}

/// A reference on a sink descriptor held for the duration of one request.
///
/// Released on drop.
#[derive(Debug)]
pub struct SinkHold {
    descriptor: Arc<SinkDescriptor>,
    created: bool,
}

impl SinkHold {
    pub fn descriptor(&self) -> &Arc<SinkDescriptor> {
        &self.descriptor
    }

    /// `true` if opening the sink created its descriptor and writer.
    pub fn created(&self) -> bool {
        self.created
    }
}

impl Drop for SinkHold {
    fn drop(&mut self) {
        self.descriptor.release();
    }
}

/// Result of a successful [`Tracer::start_tracing`].
#[derive(Debug, Clone)]
pub struct Attached {
    pub descriptor: Arc<SinkDescriptor>,
    pub created: bool,
    pub outcome: AttachOutcome,
}

pub struct TracerBuilder {
    contexts: Arc<dyn ContextTable>,
    config: QueueConfig,
    authorizer: Arc<dyn Authorizer>,
    metrics: Option<Arc<TraceMetrics>>,
}

impl TracerBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Shares an existing metrics registry instead of creating one.
    pub fn metrics(mut self, metrics: Arc<TraceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Tracer, SetupError> {
        self.config.validate().map_err(ConfigError::from)?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(TraceMetrics::new()?),
        };
        info!(
            max_queue_length = self.config.max_queue_length,
            wake_delay_ms = self.config.wake_delay_ms,
            "tracer initialized"
        );
        Ok(Tracer {
            shared: Arc::new(TracerShared {
                config: RwLock::new(self.config),
                registry: Registry::default(),
                contexts: self.contexts,
                authorizer: self.authorizer,
                metrics,
                sequence: AtomicU64::new(0),
            }),
            shut_down: false,
        })
    }
}

pub struct Tracer {
    shared: Arc<TracerShared>,
    /// Set by `shutdown`, which has already detached every context.
    shut_down: bool,
}

impl Tracer {
    /// Starts a builder over the surrounding system's context table.
    /// Defaults: [`QueueConfig::default`] and [`AllowAll`].
    pub fn builder(contexts: Arc<dyn ContextTable>) -> TracerBuilder {
        TracerBuilder {
            contexts,
            config: QueueConfig::default(),
            authorizer: Arc::new(AllowAll),
            metrics: None,
        }
    }

    pub fn from_config(
        config: &KtraceConfig,
        contexts: Arc<dyn ContextTable>,
    ) -> Result<Self, SetupError> {
        Self::builder(contexts).config(config.queue.clone()).build()
    }

    /// Replaces the tunables. Sinks opened afterwards use the new values.
    pub fn configure(&self, config: &QueueConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.shared.config.write() = config.clone();
        info!(?config, "tracer reconfigured");
        Ok(())
    }

    pub fn config(&self) -> QueueConfig {
        self.shared.config.read().clone()
    }

    pub fn metrics(&self) -> &Arc<TraceMetrics> {
        &self.shared.metrics
    }

    pub fn contexts(&self) -> &Arc<dyn ContextTable> {
        &self.shared.contexts
    }

    /// Finds or creates the descriptor for `sink` and holds a reference on it.
    pub fn open_sink(&self, sink: impl TraceSink) -> Result<SinkHold, TraceError> {
        let tunables = Tunables::from(&*self.shared.config.read());
        let owner: Arc<dyn SinkOwner> = Arc::new(OwnerHandle(Arc::downgrade(&self.shared)));
        let (descriptor, created) = self.shared.registry.lookup_or_create(
            Box::new(sink),
            tunables,
            &self.shared.metrics,
            owner,
        )?;
        Ok(SinkHold {
            descriptor,
            created,
        })
    }

    /// Binds `target` (and its descendants when `descend`) to `sink`.
    ///
    /// An empty event mask selects [`Facilities::DEFAULT_POINTS`]. Contexts the
    /// actor may not trace are skipped and counted; the call fails with
    /// [`TraceError::PermissionDenied`] only if every one was refused.
    #[instrument(level = "debug", skip_all, fields(actor = %actor.id(), target = %target, descend = descend))]
    pub fn start_tracing(
        &self,
        actor: &TraceContext,
        target: ContextId,
        descend: bool,
        sink: impl TraceSink,
        facilities: Facilities,
    ) -> Result<Attached, TraceError> {
        let root = self
            .shared
            .contexts
            .lookup(target)
            .ok_or(TraceError::NotTracing)?;
        let facilities = if facilities.events().is_empty() {
            facilities | Facilities::DEFAULT_POINTS
        } else {
            facilities
        };

        let hold = self.open_sink(sink)?;
        let outcome = attach::change_subtree(
            &*self.shared.contexts,
            actor,
            &*self.shared.authorizer,
            &root,
            descend,
            |ctx| attach::bind(ctx, hold.descriptor(), facilities).map(|_| true),
        )?;
        if outcome.affected == 0 {
            return Err(TraceError::PermissionDenied);
        }
        info!(
            descriptor = hold.descriptor().serial(),
            sink = %hold.descriptor().identity(),
            affected = outcome.affected,
            denied = outcome.denied,
            "tracing started"
        );
        Ok(Attached {
            descriptor: hold.descriptor().clone(),
            created: hold.created(),
            outcome,
        })
    }

    /// Unbinds `target` (and its descendants when `descend`).
    ///
    /// Stopping a context that is not traced yields [`TraceError::NotTracing`].
    #[instrument(level = "debug", skip_all, fields(actor = %actor.id(), target = %target, descend = descend))]
    pub fn stop_tracing_target(
        &self,
        actor: &TraceContext,
        target: ContextId,
        descend: bool,
    ) -> Result<AttachOutcome, TraceError> {
        let root = self
            .shared
            .contexts
            .lookup(target)
            .ok_or(TraceError::NotTracing)?;
        attach::unbind_subtree(
            &*self.shared.contexts,
            actor,
            &*self.shared.authorizer,
            &root,
            descend,
        )
        .into_result()
    }

    /// Removes `facilities` from the bindings of `target` (and descendants);
    /// a context left without event bits is unbound.
    pub fn clear_facilities(
        &self,
        actor: &TraceContext,
        target: ContextId,
        descend: bool,
        facilities: Facilities,
    ) -> Result<AttachOutcome, TraceError> {
        let root = self
            .shared
            .contexts
            .lookup(target)
            .ok_or(TraceError::NotTracing)?;
        attach::change_subtree(
            &*self.shared.contexts,
            actor,
            &*self.shared.authorizer,
            &root,
            descend,
            |ctx| Ok(attach::clear_facilities(ctx, facilities)),
        )?
        .into_result()
    }

    /// Unbinds every traced context the actor may touch.
    #[instrument(level = "debug", skip_all, fields(actor = %actor.id()))]
    pub fn stop_tracing_all(&self, actor: &TraceContext) -> Result<AttachOutcome, TraceError> {
        let mut outcome = AttachOutcome::default();
        for context in self.shared.contexts.contexts() {
            if !context.is_traced() {
                continue;
            }
            if !self.shared.authorizer.can_trace(actor, &context) {
                outcome.denied += 1;
            } else if attach::unbind(&context) {
                outcome.affected += 1;
            }
        }
        outcome.into_result()
    }

    /// Unbinds every context writing to `descriptor` that the actor may touch.
    #[instrument(level = "debug", skip_all, fields(actor = %actor.id(), descriptor = descriptor.serial()))]
    pub fn clear_sink(
        &self,
        actor: &TraceContext,
        descriptor: &Arc<SinkDescriptor>,
    ) -> Result<AttachOutcome, TraceError> {
        attach::detach_all(
            &*self.shared.contexts,
            descriptor,
            Some((actor, &*self.shared.authorizer)),
        )
        .into_result()
    }

    /// Reserves a record for `context`.
    ///
    /// Payloads at or above the large-payload threshold are flagged large.
    /// Failures are counted as drops; the caller skips the event.
    pub fn allocate(
        &self,
        context: &Arc<TraceContext>,
        kind: EventKind,
        header: &[u8],
        payload_size: usize,
    ) -> Result<EntryBuilder, TraceError> {
        let (max_size, large_threshold) = {
            let config = self.shared.config.read();
            (config.max_entry_size, config.large_payload_threshold)
        };
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);

        match EntryBuilder::allocate(context, kind, header, payload_size, sequence, max_size) {
            Ok(mut builder) => {
                if payload_size >= large_threshold {
                    builder.mark_large();
                }
                Ok(builder)
            }
            Err(TraceError::Busy) => {
                self.shared.metrics.record_drop(DropReason::Busy);
                Err(TraceError::Busy)
            }
            Err(e) => {
                self.shared.metrics.record_drop(DropReason::NoMemory);
                if let Some(descriptor) = context.descriptor() {
                    descriptor.record_error(SinkErrors::NO_MEMORY);
                }
                Err(e)
            }
        }
    }

    /// Hands a built record to the producer's sink.
    ///
    /// The context stays inside the trace machinery until the record is queued.
    pub fn submit(&self, builder: EntryBuilder, wait_ok: bool) -> Result<(), TraceError> {
        let descriptor = builder
            .context()
            .descriptor()
            .ok_or(TraceError::NotTracing)?;
        let (entry, _guard) = builder.finish();
        descriptor.submit(entry, wait_ok)
    }

    /// Records one event for `context`.
    ///
    /// Returns `Ok` without recording when the binding does not select `kind`.
    pub fn emit(
        &self,
        context: &Arc<TraceContext>,
        kind: EventKind,
        header: &[u8],
        payload: &[u8],
        wait_ok: bool,
    ) -> Result<(), TraceError> {
        let facilities = context.facilities();
        if facilities.is_empty() {
            return Err(TraceError::NotTracing);
        }
        if !facilities.traces(kind) {
            return Ok(());
        }
        let mut builder = self.allocate(context, kind, header, payload.len())?;
        builder.put_payload(payload)?;
        self.submit(builder, wait_ok)
    }

    /// Copies the parent's binding to a new child when it carries `INHERIT`.
    pub fn inherit(&self, parent: &TraceContext, child: &TraceContext) -> Result<bool, TraceError> {
        let inherited = parent
            .binding
            .lock()
            .as_ref()
            .filter(|b| b.facilities.contains(Facilities::INHERIT))
            .map(|b| (b.descriptor.clone(), b.facilities));
        match inherited {
            Some((descriptor, facilities)) => {
                attach::bind(child, &descriptor, facilities)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops the binding of an exiting context.
    pub fn context_exit(&self, context: &TraceContext) -> bool {
        attach::unbind(context)
    }

    /// Every descriptor whose writer has not exited yet.
    pub fn descriptors(&self) -> Vec<Arc<SinkDescriptor>> {
        self.shared.registry.list()
    }

    /// The live descriptor for `identity`, if any.
    pub fn lookup_sink(&self, identity: SinkIdentity) -> Option<Arc<SinkDescriptor>> {
        self.shared
            .registry
            .list()
            .into_iter()
            .find(|d| d.identity() == identity && !d.is_done())
    }

    /// Waits for every live sink to drain. `false` if any did not within `timeout`.
    pub fn flush_all(&self, timeout: Duration) -> bool {
        self.descriptors()
            .iter()
            .fold(true, |ok, d| d.flush(timeout) && ok)
    }

    /// Detaches every context, then joins every writer whose last reference is
    /// gone. Returns `false` if a writer is still referenced or panicked.
    pub fn shutdown(mut self) -> bool {
        self.shut_down = true;
        let descriptors = self.shared.detach_everything();
        let mut clean = true;
        for descriptor in descriptors {
            if !descriptor.is_done() {
                warn!(
                    descriptor = descriptor.serial(),
                    refs = descriptor.refs(),
                    "sink still referenced at shutdown"
                );
                clean = false;
                continue;
            }
            clean &= descriptor.join();
        }
        info!(clean, "tracer shut down");
        clean
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        let descriptors = self.shared.detach_everything();
        info!(sinks = descriptors.len(), "tracer dropped without shutdown, contexts detached");
    }
}
