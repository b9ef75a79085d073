//! # ktrace-core
//!
//! Asynchronous event tracing: many producers, one writer thread per sink.
//!
//! Producers build a record with [`Tracer::allocate`] (or just call
//! [`Tracer::emit`]), hand it to the queue of the sink they are bound to, and
//! return. The queue decides whether to wake the writer now, coalesce into one
//! delayed wake-up, or make the producer wait for a bounded time. A sink that
//! fails a write is detached from every producer sharing it.
//!
//! ### Key Submodules:
//! - `entry`: record allocation with a per-context recursion guard
//! - `descriptor`: queue, backpressure policy and the writer thread
//! - `registry`: de-duplication of sinks by identity
//! - `attach`: binding contexts to sinks behind an authorization hook
//! - `tracer`: the process-wide context object tying it together
//!
//! ### Lock order:
//! a context binding or the registry, then descriptor state.

pub mod attach;
pub mod context;
pub mod descriptor;
pub mod entry;
pub mod error;
pub mod facility;
mod registry;
pub mod sink;
pub mod tracer;

pub mod prelude {
    pub use crate::attach::{AllowAll, AttachOutcome, Authorizer, SameOwner};
    pub use crate::context::{ContextId, ContextTable, ContextTree, TraceContext};
    pub use crate::descriptor::{SinkDescriptor, SinkErrors};
    pub use crate::entry::{EntryBuilder, TraceEntry};
    pub use crate::error::{SetupError, TraceError, TraceStatus};
    pub use crate::facility::{EventKind, Facilities};
    pub use crate::sink::{MemorySink, SinkIdentity, TraceSink};
    pub use crate::tracer::{Attached, SinkHold, Tracer, TracerBuilder};
}

pub use error::{TraceError, TraceStatus};
pub use tracer::Tracer;
