//! ## ktrace-core::attach
//! **Binding producers to sinks**
//!
//! A context holds at most one binding. Rebinding to a different descriptor
//! releases the old reference before acquiring the new one; binding again to
//! the same descriptor only adds facility bits.
//!
//! Lock order is context binding, then descriptor state.

use std::sync::Arc;

use tracing::debug;

use crate::context::{subtree, Binding, ContextTable, TraceContext};
use crate::descriptor::SinkDescriptor;
use crate::error::TraceError;
use crate::facility::Facilities;

/// External decision on whether one context may change another's tracing.
pub trait Authorizer: Send + Sync {
    fn can_trace(&self, actor: &TraceContext, target: &TraceContext) -> bool;
}

/// Permits everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_trace(&self, _actor: &TraceContext, _target: &TraceContext) -> bool {
        true
    }
}

/// Permits an actor to trace contexts with the same owner. Owner 0 may trace anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct SameOwner;

impl Authorizer for SameOwner {
    fn can_trace(&self, actor: &TraceContext, target: &TraceContext) -> bool {
        actor.owner() == 0 || actor.owner() == target.owner()
    }
}

impl<F> Authorizer for F
where
    F: Fn(&TraceContext, &TraceContext) -> bool + Send + Sync,
{
    fn can_trace(&self, actor: &TraceContext, target: &TraceContext) -> bool {
        self(actor, target)
    }
}

/// How many contexts an attach or detach request touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachOutcome {
    /// Contexts whose binding changed.
    pub affected: usize,
    /// Contexts skipped because the authorization hook refused them.
    pub denied: usize,
}

impl AttachOutcome {
    /// Collapses a request that changed nothing into the error a caller sees.
    pub fn into_result(self) -> Result<Self, TraceError> {
        match self {
            Self { affected: 0, denied } if denied > 0 => Err(TraceError::PermissionDenied),
            Self { affected: 0, .. } => Err(TraceError::NotTracing),
            outcome => Ok(outcome),
        }
    }
}

/// Binds `context` to `descriptor` with `facilities`.
///
/// Fails with [`TraceError::NotTracing`] when the descriptor is already torn
/// down; the context is left unbound in that case.
pub(crate) fn bind(
    context: &TraceContext,
    descriptor: &Arc<SinkDescriptor>,
    facilities: Facilities,
) -> Result<(), TraceError> {
    let mut binding = context.binding.lock();
    if let Some(current) = binding.as_mut() {
        if Arc::ptr_eq(&current.descriptor, descriptor) {
            current.facilities |= facilities;
            return Ok(());
        }
    }

    if let Some(old) = binding.take() {
        old.descriptor.release();
    }
    if !descriptor.try_acquire() {
        return Err(TraceError::NotTracing);
    }
    *binding = Some(Binding {
        descriptor: descriptor.clone(),
        facilities,
    });
    debug!(context = %context.id(), descriptor = descriptor.serial(), ?facilities, "bound");
    Ok(())
}

/// Drops the binding of `context`. `false` if it was not traced.
pub(crate) fn unbind(context: &TraceContext) -> bool {
    let old = context.binding.lock().take();
    match old {
        Some(old) => {
            old.descriptor.release();
            debug!(context = %context.id(), descriptor = old.descriptor.serial(), "unbound");
            true
        }
        None => false,
    }
}

/// Removes `facilities` from the binding; unbinds once no event bits remain.
pub(crate) fn clear_facilities(context: &TraceContext, facilities: Facilities) -> bool {
    let mut binding = context.binding.lock();
    let Some(current) = binding.as_mut() else {
        return false;
    };
    current.facilities.remove(facilities);
    if current.facilities.events().is_empty() {
        if let Some(old) = binding.take() {
            old.descriptor.release();
        }
    }
    true
}

/// Applies `change` to every context of the subtree at `root` that `actor` may
/// trace. `change` returns whether it modified the context.
pub(crate) fn change_subtree(
    table: &dyn ContextTable,
    actor: &TraceContext,
    authorizer: &dyn Authorizer,
    root: &Arc<TraceContext>,
    descend: bool,
    mut change: impl FnMut(&TraceContext) -> Result<bool, TraceError>,
) -> Result<AttachOutcome, TraceError> {
    let mut outcome = AttachOutcome::default();
    for context in subtree(table, root, descend) {
        if !authorizer.can_trace(actor, &context) {
            outcome.denied += 1;
            continue;
        }
        if change(&context)? {
            outcome.affected += 1;
        }
    }
    Ok(outcome)
}

/// Unbinds every context of the subtree at `root` that `actor` may trace.
pub(crate) fn unbind_subtree(
    table: &dyn ContextTable,
    actor: &TraceContext,
    authorizer: &dyn Authorizer,
    root: &Arc<TraceContext>,
    descend: bool,
) -> AttachOutcome {
    let mut outcome = AttachOutcome::default();
    for context in subtree(table, root, descend) {
        if !authorizer.can_trace(actor, &context) {
            outcome.denied += 1;
        } else if unbind(&context) {
            outcome.affected += 1;
        }
    }
    outcome
}

/// Unbinds every context in `table` bound to `descriptor`.
///
/// With `actor` set, each context is checked against the authorizer first.
/// Without it the detach is forced, as after a sink failure.
pub(crate) fn detach_all(
    table: &dyn ContextTable,
    descriptor: &Arc<SinkDescriptor>,
    actor: Option<(&TraceContext, &dyn Authorizer)>,
) -> AttachOutcome {
    let mut outcome = AttachOutcome::default();
    for context in table.contexts() {
        if !context.is_bound_to(descriptor) {
            continue;
        }
        if let Some((actor, authorizer)) = actor {
            if !authorizer.can_trace(actor, &context) {
                outcome.denied += 1;
                continue;
            }
        }
        // Unbind only if still bound to this descriptor; it may have moved.
        let mut binding = context.binding.lock();
        if binding
            .as_ref()
            .is_some_and(|b| Arc::ptr_eq(&b.descriptor, descriptor))
        {
            if let Some(old) = binding.take() {
                old.descriptor.release();
                outcome.affected += 1;
            }
        }
    }
    debug!(
        descriptor = descriptor.serial(),
        affected = outcome.affected,
        denied = outcome.denied,
        forced = actor.is_none(),
        "detached sink"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextId, ContextTree};
    use crate::descriptor::Tunables;
    use crate::sink::SinkIdentity;
    use ktrace_config::QueueConfig;
    use ktrace_telemetry::TraceMetrics;

    fn descriptor() -> Arc<SinkDescriptor> {
        SinkDescriptor::new(
            SinkIdentity::unique(),
            false,
            Tunables::from(&QueueConfig::default()),
            Arc::new(TraceMetrics::new().unwrap()),
        )
    }

    fn tree() -> (ContextTree, Arc<TraceContext>) {
        let tree = ContextTree::new();
        let root = TraceContext::new(ContextId::new(1, 1), "init", 0);
        tree.insert(root.clone(), None);
        tree.insert(
            TraceContext::new(ContextId::new(2, 1), "shell", 1000),
            Some(root.id()),
        );
        tree.insert(
            TraceContext::new(ContextId::new(3, 1), "daemon", 1001),
            Some(root.id()),
        );
        tree.insert(
            TraceContext::new(ContextId::new(4, 1), "cat", 1000),
            Some(ContextId::new(2, 1)),
        );
        (tree, root)
    }

    #[test]
    fn rebinding_releases_the_old_descriptor_first() {
        let (a, b) = (descriptor(), descriptor());
        let ctx = TraceContext::new(ContextId::new(9, 1), "p", 0);

        bind(&ctx, &a, Facilities::SYSCALL).unwrap();
        assert_eq!(a.refs(), 2);
        bind(&ctx, &a, Facilities::NAMEI).unwrap();
        assert_eq!(a.refs(), 2, "same descriptor is not acquired twice");
        assert_eq!(ctx.facilities(), Facilities::SYSCALL | Facilities::NAMEI);

        bind(&ctx, &b, Facilities::CSW).unwrap();
        assert_eq!(a.refs(), 1);
        assert_eq!(b.refs(), 2);
        assert_eq!(ctx.facilities(), Facilities::CSW);
    }

    #[test]
    fn binding_to_a_done_descriptor_fails() {
        let d = descriptor();
        d.release();
        let ctx = TraceContext::new(ContextId::new(9, 1), "p", 0);
        assert!(matches!(
            bind(&ctx, &d, Facilities::SYSCALL),
            Err(TraceError::NotTracing)
        ));
        assert!(!ctx.is_traced());
    }

    #[test]
    fn clearing_the_last_event_bit_unbinds() {
        let d = descriptor();
        let ctx = TraceContext::new(ContextId::new(9, 1), "p", 0);
        bind(&ctx, &d, Facilities::SYSCALL | Facilities::GENIO | Facilities::INHERIT).unwrap();

        assert!(clear_facilities(&ctx, Facilities::SYSCALL));
        assert!(ctx.is_traced());
        assert!(clear_facilities(&ctx, Facilities::GENIO));
        assert!(!ctx.is_traced(), "INHERIT alone does not keep a binding");
        assert_eq!(d.refs(), 1);
        assert!(!clear_facilities(&ctx, Facilities::GENIO));
    }

    #[test]
    fn subtree_skips_and_counts_denied_contexts() {
        let (tree, root) = tree();
        let d = descriptor();
        for ctx in tree.contexts() {
            bind(&ctx, &d, Facilities::SYSCALL).unwrap();
        }
        let actor = tree.lookup(ContextId::new(2, 1)).unwrap();

        let outcome = unbind_subtree(&tree, &actor, &SameOwner, &root, true);
        assert_eq!(outcome, AttachOutcome { affected: 2, denied: 2 });
        assert!(root.is_traced());
        assert!(!tree.lookup(ContextId::new(4, 1)).unwrap().is_traced());
        assert_eq!(d.refs(), 3);
    }

    #[test]
    fn closures_are_authorizers() {
        let (tree, root) = tree();
        let d = descriptor();
        let only_even = |_: &TraceContext, target: &TraceContext| target.id().pid % 2 == 0;
        let outcome = change_subtree(&tree, &root, &only_even, &root, true, |ctx| {
            bind(ctx, &d, Facilities::USER).map(|_| true)
        })
        .unwrap();
        assert_eq!(outcome, AttachOutcome { affected: 2, denied: 2 });
    }

    #[test]
    fn detach_all_only_touches_the_given_descriptor() {
        let (tree, root) = tree();
        let (a, b) = (descriptor(), descriptor());
        for ctx in tree.contexts() {
            let target = if ctx.id().pid == 3 { &b } else { &a };
            bind(&ctx, target, Facilities::SYSCALL).unwrap();
        }

        let shell = tree.lookup(ContextId::new(2, 1)).unwrap();
        let outcome = detach_all(&tree, &a, Some((&shell, &SameOwner)));
        assert_eq!(outcome, AttachOutcome { affected: 2, denied: 1 });

        let outcome = detach_all(&tree, &a, None);
        assert_eq!(outcome, AttachOutcome { affected: 1, denied: 0 });
        assert!(!root.is_traced());
        assert_eq!(a.refs(), 1);
        assert!(tree.lookup(ContextId::new(3, 1)).unwrap().is_traced());
        assert_eq!(b.refs(), 2);
    }

    #[test]
    fn empty_outcome_maps_to_status() {
        assert!(matches!(
            AttachOutcome::default().into_result(),
            Err(TraceError::NotTracing)
        ));
        assert!(matches!(
            AttachOutcome { affected: 0, denied: 1 }.into_result(),
            Err(TraceError::PermissionDenied)
        ));
        assert!(AttachOutcome { affected: 1, denied: 1 }.into_result().is_ok());
    }
}
