//! ## ktrace-core::context
//! **Producers and the process model they live in**
//!
//! A [`TraceContext`] is one execution context that may emit records. It owns at
//! most one binding to a sink descriptor. Which contexts exist and how they are
//! parented belongs to the surrounding system; the core only sees it through
//! [`ContextTable`]. [`ContextTree`] is an in-memory table for embedders that do
//! not already keep one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::descriptor::SinkDescriptor;
use crate::facility::Facilities;

/// Process and thread number of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId {
    pub pid: u32,
    pub lid: u32,
}

impl ContextId {
    pub const fn new(pid: u32, lid: u32) -> Self {
        Self { pid, lid }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid, self.lid)
    }
}

#[derive(Debug)]
pub(crate) struct Binding {
    pub(crate) descriptor: Arc<SinkDescriptor>,
    pub(crate) facilities: Facilities,
}

#[derive(Debug)]
pub struct TraceContext {
    id: ContextId,
    name: String,
    owner: u32,
    pub(crate) binding: Mutex<Option<Binding>>,
    in_trace: AtomicBool,
}

impl TraceContext {
    pub fn new(id: ContextId, name: impl Into<String>, owner: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            owner,
            binding: Mutex::new(None),
            in_trace: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Credential the authorization hook compares; 0 is privileged.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn is_traced(&self) -> bool {
        self.binding.lock().is_some()
    }

    /// Facility mask of the current binding, empty when unbound.
    pub fn facilities(&self) -> Facilities {
        self.binding
            .lock()
            .as_ref()
            .map(|b| b.facilities)
            .unwrap_or(Facilities::empty())
    }

    pub fn descriptor(&self) -> Option<Arc<SinkDescriptor>> {
        self.binding.lock().as_ref().map(|b| b.descriptor.clone())
    }

    pub(crate) fn is_bound_to(&self, descriptor: &Arc<SinkDescriptor>) -> bool {
        self.binding
            .lock()
            .as_ref()
            .is_some_and(|b| Arc::ptr_eq(&b.descriptor, descriptor))
    }

    /// Marks the context as inside the trace machinery. `None` if it already was.
    pub(crate) fn enter(self: &Arc<Self>) -> Option<ActiveGuard> {
        self.in_trace
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ActiveGuard {
                context: Arc::clone(self),
            })
    }

    pub fn in_trace(&self) -> bool {
        self.in_trace.load(Ordering::Acquire)
    }
}

/// Recursion guard held from allocation until the entry is queued or freed.
#[derive(Debug)]
pub(crate) struct ActiveGuard {
    context: Arc<TraceContext>,
}

impl ActiveGuard {
    pub(crate) fn context(&self) -> &Arc<TraceContext> {
        &self.context
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.context.in_trace.store(false, Ordering::Release);
    }
}

/// The surrounding system's view of live contexts.
pub trait ContextTable: Send + Sync {
    fn lookup(&self, id: ContextId) -> Option<Arc<TraceContext>>;

    /// Every live context, in no particular order.
    fn contexts(&self) -> Vec<Arc<TraceContext>>;

    /// Direct children of `id`.
    fn children(&self, id: ContextId) -> Vec<Arc<TraceContext>>;
}

#[derive(Debug)]
struct Node {
    context: Arc<TraceContext>,
    parent: Option<ContextId>,
    children: Vec<ContextId>,
}

#[derive(Debug, Default)]
pub struct ContextTree {
    nodes: RwLock<HashMap<ContextId, Node>>,
}

impl ContextTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `context` under `parent`. An unknown parent makes it a root.
    pub fn insert(&self, context: Arc<TraceContext>, parent: Option<ContextId>) {
        let id = context.id();
        let mut nodes = self.nodes.write();
        let parent = parent.filter(|p| nodes.contains_key(p));
        if let Some(p) = parent {
            if let Some(node) = nodes.get_mut(&p) {
                node.children.push(id);
            }
        }
        nodes.insert(
            id,
            Node {
                context,
                parent,
                children: Vec::new(),
            },
        );
    }

    /// Removes a context; its children are reparented to its parent.
    pub fn remove(&self, id: ContextId) -> Option<Arc<TraceContext>> {
        let mut nodes = self.nodes.write();
        let node = nodes.remove(&id)?;
        if let Some(p) = node.parent {
            if let Some(parent) = nodes.get_mut(&p) {
                parent.children.retain(|c| *c != id);
                parent.children.extend(node.children.iter().copied());
            }
        }
        for child in &node.children {
            if let Some(c) = nodes.get_mut(child) {
                c.parent = node.parent;
            }
        }
        Some(node.context)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContextTable for ContextTree {
    fn lookup(&self, id: ContextId) -> Option<Arc<TraceContext>> {
        self.nodes.read().get(&id).map(|n| n.context.clone())
    }

    fn contexts(&self) -> Vec<Arc<TraceContext>> {
        self.nodes
            .read()
            .values()
            .map(|n| n.context.clone())
            .collect()
    }

    fn children(&self, id: ContextId) -> Vec<Arc<TraceContext>> {
        let nodes = self.nodes.read();
        nodes
            .get(&id)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| nodes.get(c).map(|child| child.context.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Every context in the subtree rooted at `root` (the root first), or just the
/// root when `descend` is false.
pub fn subtree(
    table: &dyn ContextTable,
    root: &Arc<TraceContext>,
    descend: bool,
) -> Vec<Arc<TraceContext>> {
    let mut visited = vec![root.clone()];
    if !descend {
        return visited;
    }
    let mut seen = HashSet::from([root.id()]);
    let mut stack = vec![root.id()];
    while let Some(id) = stack.pop() {
        for child in table.children(id) {
            if seen.insert(child.id()) {
                stack.push(child.id());
                visited.push(child);
            }
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pid: u32) -> Arc<TraceContext> {
        TraceContext::new(ContextId::new(pid, 1), format!("p{pid}"), 1000)
    }

    fn sample_tree() -> ContextTree {
        // 1 ── 2 ── 4
        //  └── 3    └─ 5
        let tree = ContextTree::new();
        tree.insert(ctx(1), None);
        tree.insert(ctx(2), Some(ContextId::new(1, 1)));
        tree.insert(ctx(3), Some(ContextId::new(1, 1)));
        tree.insert(ctx(4), Some(ContextId::new(2, 1)));
        tree.insert(ctx(5), Some(ContextId::new(4, 1)));
        tree
    }

    #[test]
    fn subtree_visits_every_descendant() {
        let tree = sample_tree();
        let root = tree.lookup(ContextId::new(1, 1)).unwrap();
        let mut pids: Vec<u32> = subtree(&tree, &root, true)
            .iter()
            .map(|c| c.id().pid)
            .collect();
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 2, 3, 4, 5]);

        let only_root = subtree(&tree, &root, false);
        assert_eq!(only_root.len(), 1);
    }

    #[test]
    fn removal_reparents_children() {
        let tree = sample_tree();
        tree.remove(ContextId::new(2, 1)).unwrap();
        let mut kids: Vec<u32> = tree
            .children(ContextId::new(1, 1))
            .iter()
            .map(|c| c.id().pid)
            .collect();
        kids.sort_unstable();
        assert_eq!(kids, vec![3, 4]);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn recursion_guard_is_exclusive_until_dropped() {
        let c = ctx(9);
        let guard = c.enter().expect("first entry succeeds");
        assert!(c.in_trace());
        assert!(c.enter().is_none());
        drop(guard);
        assert!(!c.in_trace());
        assert!(c.enter().is_some());
    }
}
