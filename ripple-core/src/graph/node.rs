//! Graph Nodes
//!
//! Identity and dirty-state vocabulary shared by every node in the reactive
//! graph: signals, computeds, async computeds and effects.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    ///
    /// Uses an atomic counter so IDs stay unique across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A writable signal. Roots of the graph: dependents only.
    Signal,

    /// A lazily evaluated computed signal. Has dependencies and dependents.
    Computed,

    /// An eagerly re-triggered async computed signal.
    AsyncComputed,

    /// An effect. Leaves of the graph: dependencies only.
    Effect,
}

impl NodeKind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            NodeKind::Signal => "signal",
            NodeKind::Computed => "computed",
            NodeKind::AsyncComputed => "async computed",
            NodeKind::Effect => "effect",
        }
    }
}

/// Dirty state of a derived node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirtyState {
    /// The node is up-to-date.
    Clean,

    /// Something upstream changed. Whether the node's own inputs differ is
    /// only known after validating the recorded dependency versions.
    MaybeDirty,

    /// A direct dependency changed; the node must re-evaluate.
    Dirty,
}

impl DirtyState {
    /// Combine two states, keeping the more severe one.
    pub fn escalate(self, other: DirtyState) -> DirtyState {
        self.max(other)
    }

    /// Check if the node needs any processing.
    pub fn is_clean(&self) -> bool {
        *self == DirtyState::Clean
    }
}

/// Human readable label for a node, used in logs and errors.
pub(crate) fn describe(kind: NodeKind, id: NodeId, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{} '{}' ({})", kind.label(), name, id),
        None => format!("{} {}", kind.label(), id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
        assert!(id2.raw() > id1.raw());
    }

    #[test]
    fn escalate_keeps_most_severe() {
        assert_eq!(DirtyState::Clean.escalate(DirtyState::MaybeDirty), DirtyState::MaybeDirty);
        assert_eq!(DirtyState::Dirty.escalate(DirtyState::MaybeDirty), DirtyState::Dirty);
        assert_eq!(DirtyState::MaybeDirty.escalate(DirtyState::Clean), DirtyState::MaybeDirty);
    }

    #[test]
    fn describe_includes_name_when_present() {
        let id = NodeId::new();
        assert_eq!(
            describe(NodeKind::Computed, id, Some("total")),
            format!("computed 'total' ({})", id)
        );
        assert_eq!(describe(NodeKind::Effect, id, None), format!("effect {}", id));
    }
}
