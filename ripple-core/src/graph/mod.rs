//! Dependency Graph
//!
//! This module holds the edge bookkeeping that connects reactive nodes.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Sources (signals, computeds) are nodes that can be read
//! - Reactives (computeds, async computeds, effects) are nodes that react
//!   to their sources changing
//! - An edge from source B to reactive A means A read B during its last
//!   evaluation
//!
//! # Design Decisions
//!
//! 1. Edges are distributed: every source keeps its own list of dependents
//!    and every reactive keeps its own list of dependencies. There is no
//!    central registry to lock on the hot path.
//!
//! 2. Forward edges (reactive to source) are strong, reverse edges (source
//!    to reactive) are weak. A source is kept alive by whoever reads it; a
//!    reactive is kept alive only by its own handle.
//!
//! 3. Every forward edge remembers the source version seen at read time.
//!    Dirtying is pushed eagerly, but a `MaybeDirty` node pulls: it compares
//!    recorded versions against fresh ones before deciding to re-evaluate.

mod dependencies;
mod node;

use std::sync::{Arc, Weak};

pub use dependencies::Dependencies;
pub(crate) use dependencies::{mark_all, Dependents};
pub(crate) use node::describe;
pub use node::{DirtyState, NodeId, NodeKind};

/// A node that can be read and therefore depended upon.
pub trait Source: Send + Sync {
    /// The node's identity.
    fn node_id(&self) -> NodeId;

    /// Bring the node up to date and return the version it now holds.
    ///
    /// For signals this is a plain read. Computeds may re-evaluate here.
    fn refresh(&self) -> u64;

    /// The version currently held, without bringing the node up to date.
    fn version(&self) -> u64;

    /// Register `dependent` to be marked when this node changes.
    fn add_dependent(&self, id: NodeId, dependent: Weak<dyn Reactive>);

    /// Stop notifying the dependent with the given ID.
    fn remove_dependent(&self, id: NodeId);
}

/// A node that reacts to its sources changing.
pub trait Reactive: Send + Sync {
    /// The node's identity.
    fn node_id(&self) -> NodeId;

    /// Mark this node as needing work.
    ///
    /// `Dirty` means a direct source changed; `MaybeDirty` means something
    /// further upstream changed.
    fn mark(self: Arc<Self>, state: DirtyState);
}
