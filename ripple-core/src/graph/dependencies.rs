//! Forward and reverse edge sets.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::{DirtyState, NodeId, Reactive, Source};

/// A recorded read: which source, and the version it held at the time.
#[derive(Clone)]
struct Edge {
    source: Arc<dyn Source>,
    version: u64,
}

/// The set of sources a reactive node read during one evaluation.
///
/// Each source appears at most once, in first-read order, no matter how many
/// times it was read.
#[derive(Clone, Default)]
pub struct Dependencies {
    edges: IndexMap<NodeId, Edge>,
}

impl Dependencies {
    /// Create an empty dependency set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct sources.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether nothing was read.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Whether the source with the given ID was read.
    pub fn contains(&self, id: NodeId) -> bool {
        self.edges.contains_key(&id)
    }

    /// IDs of the recorded sources in first-read order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.keys().copied()
    }

    /// Record a read. Returns `false` if the source was already recorded.
    ///
    /// The first recorded version wins; a later read of a newer version only
    /// makes the set look stale, which errs on the side of re-evaluating.
    pub(crate) fn record(&mut self, source: &Arc<dyn Source>, version: u64) -> bool {
        let id = source.node_id();
        if self.edges.contains_key(&id) {
            return false;
        }
        self.edges.insert(
            id,
            Edge {
                source: Arc::clone(source),
                version,
            },
        );
        true
    }

    /// Refresh every source and check that none moved past its recorded
    /// version.
    ///
    /// Must be called without holding the owner's locks: refreshing a
    /// computed source may re-run its derivation.
    pub(crate) fn are_current(&self) -> bool {
        self.edges
            .values()
            .all(|edge| edge.source.refresh() == edge.version)
    }

    /// Cheap check, without refreshing, for sources that were written after
    /// being read.
    pub(crate) fn is_stale(&self) -> bool {
        self.edges
            .values()
            .any(|edge| edge.source.version() != edge.version)
    }

    /// Replace this set with `next`, subscribing `owner` to newly read sources
    /// and unsubscribing it from sources that are no longer read.
    pub(crate) fn swap(&mut self, next: Dependencies, owner: NodeId, this: &Weak<dyn Reactive>) {
        for (id, edge) in &next.edges {
            if !self.edges.contains_key(id) {
                edge.source.add_dependent(owner, this.clone());
            }
        }
        for (id, edge) in &self.edges {
            if !next.edges.contains_key(id) {
                edge.source.remove_dependent(owner);
            }
        }
        *self = next;
    }

    /// Unsubscribe `owner` from every source and forget them.
    pub(crate) fn release(&mut self, owner: NodeId) {
        for edge in self.edges.values() {
            edge.source.remove_dependent(owner);
        }
        self.edges.clear();
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.edges.iter().map(|(id, edge)| (id, edge.version)))
            .finish()
    }
}

/// The reactive nodes currently subscribed to a source.
#[derive(Default)]
pub(crate) struct Dependents {
    entries: IndexMap<NodeId, Weak<dyn Reactive>>,
}

impl Dependents {
    pub(crate) fn insert(&mut self, id: NodeId, dependent: Weak<dyn Reactive>) {
        self.entries.insert(id, dependent);
    }

    pub(crate) fn remove(&mut self, id: NodeId) {
        self.entries.shift_remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Upgrade live dependents, dropping the ones that were reclaimed.
    pub(crate) fn live(&mut self) -> SmallVec<[Arc<dyn Reactive>; 4]> {
        let mut live = SmallVec::new();
        self.entries.retain(|_, weak| match weak.upgrade() {
            Some(dependent) => {
                live.push(dependent);
                true
            }
            None => false,
        });
        live
    }
}

/// Mark every live dependent. The caller must already have released the lock
/// guarding `dependents`' owner state; marking may call back into the graph.
pub(crate) fn mark_all(dependents: SmallVec<[Arc<dyn Reactive>; 4]>, state: DirtyState) {
    for dependent in dependents {
        dependent.mark(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeSource {
        id: NodeId,
        version: AtomicU64,
        dependents: Mutex<Dependents>,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::new(),
                version: AtomicU64::new(0),
                dependents: Mutex::new(Dependents::default()),
            })
        }
    }

    impl Source for FakeSource {
        fn node_id(&self) -> NodeId {
            self.id
        }

        fn refresh(&self) -> u64 {
            self.version()
        }

        fn version(&self) -> u64 {
            self.version.load(Ordering::SeqCst)
        }

        fn add_dependent(&self, id: NodeId, dependent: Weak<dyn Reactive>) {
            self.dependents.lock().insert(id, dependent);
        }

        fn remove_dependent(&self, id: NodeId) {
            self.dependents.lock().remove(id);
        }
    }

    struct FakeReactive {
        id: NodeId,
        marked: Mutex<Vec<DirtyState>>,
    }

    impl Reactive for FakeReactive {
        fn node_id(&self) -> NodeId {
            self.id
        }

        fn mark(self: Arc<Self>, state: DirtyState) {
            self.marked.lock().push(state);
        }
    }

    fn fake_reactive() -> Arc<FakeReactive> {
        Arc::new(FakeReactive {
            id: NodeId::new(),
            marked: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn record_deduplicates_sources() {
        let source = FakeSource::new();
        let as_source: Arc<dyn Source> = source.clone();
        let mut deps = Dependencies::new();

        assert!(deps.record(&as_source, 0));
        assert!(!deps.record(&as_source, 0));
        assert!(!deps.record(&as_source, 0));

        assert_eq!(deps.len(), 1);
        assert!(deps.contains(source.id));
    }

    #[test]
    fn version_checks_detect_changes() {
        let source = FakeSource::new();
        let as_source: Arc<dyn Source> = source.clone();
        let mut deps = Dependencies::new();
        deps.record(&as_source, 0);

        assert!(deps.are_current());
        assert!(!deps.is_stale());

        source.version.store(1, Ordering::SeqCst);
        assert!(!deps.are_current());
        assert!(deps.is_stale());
    }

    #[test]
    fn swap_diffs_subscriptions() {
        let a = FakeSource::new();
        let b = FakeSource::new();
        let c = FakeSource::new();
        let a_src: Arc<dyn Source> = a.clone();
        let b_src: Arc<dyn Source> = b.clone();
        let c_src: Arc<dyn Source> = c.clone();

        let owner = fake_reactive();
        let weak = Arc::downgrade(&owner) as Weak<dyn Reactive>;

        let mut current = Dependencies::new();
        let mut first = Dependencies::new();
        first.record(&a_src, 0);
        first.record(&b_src, 0);
        current.swap(first, owner.id, &weak);

        assert_eq!(a.dependents.lock().len(), 1);
        assert_eq!(b.dependents.lock().len(), 1);

        let mut second = Dependencies::new();
        second.record(&b_src, 0);
        second.record(&c_src, 0);
        current.swap(second, owner.id, &weak);

        assert_eq!(a.dependents.lock().len(), 0);
        assert_eq!(b.dependents.lock().len(), 1);
        assert_eq!(c.dependents.lock().len(), 1);

        current.release(owner.id);
        assert!(current.is_empty());
        assert_eq!(b.dependents.lock().len(), 0);
        assert_eq!(c.dependents.lock().len(), 0);
    }

    #[test]
    fn dead_dependents_are_pruned() {
        let mut dependents = Dependents::default();
        let kept = fake_reactive();
        let dropped = fake_reactive();

        dependents.insert(kept.id, Arc::downgrade(&kept) as Weak<dyn Reactive>);
        dependents.insert(dropped.id, Arc::downgrade(&dropped) as Weak<dyn Reactive>);
        drop(dropped);

        let live = dependents.live();
        assert_eq!(live.len(), 1);
        assert_eq!(dependents.len(), 1);

        mark_all(live, DirtyState::Dirty);
        assert_eq!(*kept.marked.lock(), vec![DirtyState::Dirty]);
    }
}
