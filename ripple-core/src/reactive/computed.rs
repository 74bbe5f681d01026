//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its derivation inside a tracking
//!    scope, caches the outcome and subscribes to every source it read.
//!
//! 2. When accessed again, if no dependencies have changed, the cached
//!    outcome is returned without calling the derivation.
//!
//! 3. When a source signal changes, the computed is marked `Dirty` and its
//!    own dependents are marked `MaybeDirty`.
//!
//! 4. On the next access a `MaybeDirty` computed first pulls its sources up
//!    to date and compares versions. Only if one of them actually moved does
//!    it re-run.
//!
//! # Why This Matters
//!
//! This lazy approach avoids unnecessary recomputation:
//!
//! - A signal changes
//! - 10 computeds depend on it
//! - Only the computeds actually read will recompute
//! - A computed whose inputs changed but whose value did not keeps its
//!   version, so nothing downstream of it re-runs
//!
//! # Thread Safety
//!
//! Computeds are thread-safe. Evaluation is serialized by a reentrant gate:
//! another thread reading a computed that is being evaluated waits for the
//! result, while the evaluating thread reading it again gets a cycle error.
//! No lock on the cached state is held while the derivation runs.

use std::cell::Cell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

use super::context::{untracked, ReactiveContext};
use super::runtime::Runtime;
use super::signal::{default_comparer, Comparer};
use crate::error::{Outcome, ReactiveError, Result};
use crate::graph::{
    describe, mark_all, Dependencies, Dependents, DirtyState, NodeId, NodeKind, Reactive, Source,
};

type Derivation<T> = Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

/// Supplies a replacement value when a derivation fails.
pub type Fallback<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

/// Construction options for a [`Computed`].
pub struct ComputedOptions<T> {
    name: Option<String>,
    comparer: Option<Comparer<T>>,
    fallback: Option<Fallback<T>>,
}

impl<T> Default for ComputedOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            comparer: None,
            fallback: None,
        }
    }
}

impl<T> ComputedOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Values equal under `comparer` do not count as a change for
    /// dependents.
    pub fn comparer<F>(mut self, comparer: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.comparer = Some(Arc::new(comparer));
        self
    }

    /// Consulted when the derivation fails. `None` lets the failure through.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Type Parameters
///
/// - `T`: The type of the computed value. Must be Clone + Send + Sync.
///
/// Cloning a computed yields another handle to the same node.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Computed, Signal};
///
/// let a = Signal::new(1);
/// let b = Signal::new(2);
/// let sum = {
///     let (a, b) = (a.clone(), b.clone());
///     Computed::new(move || a.get() + b.get())
/// };
///
/// assert_eq!(sum.get(), 3);
/// a.set(10);
/// assert_eq!(sum.get(), 12);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    body: Arc<ComputedBody<T>>,
}

struct ComputedBody<T> {
    id: NodeId,
    name: Option<String>,
    this: Weak<ComputedBody<T>>,
    derive: Derivation<T>,
    fallback: Option<Fallback<T>>,
    comparer: Comparer<T>,

    /// Held for the whole of an evaluation; the flag is set while the
    /// derivation runs.
    gate: ReentrantMutex<Cell<bool>>,

    state: Mutex<ComputedState<T>>,
    version: AtomicU64,
    dependents: Mutex<Dependents>,
}

struct ComputedState<T> {
    outcome: Outcome<T>,
    dirty: DirtyState,
    dependencies: Dependencies,
    disposed: bool,
}

/// Clears the evaluating flag on every exit path.
struct Evaluating<'a>(&'a Cell<bool>);

impl<'a> Evaluating<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for Evaluating<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a computed from an infallible derivation.
    ///
    /// The derivation is not run immediately. It runs on first access.
    pub fn new<F>(derive: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: PartialEq,
    {
        Self::try_new(move || Ok(derive()))
    }

    /// Create a computed from a derivation that may fail.
    pub fn try_new<F>(derive: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        T: PartialEq,
    {
        Self::with_options(derive, ComputedOptions::new())
    }

    /// Create a computed that falls back to `fallback` when `derive` fails.
    pub fn with_fallback<F, G>(derive: F, fallback: G) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        G: Fn() -> Option<T> + Send + Sync + 'static,
        T: PartialEq,
    {
        Self::with_options(derive, ComputedOptions::new().fallback(fallback))
    }

    /// Create a computed from explicit options.
    pub fn with_options<F>(derive: F, options: ComputedOptions<T>) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        T: PartialEq,
    {
        let comparer = options.comparer.unwrap_or_else(default_comparer::<T>);
        let body = Arc::new_cyclic(|this| ComputedBody {
            id: NodeId::new(),
            name: options.name,
            this: this.clone(),
            derive: Arc::new(derive),
            fallback: options.fallback,
            comparer,
            gate: ReentrantMutex::new(Cell::new(false)),
            state: Mutex::new(ComputedState {
                outcome: Outcome::Empty,
                dirty: DirtyState::Dirty,
                dependencies: Dependencies::new(),
                disposed: false,
            }),
            version: AtomicU64::new(0),
            dependents: Mutex::new(Dependents::default()),
        });

        Self { body }
    }

    /// Get the computed's unique ID.
    pub fn id(&self) -> NodeId {
        self.body.id
    }

    pub fn name(&self) -> Option<&str> {
        self.body.name.as_deref()
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics if the derivation failed without a fallback value, if the
    /// computed was disposed or if it is read from its own derivation. Use
    /// [`Computed::try_get`] to handle those cases.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(error) => panic!("{}: {error}", self.body.describe()),
        }
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// If called within a reactive context, this computed becomes a
    /// dependency of the running computation.
    pub fn try_get(&self) -> Result<T> {
        self.body.update()?;
        self.body.track();
        let describe = || self.body.describe();
        self.body
            .state
            .lock()
            .outcome
            .clone()
            .into_result(|| ReactiveError::Disposed(describe()))
    }

    /// Like [`Computed::try_get`], without registering a dependency.
    pub fn try_get_untracked(&self) -> Result<T> {
        untracked(|| self.try_get())
    }

    /// Stop tracking and release the cached value.
    ///
    /// Dependents are dirtied so they observe the disposal. Calling this more
    /// than once has no further effect.
    pub fn dispose(&self) {
        self.body.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.body.state.lock().disposed
    }

    /// Get the current dirty state.
    pub fn state(&self) -> DirtyState {
        self.body.state.lock().dirty
    }

    /// Check if the computed has a cached value.
    pub fn has_value(&self) -> bool {
        self.body.state.lock().outcome.is_value()
    }

    /// Number of changes observed by dependents so far.
    pub fn version(&self) -> u64 {
        self.body.version.load(Ordering::SeqCst)
    }

    /// Get the number of sources read by the last evaluation.
    pub fn dependency_count(&self) -> usize {
        self.body.state.lock().dependencies.len()
    }

    /// Get the number of dependents.
    pub fn dependent_count(&self) -> usize {
        self.body.dependents.lock().len()
    }
}

impl<T> ComputedBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn describe(&self) -> String {
        describe(NodeKind::Computed, self.id, self.name.as_deref())
    }

    fn track(&self) {
        if ReactiveContext::is_tracking() {
            if let Some(this) = self.this.upgrade() {
                let version = self.version.load(Ordering::SeqCst);
                let source: Arc<dyn Source> = this;
                ReactiveContext::record(&source, version);
            }
        }
    }

    /// Bring the cached outcome up to date.
    fn update(&self) -> Result<()> {
        let gate = self.gate.lock();
        if gate.get() {
            return Err(ReactiveError::Cycle(self.describe()));
        }

        let (dirty, dependencies) = {
            let state = self.state.lock();
            if state.disposed {
                return Err(ReactiveError::Disposed(self.describe()));
            }
            let dependencies = match state.dirty {
                DirtyState::MaybeDirty => Some(state.dependencies.clone()),
                _ => None,
            };
            (state.dirty, dependencies)
        };

        match (dirty, dependencies) {
            (DirtyState::Clean, _) => Ok(()),
            (DirtyState::MaybeDirty, Some(dependencies)) => {
                let current = {
                    let _validating = Evaluating::enter(&gate);
                    dependencies.are_current()
                };
                if current {
                    let mut state = self.state.lock();
                    if state.dirty == DirtyState::MaybeDirty && !state.dependencies.is_stale() {
                        state.dirty = DirtyState::Clean;
                    }
                    return Ok(());
                }
                self.evaluate(&gate);
                Ok(())
            }
            _ => {
                self.evaluate(&gate);
                Ok(())
            }
        }
    }

    fn evaluate(&self, flag: &Cell<bool>) {
        let (result, next) = {
            let _evaluating = Evaluating::enter(flag);
            ReactiveContext::track(|| (self.derive)())
        };

        let resolved = match result {
            Ok(value) => Some(Outcome::Value(value)),
            Err(error) => {
                let error = ReactiveError::from_derivation(error);
                if error.is_cancelled() && self.state.lock().outcome.is_value() {
                    tracing::debug!(computed = %self.describe(), "derivation cancelled, keeping previous value");
                    None
                } else {
                    match self.fallback.as_ref().and_then(|fallback| untracked(|| fallback())) {
                        Some(value) => Some(Outcome::Value(value)),
                        None => Some(Outcome::Failed(error)),
                    }
                }
            }
        };

        let this: Weak<dyn Reactive> = self.this.clone();
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.dependencies.swap(next, self.id, &this);

        let changed = match resolved {
            None => false,
            Some(outcome) => {
                let changed = match (&state.outcome, &outcome) {
                    (Outcome::Value(old), Outcome::Value(new)) => !(self.comparer)(old, new),
                    _ => true,
                };
                if changed {
                    state.outcome = outcome;
                }
                changed
            }
        };

        // A source written while we were evaluating leaves us dirty.
        state.dirty = if state.dependencies.is_stale() {
            DirtyState::Dirty
        } else {
            DirtyState::Clean
        };

        if changed {
            self.version.fetch_add(1, Ordering::SeqCst);
        }

        tracing::debug!(
            computed = %self.describe(),
            changed,
            dependencies = state.dependencies.len(),
            "recomputed"
        );
    }

    fn dispose(&self) {
        let mut dependencies = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.outcome = Outcome::Empty;
            state.dirty = DirtyState::Clean;
            std::mem::take(&mut state.dependencies)
        };
        dependencies.release(self.id);
        self.version.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(computed = %self.describe(), "disposed");

        let dependents = self.dependents.lock().live();
        Runtime::atomic(|| mark_all(dependents, DirtyState::Dirty));
    }
}

impl<T> Source for ComputedBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn refresh(&self) -> u64 {
        if let Err(error) = self.update() {
            tracing::trace!(computed = %self.describe(), %error, "refresh failed");
        }
        self.version.load(Ordering::SeqCst)
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

impl<T> Reactive for ComputedBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn mark(self: Arc<Self>, state: DirtyState) {
        let propagate = {
            let mut current = self.state.lock();
            if current.disposed {
                return;
            }
            let was_clean = current.dirty.is_clean();
            current.dirty = current.dirty.escalate(state);
            was_clean
        };

        // Dependents were already told when we first left `Clean`.
        if propagate {
            let dependents = self.dependents.lock().live();
            mark_all(dependents, DirtyState::MaybeDirty);
        }
    }
}

impl<T> Drop for ComputedBody<T> {
    fn drop(&mut self) {
        let mut dependencies = std::mem::take(&mut self.state.get_mut().dependencies);
        dependencies.release(self.id);
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            body: Arc::clone(&self.body),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.body.state.lock();
        f.debug_struct("Computed")
            .field("id", &self.body.id)
            .field("name", &self.body.name)
            .field("state", &state.dirty)
            .field("outcome", &state.outcome)
            .field("dependency_count", &state.dependencies.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
