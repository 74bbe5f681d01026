//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its action immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is handed to the batch
//!    coordinator. It runs once the outermost atomic batch closes, no matter
//!    how many of its dependencies changed inside the batch.
//!
//! 3. Every run records a fresh dependency set. Sources that are no longer
//!    read stop notifying the effect.
//!
//! # Use Cases
//!
//! Effects are used to synchronize reactive state with the outside world:
//!
//! - Logging state changes
//! - Making network requests
//! - Writing to files
//!
//! # Differences from Computed
//!
//! - Computeds return a value; effects do not.
//! - Computeds are lazy (compute on access); effects are eager (run when
//!   deps change).
//! - Computeds cache results; effects just run their side effect.
//!
//! # Lifetime
//!
//! Sources hold effects weakly. An effect keeps running for as long as one of
//! its handles is alive, or until [`Effect::dispose`] is called.

use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::context::ReactiveContext;
use super::policy::{Admission, Arbiter, ConcurrencyPolicy};
use super::runtime::{Dispatch, Runtime};
use crate::error::{ReactiveError, Result};
use crate::graph::{describe, Dependencies, DirtyState, NodeId, NodeKind, Reactive};
use crate::scheduler::{ScheduledWork, Scheduler};

type Action = Arc<dyn Fn() + Send + Sync>;

type AsyncAction =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Construction options for an [`Effect`].
#[derive(Default)]
pub struct EffectOptions {
    name: Option<String>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl EffectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Post re-runs to `scheduler` instead of running them inline.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Effect, Signal};
///
/// let count = Signal::new(0);
///
/// let effect = {
///     let count = count.clone();
///     Effect::new(move || {
///         println!("Count is: {}", count.get());
///     })
/// };
///
/// count.set(5); // Prints: "Count is: 5"
/// assert_eq!(effect.run_count(), 2);
/// ```
#[derive(Clone)]
#[must_use = "an effect stops running once every handle to it is dropped"]
pub struct Effect {
    body: Arc<EffectBody>,
}

enum Runner {
    Sync(Action),
    Async {
        action: AsyncAction,
        arbiter: Mutex<Arbiter>,
        handle: Handle,
    },
}

struct EffectBody {
    id: NodeId,
    name: Option<String>,
    this: Weak<EffectBody>,
    runner: Runner,
    scheduler: Option<Arc<dyn Scheduler>>,
    state: Mutex<EffectState>,
    run_count: AtomicUsize,
}

struct EffectState {
    dirty: DirtyState,
    dependencies: Dependencies,
    disposed: bool,
    posted: Option<ScheduledWork>,
}

impl Effect {
    /// Create a new effect and run it once.
    pub fn new<F>(action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::with_options(action, EffectOptions::new())
    }

    /// Create an effect whose re-runs are posted to `scheduler`.
    ///
    /// The first run still happens synchronously.
    pub fn with_scheduler<F>(action: F, scheduler: Arc<dyn Scheduler>) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::with_options(action, EffectOptions::new().scheduler(scheduler))
    }

    pub fn with_options<F>(action: F, options: EffectOptions) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::create(Runner::Sync(Arc::new(action)), options)
    }

    /// Create an effect whose action returns a future.
    ///
    /// The action itself is called synchronously and tracked; the future it
    /// returns is spawned on the ambient tokio runtime. Overlapping runs are
    /// arbitrated by `policy`.
    pub fn new_async<F, Fut>(action: F, policy: ConcurrencyPolicy) -> Result<Self>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new_async_with_options(action, policy, EffectOptions::new())
    }

    /// Like [`Effect::new_async`], with a name or a scheduler for re-runs.
    ///
    /// A scheduler decides when the action is called again; the future it
    /// returns is still spawned on the ambient tokio runtime.
    pub fn new_async_with_options<F, Fut>(
        action: F,
        policy: ConcurrencyPolicy,
        options: EffectOptions,
    ) -> Result<Self>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| ReactiveError::NoRuntime)?;
        Ok(Self::new_async_on(handle, action, policy, options))
    }

    /// Like [`Effect::new_async`], spawning on an explicit runtime.
    pub fn new_async_on<F, Fut>(
        handle: Handle,
        action: F,
        policy: ConcurrencyPolicy,
        options: EffectOptions,
    ) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let runner = Runner::Async {
            action: Arc::new(move |token| action(token).boxed()),
            arbiter: Mutex::new(Arbiter::new(policy)),
            handle,
        };
        Self::create(runner, options)
    }

    fn create(runner: Runner, options: EffectOptions) -> Self {
        let body = Arc::new_cyclic(|this| EffectBody {
            id: NodeId::new(),
            name: options.name,
            this: this.clone(),
            runner,
            scheduler: options.scheduler,
            state: Mutex::new(EffectState {
                dirty: DirtyState::Dirty,
                dependencies: Dependencies::new(),
                disposed: false,
                posted: None,
            }),
            run_count: AtomicUsize::new(0),
        });

        // Run immediately to establish dependencies
        body.execute();

        Self { body }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.body.id
    }

    /// Stop the effect. Posted re-runs are cancelled and in-flight async runs
    /// are signalled. Calling this more than once has no further effect.
    pub fn dispose(&self) {
        self.body.dispose();
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.body.state.lock().disposed
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.body.run_count.load(Ordering::SeqCst)
    }

    /// Get the number of dependencies.
    pub fn dependency_count(&self) -> usize {
        self.body.state.lock().dependencies.len()
    }
}

impl EffectBody {
    fn describe(&self) -> String {
        describe(NodeKind::Effect, self.id, self.name.as_deref())
    }

    /// Run the action if a dependency really changed.
    fn execute(self: &Arc<Self>) {
        let (dirty, dependencies) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.posted = None;
            (state.dirty, state.dependencies.clone())
        };

        match dirty {
            DirtyState::Clean => return,
            DirtyState::MaybeDirty if dependencies.are_current() => {
                let mut state = self.state.lock();
                if state.dirty == DirtyState::MaybeDirty {
                    state.dirty = DirtyState::Clean;
                }
                return;
            }
            _ => {}
        }

        // Clean before running, so writes made by the action mark us again.
        self.state.lock().dirty = DirtyState::Clean;

        let ran = match &self.runner {
            Runner::Sync(action) => {
                let ((), next) = ReactiveContext::track(|| action());
                self.install(next);
                true
            }
            Runner::Async { .. } => self.start_async(),
        };
        if !ran {
            return;
        }

        let runs = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(effect = %self.describe(), runs, "effect ran");
    }

    /// Adopt the dependencies of the run that just finished.
    fn install(self: &Arc<Self>, next: Dependencies) {
        let reschedule = {
            let this: Weak<dyn Reactive> = self.this.clone();
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.dependencies.swap(next, self.id, &this);
            if state.dirty.is_clean() && state.dependencies.is_stale() {
                state.dirty = DirtyState::Dirty;
                true
            } else {
                false
            }
        };

        if reschedule {
            let this: Arc<dyn Dispatch> = self.clone();
            Runtime::schedule_effect(this);
        }
    }

    /// Returns `false` if the run was queued or refused.
    fn start_async(self: &Arc<Self>) -> bool {
        let Runner::Async {
            action,
            arbiter,
            handle,
        } = &self.runner
        else {
            return false;
        };

        let (generation, token) = match arbiter.lock().admit() {
            Admission::Start { generation, token } => (generation, token),
            Admission::Deferred => {
                tracing::debug!(effect = %self.describe(), "run queued behind the one in flight");
                return false;
            }
            Admission::Closed => return false,
        };

        let tracked = catch_unwind(AssertUnwindSafe(|| {
            ReactiveContext::track(|| action(token.clone()))
        }));
        let (future, next) = match tracked {
            Ok(tracked) => tracked,
            Err(payload) => {
                // Dirty was already cleared, so only the arbiter needs undoing.
                arbiter.lock().abandon(generation);
                resume_unwind(payload);
            }
        };
        self.install(next);

        let weak = self.this.clone();
        handle.spawn(async move {
            let result = future.await;
            if let Some(body) = weak.upgrade() {
                body.settle_async(generation, &token, result);
            }
        });
        true
    }

    fn settle_async(self: Arc<Self>, generation: u64, token: &CancellationToken, result: anyhow::Result<()>) {
        let Runner::Async { arbiter, .. } = &self.runner else {
            return;
        };

        let result = result.map_err(ReactiveError::from_derivation);
        let cancelled = token.is_cancelled() || matches!(&result, Err(error) if error.is_cancelled());
        let settlement = arbiter.lock().settle(generation, cancelled);

        match result {
            Err(error) if !cancelled => {
                tracing::warn!(effect = %self.describe(), generation, %error, "async effect failed");
            }
            _ => tracing::debug!(effect = %self.describe(), generation, cancelled, "async effect settled"),
        }

        if settlement.run_queued {
            // The queued run reads whatever is current now.
            self.state.lock().dirty = DirtyState::Dirty;
            self.execute();
        }
    }

    fn dispose(&self) {
        let (posted, mut dependencies) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (state.posted.take(), std::mem::take(&mut state.dependencies))
        };

        if let Some(posted) = posted {
            posted.cancel();
        }
        dependencies.release(self.id);
        if let Runner::Async { arbiter, .. } = &self.runner {
            arbiter.lock().close();
        }

        tracing::debug!(effect = %self.describe(), "disposed");
    }
}

impl Reactive for EffectBody {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn mark(self: Arc<Self>, state: DirtyState) {
        let schedule = {
            let mut current = self.state.lock();
            if current.disposed {
                return;
            }
            let was_clean = current.dirty.is_clean();
            current.dirty = current.dirty.escalate(state);
            was_clean
        };

        // Only the first dirtying schedules; later ones coalesce into it.
        if schedule {
            Runtime::schedule_effect(self);
        }
    }
}

impl Dispatch for EffectBody {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn dispatch(self: Arc<Self>) {
        let Some(scheduler) = &self.scheduler else {
            self.execute();
            return;
        };

        let weak = self.this.clone();
        let posted = scheduler.schedule(Box::new(move || {
            if let Some(body) = weak.upgrade() {
                body.execute();
            }
        }));

        let mut state = self.state.lock();
        if !state.dirty.is_clean() {
            state.posted = Some(posted);
        }
    }
}

impl Drop for EffectBody {
    fn drop(&mut self) {
        if let Runner::Async { arbiter, .. } = &mut self.runner {
            arbiter.get_mut().close();
        }
        let mut dependencies = std::mem::take(&mut self.state.get_mut().dependencies);
        dependencies.release(self.id);
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.body.id)
            .field("name", &self.body.name)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
