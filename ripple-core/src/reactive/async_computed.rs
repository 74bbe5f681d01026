//! Async Computed Implementation
//!
//! An async computed derives its value from a future. The derivation closure
//! is called synchronously inside a tracking scope, so every signal it reads
//! before returning the future becomes a dependency. Reads inside the future
//! itself are not tracked.
//!
//! Futures are spawned on a tokio runtime. When a dependency changes while a
//! run is in flight, the node's [`ConcurrencyPolicy`] decides what happens.
//!
//! Readers never wait: they see the last applied result, or the start value
//! until the first run completes. The result lives in an internal signal, so
//! reading an async computed from a computed or effect subscribes to that
//! signal like any other.

use std::fmt::Debug;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::computed::Fallback;
use super::context::{untracked, ReactiveContext};
use super::policy::{Admission, Arbiter, ConcurrencyPolicy};
use super::runtime::{Dispatch, Runtime};
use super::signal::{default_comparer, Comparer, Signal};
use crate::error::{Outcome, ReactiveError, Result};
use crate::graph::{describe, Dependencies, DirtyState, NodeId, NodeKind, Reactive};

pub(crate) type AsyncDerivation<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Configures and builds an [`AsyncComputed`].
pub struct AsyncComputedBuilder<T> {
    start_value: T,
    derive: AsyncDerivation<T>,
    policy: ConcurrencyPolicy,
    fallback: Option<Fallback<T>>,
    comparer: Option<Comparer<T>>,
    handle: Option<Handle>,
    name: Option<String>,
}

impl<T> AsyncComputedBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Defaults to [`ConcurrencyPolicy::Supersede`].
    pub fn policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Consulted when a run fails. `None` lets the failure through.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn comparer<F>(mut self, comparer: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.comparer = Some(Arc::new(comparer));
        self
    }

    /// Spawn derivations on `handle` instead of the ambient runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the derivation with a wrapped version of itself.
    pub(crate) fn map_derivation(
        mut self,
        wrap: impl FnOnce(AsyncDerivation<T>) -> AsyncDerivation<T>,
    ) -> Self {
        self.derive = wrap(self.derive);
        self
    }

    /// Build the node and start its first run.
    ///
    /// Fails with [`ReactiveError::NoRuntime`] if no handle was supplied and
    /// the caller is not inside a tokio runtime.
    pub fn build(self) -> Result<AsyncComputed<T>>
    where
        T: PartialEq,
    {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ReactiveError::NoRuntime)?,
        };

        let comparer = self.comparer.unwrap_or_else(default_comparer::<T>);
        let output = Signal::with_comparer(
            Outcome::Value(self.start_value),
            move |old: &Outcome<T>, new: &Outcome<T>| match (old, new) {
                (Outcome::Value(old), Outcome::Value(new)) => comparer(old, new),
                (Outcome::Empty, Outcome::Empty) => true,
                _ => false,
            },
        );

        let body = Arc::new_cyclic(|this| AsyncBody {
            id: NodeId::new(),
            name: self.name,
            this: this.clone(),
            derive: self.derive,
            fallback: self.fallback,
            handle,
            arbiter: Mutex::new(Arbiter::new(self.policy)),
            state: Mutex::new(AsyncState {
                dirty: DirtyState::Dirty,
                dependencies: Dependencies::new(),
                disposed: false,
            }),
            output,
            executing: Signal::new(false),
        });

        body.start();
        Ok(AsyncComputed { body })
    }
}

/// A derived value produced by a future.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{AsyncComputed, Signal};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> ripple_core::Result<()> {
/// let id = Signal::new(1);
/// let user = {
///     let id = id.clone();
///     AsyncComputed::builder(String::new(), move |_token| {
///         let id = id.get();
///         async move { anyhow::Ok(format!("user-{id}")) }
///     })
///     .build()?
/// };
///
/// // Readers see the start value until the first run completes
/// assert_eq!(user.get(), "");
/// # Ok(())
/// # }
/// ```
pub struct AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    body: Arc<AsyncBody<T>>,
}

struct AsyncBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: NodeId,
    name: Option<String>,
    this: Weak<AsyncBody<T>>,
    derive: AsyncDerivation<T>,
    fallback: Option<Fallback<T>>,
    handle: Handle,
    arbiter: Mutex<Arbiter>,
    state: Mutex<AsyncState>,
    output: Signal<Outcome<T>>,
    executing: Signal<bool>,
}

struct AsyncState {
    dirty: DirtyState,
    dependencies: Dependencies,
    disposed: bool,
}

impl<T> AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start configuring an async computed.
    ///
    /// `derive` is called with a fresh cancellation token for every run. The
    /// token is cancelled when the run is superseded or the node disposed.
    pub fn builder<F, Fut>(start_value: T, derive: F) -> AsyncComputedBuilder<T>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        AsyncComputedBuilder {
            start_value,
            derive: Arc::new(move |token| derive(token).boxed()),
            policy: ConcurrencyPolicy::default(),
            fallback: None,
            comparer: None,
            handle: None,
            name: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.body.id
    }

    pub fn name(&self) -> Option<&str> {
        self.body.name.as_deref()
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.body.arbiter.lock().policy()
    }

    /// Get the last applied value.
    ///
    /// # Panics
    ///
    /// Panics if the last run failed without a fallback value or the node was
    /// disposed. Use [`AsyncComputed::try_get`] to handle those cases.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(error) => panic!("{}: {error}", self.body.describe()),
        }
    }

    /// Get the last applied result without waiting for runs in flight.
    pub fn try_get(&self) -> Result<T> {
        if self.is_disposed() {
            return Err(ReactiveError::Disposed(self.body.describe()));
        }
        self.body
            .output
            .get()
            .into_result(|| ReactiveError::Disposed(self.body.describe()))
    }

    pub fn try_get_untracked(&self) -> Result<T> {
        untracked(|| self.try_get())
    }

    /// A signal that is `true` while an authoritative run is in flight.
    pub fn is_executing(&self) -> Signal<bool> {
        self.body.executing.clone()
    }

    /// Number of runs currently in flight, stale ones included.
    pub fn running(&self) -> usize {
        self.body.arbiter.lock().running()
    }

    /// Cancel every run in flight and stop tracking. Idempotent.
    pub fn dispose(&self) {
        self.body.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.body.state.lock().disposed
    }

    pub fn dependency_count(&self) -> usize {
        self.body.state.lock().dependencies.len()
    }
}

impl<T> AsyncBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn describe(&self) -> String {
        describe(NodeKind::AsyncComputed, self.id, self.name.as_deref())
    }

    /// Ask the arbiter for a run and start it if admitted.
    fn start(self: &Arc<Self>) {
        let admission = self.arbiter.lock().admit();
        let (generation, token) = match admission {
            Admission::Start { generation, token } => (generation, token),
            Admission::Deferred => {
                self.state.lock().dirty = DirtyState::Clean;
                tracing::debug!(node = %self.describe(), "run queued behind the one in flight");
                return;
            }
            Admission::Closed => return,
        };

        let tracked = catch_unwind(AssertUnwindSafe(|| {
            ReactiveContext::track(|| (self.derive)(token.clone()))
        }));
        let (future, next) = match tracked {
            Ok(tracked) => tracked,
            Err(payload) => {
                self.abandon(generation);
                resume_unwind(payload);
            }
        };

        let stale = {
            let this: Weak<dyn Reactive> = self.this.clone();
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.dependencies.swap(next, self.id, &this);
            let stale = state.dependencies.is_stale();
            state.dirty = if stale {
                DirtyState::Dirty
            } else {
                DirtyState::Clean
            };
            stale
        };

        self.executing.set(true);
        tracing::debug!(node = %self.describe(), generation, "async derivation started");

        let weak = self.this.clone();
        self.handle.spawn(async move {
            let result = future.await;
            if let Some(body) = weak.upgrade() {
                body.settle(generation, &token, result);
            }
        });

        if stale {
            let this: Arc<dyn Dispatch> = self.clone();
            Runtime::schedule_effect(this);
        }
    }

    /// Undo an admitted run whose derivation panicked before returning a
    /// future. The node goes back to clean so the next change restarts it.
    fn abandon(&self, generation: u64) {
        let idle = self.arbiter.lock().abandon(generation);
        self.state.lock().dirty = DirtyState::Clean;
        if idle {
            self.executing.set(false);
        }
        tracing::warn!(node = %self.describe(), generation, "async derivation panicked before starting");
    }

    fn settle(self: Arc<Self>, generation: u64, token: &CancellationToken, result: anyhow::Result<T>) {
        let result = result.map_err(ReactiveError::from_derivation);
        let cancelled = token.is_cancelled() || matches!(&result, Err(error) if error.is_cancelled());
        let settlement = self.arbiter.lock().settle(generation, cancelled);

        tracing::debug!(
            node = %self.describe(),
            generation,
            cancelled,
            applied = settlement.apply,
            idle = settlement.idle,
            "async derivation settled"
        );

        let outcome = settlement.apply.then(|| match result {
            Ok(value) => Outcome::Value(value),
            Err(error) => match self.fallback.as_ref().and_then(|fallback| fallback()) {
                Some(value) => Outcome::Value(value),
                None => Outcome::Failed(error),
            },
        });

        Runtime::atomic(|| {
            if let Some(outcome) = outcome {
                self.output.set(outcome);
            }
            if settlement.idle {
                self.executing.set(false);
            }
        });

        if settlement.run_queued {
            self.start();
        }
    }

    fn dispose(&self) {
        let mut dependencies = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.dependencies)
        };
        dependencies.release(self.id);
        self.arbiter.lock().close();
        self.executing.set(false);
        tracing::debug!(node = %self.describe(), "disposed");
    }
}

impl<T> Reactive for AsyncBody<T>
where
    T: Clone + Send + Sync + 'static,
{
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

        if schedule {
            Runtime::schedule_effect(self);
        }
    }
}

impl<T> Dispatch for AsyncBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn dispatch(self: Arc<Self>) {
        let (dirty, dependencies) = {
            let state = self.state.lock();
            if state.disposed {
                return;
            }
            (state.dirty, state.dependencies.clone())
        };

        match dirty {
            DirtyState::Clean => {}
            DirtyState::MaybeDirty if dependencies.are_current() => {
                let mut state = self.state.lock();
                if state.dirty == DirtyState::MaybeDirty {
                    state.dirty = DirtyState::Clean;
                }
            }
            _ => self.start(),
        }
    }
}

impl<T> Drop for AsyncBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.arbiter.get_mut().close();
        let mut dependencies = std::mem::take(&mut self.state.get_mut().dependencies);
        dependencies.release(self.id);
    }
}

impl<T> Clone for AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            body: Arc::clone(&self.body),
        }
    }
}

impl<T> Debug for AsyncComputed<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncComputed")
            .field("id", &self.body.id)
            .field("name", &self.body.name)
            .field("policy", &self.policy())
            .field("output", &self.body.output.get_untracked())
            .field("executing", &self.body.executing.get_untracked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn build_without_runtime_fails() {
        let result = AsyncComputed::builder(0, |_token| async { anyhow::Ok(1) }).build();
        assert!(matches!(result, Err(ReactiveError::NoRuntime)));
    }

    #[test]
    fn explicit_handle_is_used_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let computed = AsyncComputed::builder(0, |_token| async { anyhow::Ok(7) })
            .runtime(runtime.handle().clone())
            .build()
            .unwrap();

        runtime.block_on(wait_until(|| computed.get() == 7));
        assert!(!computed.is_executing().get());
    }

    #[tokio::test]
    async fn start_value_is_visible_until_first_result() {
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let gate = Mutex::new(Some(gate));

        let computed = AsyncComputed::builder(-1, move |_token| {
            let gate = gate.lock().take();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                anyhow::Ok(10)
            }
        })
        .build()
        .unwrap();

        assert_eq!(computed.get(), -1);
        assert!(computed.is_executing().get());

        release.send(()).unwrap();
        wait_until(|| computed.get() == 10).await;
        assert!(!computed.is_executing().get());
    }

    #[tokio::test]
    async fn dependency_change_starts_a_new_run() {
        let input = Signal::new(2);
        let i = input.clone();
        let computed = AsyncComputed::builder(0, move |_token| {
            let value = i.get();
            async move { anyhow::Ok(value * 10) }
        })
        .build()
        .unwrap();

        wait_until(|| computed.get() == 20).await;
        assert_eq!(computed.dependency_count(), 1);

        input.set(3);
        wait_until(|| computed.get() == 30).await;
    }

    #[tokio::test]
    async fn failure_uses_fallback_then_surfaces_without_one() {
        let with_fallback = AsyncComputed::builder(0, |_token| async { Err::<i32, _>(anyhow::anyhow!("offline")) })
            .fallback(|| Some(-1))
            .build()
            .unwrap();
        wait_until(|| with_fallback.get() == -1).await;

        let without = AsyncComputed::builder(0, |_token| async { Err::<i32, _>(anyhow::anyhow!("offline")) })
            .build()
            .unwrap();
        wait_until(|| without.try_get().is_err()).await;
        assert!(matches!(without.try_get(), Err(ReactiveError::Derivation(_))));
    }

    #[tokio::test]
    async fn dispose_cancels_in_flight_run() {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cancelled.clone();
        let computed = AsyncComputed::builder(0, move |token: CancellationToken| {
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Err::<i32, _>(anyhow::Error::new(ReactiveError::Cancelled))
            }
        })
        .build()
        .unwrap();

        computed.dispose();
        computed.dispose();

        wait_until(|| cancelled.load(std::sync::atomic::Ordering::SeqCst)).await;
        assert!(matches!(computed.try_get(), Err(ReactiveError::Disposed(_))));
        assert!(!computed.is_executing().get());
    }
}
