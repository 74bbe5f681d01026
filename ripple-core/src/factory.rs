//! Signal Factories
//!
//! A [`SignalFactory`] builds computeds, async computeds and effects. The
//! plain [`CoreFactory`] builds them as-is; decorating factories wrap the
//! derivations and actions they are given and hand the wrapped versions to an
//! inner factory. Decorators compose by nesting:
//!
//! ```rust
//! use ripple_core::factory::{gate_signal, CancelGateFactory, CoreFactory, OnErrorFactory, SignalFactory};
//! use ripple_core::reactive::ComputedOptions;
//! use tokio_util::sync::CancellationToken;
//!
//! let gate = gate_signal(CancellationToken::new());
//! let factory = OnErrorFactory::new(CancelGateFactory::new(CoreFactory, gate), |error| {
//!     eprintln!("derivation failed: {error}");
//! });
//!
//! let answer = factory.computed(|| Ok(42), ComputedOptions::new());
//! assert_eq!(answer.get(), 42);
//! ```

use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{ReactiveError, Result};
use crate::reactive::{
    untracked, AsyncComputed, AsyncComputedBuilder, AsyncDerivation, Computed, ComputedOptions,
    ConcurrencyPolicy, Effect, EffectOptions, Signal,
};

/// The construction contract shared by every factory layer.
pub trait SignalFactory: Send + Sync {
    fn computed<T, F>(&self, derive: F, options: ComputedOptions<T>) -> Computed<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static;

    fn async_computed<T>(&self, builder: AsyncComputedBuilder<T>) -> Result<AsyncComputed<T>>
    where
        T: Clone + Send + Sync + PartialEq + 'static;

    fn effect<F>(&self, action: F, options: EffectOptions) -> Effect
    where
        F: Fn() + Send + Sync + 'static;

    fn async_effect<F, Fut>(
        &self,
        action: F,
        policy: ConcurrencyPolicy,
        options: EffectOptions,
    ) -> Result<Effect>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static;
}

/// Builds nodes without any decoration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreFactory;

impl SignalFactory for CoreFactory {
    fn computed<T, F>(&self, derive: F, options: ComputedOptions<T>) -> Computed<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Computed::with_options(derive, options)
    }

    fn async_computed<T>(&self, builder: AsyncComputedBuilder<T>) -> Result<AsyncComputed<T>>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
    {
        builder.build()
    }

    fn effect<F>(&self, action: F, options: EffectOptions) -> Effect
    where
        F: Fn() + Send + Sync + 'static,
    {
        Effect::with_options(action, options)
    }

    fn async_effect<F, Fut>(
        &self,
        action: F,
        policy: ConcurrencyPolicy,
        options: EffectOptions,
    ) -> Result<Effect>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Effect::new_async_with_options(action, policy, options)
    }
}

// ----------------------------------------------------------------------------
// Error reporting
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct ErrorHook {
    on_error: Arc<dyn Fn(&ReactiveError) + Send + Sync>,
    ignore_cancellation: bool,
}

impl ErrorHook {
    fn report(&self, error: &ReactiveError) {
        if self.ignore_cancellation && error.is_cancelled() {
            return;
        }
        // The hook runs inside the failing node's derivation; nothing it
        // reads may become a dependency of that node.
        untracked(|| (self.on_error)(error));
    }

    /// Report `error` and hand it back for propagation.
    fn observe(&self, error: anyhow::Error) -> anyhow::Error {
        let error = ReactiveError::from_derivation(error);
        self.report(&error);
        anyhow::Error::new(error)
    }
}

/// Reports derivation errors and effect panics to a callback, then lets them
/// continue as if nothing had been watching.
pub struct OnErrorFactory<F> {
    inner: F,
    hook: ErrorHook,
}

impl<F: SignalFactory> OnErrorFactory<F> {
    pub fn new<E>(inner: F, on_error: E) -> Self
    where
        E: Fn(&ReactiveError) + Send + Sync + 'static,
    {
        Self {
            inner,
            hook: ErrorHook {
                on_error: Arc::new(on_error),
                ignore_cancellation: false,
            },
        }
    }

    /// Do not report cooperative cancellations.
    pub fn ignore_cancellation(mut self, ignore: bool) -> Self {
        self.hook.ignore_cancellation = ignore;
        self
    }
}

impl<F: SignalFactory> SignalFactory for OnErrorFactory<F> {
    fn computed<T, D>(&self, derive: D, options: ComputedOptions<T>) -> Computed<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        D: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let hook = self.hook.clone();
        self.inner
            .computed(move || derive().map_err(|error| hook.observe(error)), options)
    }

    fn async_computed<T>(&self, builder: AsyncComputedBuilder<T>) -> Result<AsyncComputed<T>>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
    {
        let hook = self.hook.clone();
        let builder = builder.map_derivation(move |derive| -> AsyncDerivation<T> {
            Arc::new(move |token| {
                let future = derive(token);
                let hook = hook.clone();
                async move { future.await.map_err(|error| hook.observe(error)) }.boxed()
            })
        });
        self.inner.async_computed(builder)
    }

    fn effect<A>(&self, action: A, options: EffectOptions) -> Effect
    where
        A: Fn() + Send + Sync + 'static,
    {
        let hook = self.hook.clone();
        self.inner.effect(
            move || {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action())) {
                    hook.report(&ReactiveError::from_panic(payload.as_ref()));
                    resume_unwind(payload);
                }
            },
            options,
        )
    }

    fn async_effect<A, Fut>(
        &self,
        action: A,
        policy: ConcurrencyPolicy,
        options: EffectOptions,
    ) -> Result<Effect>
    where
        A: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let hook = self.hook.clone();
        self.inner.async_effect(
            move |token| {
                let future = action(token);
                let hook = hook.clone();
                async move { future.await.map_err(|error| hook.observe(error)) }
            },
            policy,
            options,
        )
    }
}

// ----------------------------------------------------------------------------
// Cancellation gating
// ----------------------------------------------------------------------------

/// Gates everything it builds on the token currently held by a signal.
///
/// While that token is cancelled, computeds keep their previous value and
/// effects skip their runs. Async work receives a token that is cancelled
/// when either its own run or the gate is cancelled. Replacing the token in
/// the signal re-evaluates everything that was gated.
pub struct CancelGateFactory<F> {
    inner: F,
    gate: Signal<CancellationToken>,
}

impl<F: SignalFactory> CancelGateFactory<F> {
    pub fn new(inner: F, gate: Signal<CancellationToken>) -> Self {
        Self { inner, gate }
    }
}

/// A signal suitable as a cancellation gate. Every write counts as a change.
pub fn gate_signal(token: CancellationToken) -> Signal<CancellationToken> {
    Signal::with_comparer(token, |_, _| false)
}

/// Race `future` against `gate`; if the gate fires first, cancel `linked`
/// and let the future finish cooperatively.
async fn gated<T>(
    future: impl Future<Output = anyhow::Result<T>>,
    gate: CancellationToken,
    linked: CancellationToken,
) -> anyhow::Result<T> {
    tokio::pin!(future);
    tokio::select! {
        result = &mut future => result,
        _ = gate.cancelled() => {
            linked.cancel();
            future.await
        }
    }
}

impl<F: SignalFactory> SignalFactory for CancelGateFactory<F> {
    fn computed<T, D>(&self, derive: D, options: ComputedOptions<T>) -> Computed<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        D: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let gate = self.gate.clone();
        self.inner.computed(
            move || {
                if gate.get().is_cancelled() {
                    return Err(ReactiveError::Cancelled.into());
                }
                derive()
            },
            options,
        )
    }

    fn async_computed<T>(&self, builder: AsyncComputedBuilder<T>) -> Result<AsyncComputed<T>>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
    {
        let gate = self.gate.clone();
        let builder = builder.map_derivation(move |derive| -> AsyncDerivation<T> {
            Arc::new(move |token: CancellationToken| {
                let gate_token = gate.get();
                if gate_token.is_cancelled() || token.is_cancelled() {
                    return async { Err::<T, _>(anyhow::Error::new(ReactiveError::Cancelled)) }.boxed();
                }
                let linked = token.child_token();
                let future = derive(linked.clone());
                gated(future, gate_token, linked).boxed()
            })
        });
        self.inner.async_computed(builder)
    }

    fn effect<A>(&self, action: A, options: EffectOptions) -> Effect
    where
        A: Fn() + Send + Sync + 'static,
    {
        let gate = self.gate.clone();
        self.inner.effect(
            move || {
                if gate.get().is_cancelled() {
                    tracing::trace!("gate cancelled, effect run skipped");
                    return;
                }
                action();
            },
            options,
        )
    }

    fn async_effect<A, Fut>(
        &self,
        action: A,
        policy: ConcurrencyPolicy,
        options: EffectOptions,
    ) -> Result<Effect>
    where
        A: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let gate = self.gate.clone();
        self.inner.async_effect(
            move |token: CancellationToken| {
                let gate_token = gate.get();
                if gate_token.is_cancelled() || token.is_cancelled() {
                    return async { anyhow::Ok(()) }.boxed();
                }
                let linked = token.child_token();
                let future = action(linked.clone());
                gated(future, gate_token, linked).boxed()
            },
            policy,
            options,
        )
    }
}
