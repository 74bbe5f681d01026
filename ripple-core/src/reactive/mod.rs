//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds,
//! async computeds and effects.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a computed or effect), the signal
//! automatically registers that context as a dependent. When the signal's
//! value changes, all dependents are notified.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It re-evaluates only
//! when one of its dependencies changes, and only when it is read.
//!
//! ## Async Computeds
//!
//! An AsyncComputed derives its value from a future. Readers see the last
//! applied result; a [`ConcurrencyPolicy`] decides what happens when inputs
//! change while a run is in flight.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects are used to synchronize reactive state with
//! external systems.
//!
//! ## Atomic Batches
//!
//! Every write opens a batch, and [`atomic`] lets callers group several
//! writes into one. Effects dirtied inside a batch run once, after the
//! outermost batch closes.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a signal is read, we check if there is an active
//! tracking context and, if so, register the dependency.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

mod async_computed;
mod computed;
mod context;
mod effect;
mod policy;
mod runtime;
mod signal;
mod subscriber;

pub use async_computed::{AsyncComputed, AsyncComputedBuilder};
pub(crate) use async_computed::AsyncDerivation;
pub use computed::{Computed, ComputedOptions, Fallback};
pub use context::{track, untracked, ReactiveContext};
pub use effect::{Effect, EffectOptions};
pub use policy::ConcurrencyPolicy;
pub use runtime::{atomic, Runtime};
pub use signal::{default_comparer, Comparer, Signal, SignalOptions};
pub use subscriber::{Subscriber, SubscriberId};
