//! Ripple Core
//!
//! This crate provides a fine-grained reactive core. It implements:
//!
//! - Reactive primitives (signals, computeds, async computeds, effects)
//! - Automatic dependency tracking
//! - Atomic batches with exactly-once effect flushing
//! - Pluggable effect schedulers
//! - Composable factories for error reporting and cancellation gating
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Core reactive primitives, tracking context and batching
//! - `graph`: Dependency edges, node identity and dirty states
//! - `scheduler`: Where effect re-runs execute
//! - `factory`: Construction contract and decorating layers
//! - `error`: The error type shared by all of the above
//!
//! # Example
//!
//! ```rust
//! use ripple_core::reactive::{atomic, Computed, Effect, Signal};
//! use std::sync::atomic::{AtomicI32, Ordering};
//! use std::sync::Arc;
//!
//! // Create a signal
//! let count = Signal::new(0);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     Computed::new(move || count.get() * 2)
//! };
//!
//! // Create an effect
//! let seen = Arc::new(AtomicI32::new(0));
//! let _effect = {
//!     let (doubled, seen) = (doubled.clone(), seen.clone());
//!     Effect::new(move || seen.store(doubled.get(), Ordering::SeqCst))
//! };
//!
//! // Update the signal twice, the effect runs once
//! atomic(|| {
//!     count.set(4);
//!     count.set(5);
//! });
//! assert_eq!(seen.load(Ordering::SeqCst), 10);
//! ```

pub mod error;
pub mod factory;
pub mod graph;
pub mod reactive;
pub mod scheduler;

pub use error::{Outcome, ReactiveError, Result};
pub use factory::{CancelGateFactory, CoreFactory, OnErrorFactory, SignalFactory};
pub use reactive::{
    atomic, untracked, AsyncComputed, Computed, ConcurrencyPolicy, Effect, Signal,
};
pub use scheduler::{ImmediateScheduler, QueueScheduler, ScheduledWork, Scheduler, TokioScheduler};
