//! Error types for the reactive core.
//!
//! Derivations are written against [`anyhow::Result`], so user code can use
//! `?` freely. The core wraps whatever comes back in [`ReactiveError`], which
//! is cheap to clone because cached failures are handed to every reader.

use std::sync::Arc;

/// Errors surfaced by computed signals, async computed signals and the
/// factory layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// A derivation returned an error and no fallback value was available.
    #[error("derivation failed: {0}")]
    Derivation(Arc<anyhow::Error>),

    /// The derivation observed its cancellation token and gave up.
    #[error("derivation cancelled")]
    Cancelled,

    /// A computed signal was read from inside its own derivation.
    #[error("dependency cycle detected while evaluating {0}")]
    Cycle(String),

    /// The node was disposed before this operation.
    #[error("{0} has been disposed")]
    Disposed(String),

    /// An async derivation was created outside of a tokio runtime and no
    /// handle was supplied.
    #[error("no tokio runtime available to drive async derivations")]
    NoRuntime,

    /// An effect action panicked. Only produced by decorating layers that
    /// observe panics before letting them continue.
    #[error("effect panicked: {0}")]
    Panicked(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ReactiveError>;

impl ReactiveError {
    /// Wrap a user error coming out of a derivation.
    ///
    /// A [`ReactiveError`] that travelled through `anyhow` is unwrapped again
    /// so that cancellation stays distinguishable from failure.
    pub fn from_derivation(error: anyhow::Error) -> Self {
        match error.downcast::<ReactiveError>() {
            Ok(reactive) => reactive,
            Err(other) => ReactiveError::Derivation(Arc::new(other)),
        }
    }

    /// Whether this error represents cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReactiveError::Cancelled)
    }

    /// Build a [`ReactiveError::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        ReactiveError::Panicked(message)
    }
}

/// The cached result of a derivation.
///
/// Keeps "never evaluated" distinct from "evaluated to a value" and from
/// "evaluated to a failure".
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Nothing has been computed yet.
    Empty,
    /// The derivation (or its fallback) produced a value.
    Value(T),
    /// The derivation failed and no fallback value was available.
    Failed(ReactiveError),
}

impl<T> Outcome<T> {
    /// Whether a value is held.
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    /// Borrow the held value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Convert into a `Result`, treating `Empty` as `empty_error`.
    pub fn into_result(self, empty_error: impl FnOnce() -> ReactiveError) -> Result<T> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Failed(error) => Err(error),
            Outcome::Empty => Err(empty_error()),
        }
    }
}
