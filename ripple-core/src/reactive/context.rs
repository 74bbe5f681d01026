//! Reactive Context
//!
//! The reactive context records which sources are read while a computation
//! runs. This enables automatic dependency tracking: reading a signal inside
//! a computed or an effect is all it takes to depend on it.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Entering an evaluation pushes a
//! recording frame; entering an untracked region pushes a frame that records
//! nothing. Reads are attributed to the top frame only, so an inner
//! evaluation fully shadows the outer one.
//!
//! Frames are popped by a guard, which keeps the stack consistent even if
//! the computation panics.

use std::cell::RefCell;
use std::sync::Arc;

use crate::graph::{Dependencies, Source};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
enum Frame {
    /// Reads are recorded into this set.
    Tracking(Dependencies),
    /// Reads are not attributed to anyone.
    Untracked,
}

/// Guard that pops the context frame when dropped.
pub struct ReactiveContext {
    /// Stack height right after our frame was pushed.
    depth: usize,
    popped: bool,
}

impl ReactiveContext {
    fn enter(frame: Frame) -> Self {
        let depth = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(frame);
            stack.len()
        });

        Self { depth, popped: false }
    }

    fn pop(&mut self) -> Option<Frame> {
        if self.popped {
            return None;
        }
        self.popped = true;

        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();

            // Frames must unwind in strict LIFO order.
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "ReactiveContext mismatch: expected depth {}, found {}",
                self.depth,
                stack.len()
            );
            stack.pop()
        })
    }

    /// Run `evaluate` in a fresh recording scope and return its result
    /// together with every source it read.
    pub fn track<R>(evaluate: impl FnOnce() -> R) -> (R, Dependencies) {
        let mut guard = Self::enter(Frame::Tracking(Dependencies::new()));
        let result = evaluate();

        let dependencies = match guard.pop() {
            Some(Frame::Tracking(dependencies)) => dependencies,
            _ => Dependencies::new(),
        };

        (result, dependencies)
    }

    /// Run `action` without attributing any read to the enclosing
    /// evaluation.
    pub fn untracked<R>(action: impl FnOnce() -> R) -> R {
        let _guard = Self::enter(Frame::Untracked);
        action()
    }

    /// Check if reads are currently being recorded.
    pub fn is_tracking() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(Frame::Tracking(_))))
    }

    /// Number of frames on this thread's stack.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }

    /// Record a read of `source` at `version` in the current frame, if any.
    pub(crate) fn record(source: &Arc<dyn Source>, version: u64) {
        CONTEXT_STACK.with(|stack| {
            if let Some(Frame::Tracking(dependencies)) = stack.borrow_mut().last_mut() {
                dependencies.record(source, version);
            }
        });
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        self.pop();
    }
}

/// Run `action` with dependency tracking suppressed.
///
/// Reads inside `action` do not register with the enclosing computed or
/// effect. The previous tracking state is restored on every exit path.
pub fn untracked<R>(action: impl FnOnce() -> R) -> R {
    ReactiveContext::untracked(action)
}

/// Run `evaluate` and report which sources it read.
pub fn track<R>(evaluate: impl FnOnce() -> R) -> (R, Dependencies) {
    ReactiveContext::track(evaluate)
}
