//! Reactive Runtime
//!
//! The runtime is the batch coordinator. It decides *when* effects run,
//! while the graph decides *which* ones.
//!
//! # How It Works
//!
//! 1. Every signal write opens an atomic batch around the dirtying of its
//!    dependents, so a single write is just a batch of one.
//!
//! 2. While a batch is open, effects that become dirty are added to an
//!    insertion-ordered pending set. Re-adding is a no-op.
//!
//! 3. When the outermost batch closes, the pending set is drained in
//!    first-dirtied order and each effect is dispatched exactly once.
//!
//! 4. Effects that write signals while being flushed add to the same pending
//!    set; they are picked up by the same drain loop after the effects ahead
//!    of them.
//!
//! # Thread Safety
//!
//! Batch state is thread-local. Two threads writing signals batch
//! independently, and an atomic operation on one thread never defers
//! effects triggered on another.

use std::cell::RefCell;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::graph::NodeId;

/// Something the runtime can dispatch when a batch closes.
pub(crate) trait Dispatch: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Run now, or hand off to a scheduler.
    fn dispatch(self: Arc<Self>);
}

thread_local! {
    static BATCH: RefCell<BatchState> = RefCell::new(BatchState::default());
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    flushing: bool,
    pending: IndexMap<NodeId, Arc<dyn Dispatch>>,
}

/// Restores the batch depth on every exit path.
struct BatchGuard {
    exited: bool,
}

impl BatchGuard {
    fn enter() -> Self {
        BATCH.with(|batch| batch.borrow_mut().depth += 1);
        Self { exited: false }
    }

    /// Leave the batch; returns `true` if it was the outermost one.
    fn exit(mut self) -> bool {
        self.exited = true;
        Self::decrement()
    }

    fn decrement() -> bool {
        BATCH.with(|batch| {
            let mut batch = batch.borrow_mut();
            debug_assert!(batch.depth > 0, "atomic batch depth underflow");
            batch.depth -= 1;
            batch.depth == 0
        })
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if !self.exited {
            // Unwinding: pending effects stay queued for the next flush.
            Self::decrement();
        }
    }
}

/// Clears the flushing flag even if an effect panics.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        BATCH.with(|batch| batch.borrow_mut().flushing = false);
    }
}

/// The batch coordinator for the current thread.
pub struct Runtime;

impl Runtime {
    /// Run `action` as one atomic operation.
    ///
    /// Effects dirtied inside `action` run once, after the outermost atomic
    /// operation returns. Nested calls share the same batch.
    pub fn atomic<R>(action: impl FnOnce() -> R) -> R {
        let guard = BatchGuard::enter();
        let result = action();
        if guard.exit() {
            Self::flush();
        }
        result
    }

    /// Check if an atomic operation is open on this thread.
    pub fn in_atomic() -> bool {
        BATCH.with(|batch| batch.borrow().depth > 0)
    }

    /// Nesting depth of atomic operations on this thread.
    pub fn depth() -> usize {
        BATCH.with(|batch| batch.borrow().depth)
    }

    /// Number of effects waiting for the current batch to close.
    pub fn pending_count() -> usize {
        BATCH.with(|batch| batch.borrow().pending.len())
    }

    /// Queue `effect` if a batch is open or a flush is running; otherwise
    /// dispatch it right away.
    pub(crate) fn schedule_effect(effect: Arc<dyn Dispatch>) {
        let immediate = BATCH.with(|batch| {
            let mut batch = batch.borrow_mut();
            if batch.depth > 0 || batch.flushing {
                batch.pending.entry(effect.node_id()).or_insert(effect);
                None
            } else {
                Some(effect)
            }
        });

        if let Some(effect) = immediate {
            effect.dispatch();
        }
    }

    /// Drain the pending set in first-dirtied order.
    fn flush() {
        let entered = BATCH.with(|batch| {
            let mut batch = batch.borrow_mut();
            if batch.flushing || batch.depth > 0 {
                return false;
            }
            batch.flushing = true;
            true
        });
        if !entered {
            return;
        }

        let _reset = FlushGuard;
        let mut dispatched = 0usize;

        loop {
            let next = BATCH.with(|batch| {
                batch
                    .borrow_mut()
                    .pending
                    .shift_remove_index(0)
                    .map(|(_, effect)| effect)
            });

            match next {
                Some(effect) => {
                    effect.dispatch();
                    dispatched += 1;
                }
                None => break,
            }
        }

        if dispatched > 0 {
            tracing::trace!(dispatched, "flushed atomic batch");
        }
    }
}

/// Run `action` as one atomic operation. See [`Runtime::atomic`].
pub fn atomic<R>(action: impl FnOnce() -> R) -> R {
    Runtime::atomic(action)
}
