//! Effect Schedulers
//!
//! By default an effect re-runs inline, when the atomic batch that dirtied it
//! closes. An effect created with a [`Scheduler`] instead posts its re-run as
//! a unit of work. Dirtyings that arrive before the posted work runs are
//! coalesced into it, so the effect runs once with the latest inputs.
//!
//! # Provided Schedulers
//!
//! - [`ImmediateScheduler`]: runs work on the spot.
//! - [`QueueScheduler`]: holds work until [`QueueScheduler::run_pending`] is
//!   called. Useful for UI-style frame loops and for tests.
//! - [`TokioScheduler`]: spawns work onto a tokio runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::{ReactiveError, Result};

/// A unit of work posted to a scheduler.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Handle to posted work. Cancelling it before it runs turns it into a no-op.
#[derive(Debug, Clone, Default)]
pub struct ScheduledWork {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run `work` unless this handle was cancelled.
    pub fn run(&self, work: Work) {
        if !self.is_cancelled() {
            work();
        }
    }
}

/// Decides when posted effect re-runs execute.
pub trait Scheduler: Send + Sync {
    /// Post `work`. Implementations must skip it if the returned handle is
    /// cancelled before it runs.
    fn schedule(&self, work: Work) -> ScheduledWork;
}

/// Runs work immediately on the posting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, work: Work) -> ScheduledWork {
        let handle = ScheduledWork::new();
        handle.run(work);
        handle
    }
}

/// Holds work until it is explicitly drained.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<VecDeque<(ScheduledWork, Work)>>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run everything that was posted before this call.
    ///
    /// Work posted while draining waits for the next call. Returns the number
    /// of units that actually ran.
    pub fn run_pending(&self) -> usize {
        let batch = std::mem::take(&mut *self.queue.lock());
        let mut ran = 0;
        for (handle, work) in batch {
            if !handle.is_cancelled() {
                work();
                ran += 1;
            }
        }
        ran
    }

    /// Number of posted, not yet cancelled units.
    pub fn pending_count(&self) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|(handle, _)| !handle.is_cancelled())
            .count()
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, work: Work) -> ScheduledWork {
        let handle = ScheduledWork::new();
        self.queue.lock().push_back((handle.clone(), work));
        handle
    }
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Spawns work onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| ReactiveError::NoRuntime)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, work: Work) -> ScheduledWork {
        let handle = ScheduledWork::new();
        let task_handle = handle.clone();
        self.handle.spawn(async move { task_handle.run(work) });
        handle
    }
}
