//! Concurrency policies for async derivations.
//!
//! An async computed or async effect may be triggered again while a previous
//! run is still in flight. The [`Arbiter`] decides, per policy, whether a new
//! run starts, which in-flight runs get cancelled, and whose result is
//! applied when runs settle.

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

/// What to do when an async derivation is triggered while another one is
/// still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConcurrencyPolicy {
    /// Cancel the in-flight run and start the new one.
    #[default]
    Supersede,
    /// Start the new run, let the old one finish and discard its result.
    IgnoreStale,
    /// Wait for the in-flight run. Triggers arriving meanwhile coalesce into
    /// one queued run, which reads the current state when it starts.
    Queue,
    /// Let runs race and apply every result in completion order.
    Merge,
}

/// The arbiter's answer to a trigger.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Start a run now.
    Start {
        generation: u64,
        token: CancellationToken,
    },
    /// A run is in flight and the policy queues behind it.
    Deferred,
    /// The owner was disposed.
    Closed,
}

/// The arbiter's answer to a settling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settlement {
    /// Whether the run's result should be applied.
    pub apply: bool,
    /// Whether a queued run should start now.
    pub run_queued: bool,
    /// Whether no authoritative run remains in flight.
    pub idle: bool,
}

/// Per-node bookkeeping of in-flight async runs.
#[derive(Debug)]
pub(crate) struct Arbiter {
    policy: ConcurrencyPolicy,
    latest: u64,
    in_flight: IndexMap<u64, CancellationToken>,
    queued: bool,
    closed: bool,
}

impl Arbiter {
    pub(crate) fn new(policy: ConcurrencyPolicy) -> Self {
        Self {
            policy,
            latest: 0,
            in_flight: IndexMap::new(),
            queued: false,
            closed: false,
        }
    }

    pub(crate) fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    pub(crate) fn running(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn admit(&mut self) -> Admission {
        if self.closed {
            return Admission::Closed;
        }

        match self.policy {
            ConcurrencyPolicy::Queue if !self.in_flight.is_empty() => {
                self.queued = true;
                return Admission::Deferred;
            }
            ConcurrencyPolicy::Supersede => {
                for token in self.in_flight.values() {
                    token.cancel();
                }
            }
            _ => {}
        }

        self.latest += 1;
        let token = CancellationToken::new();
        self.in_flight.insert(self.latest, token.clone());

        Admission::Start {
            generation: self.latest,
            token,
        }
    }

    /// Record that run `generation` finished. `cancelled` is true if its token
    /// was cancelled or it reported cancellation itself.
    pub(crate) fn settle(&mut self, generation: u64, cancelled: bool) -> Settlement {
        self.in_flight.shift_remove(&generation);

        let is_latest = generation == self.latest;
        let apply = !self.closed
            && !cancelled
            && match self.policy {
                ConcurrencyPolicy::Supersede | ConcurrencyPolicy::IgnoreStale => is_latest,
                ConcurrencyPolicy::Queue | ConcurrencyPolicy::Merge => true,
            };

        let run_queued = !self.closed && self.queued && self.in_flight.is_empty();
        if run_queued {
            self.queued = false;
        }

        let idle = !run_queued
            && match self.policy {
                ConcurrencyPolicy::Supersede | ConcurrencyPolicy::IgnoreStale => is_latest,
                ConcurrencyPolicy::Queue | ConcurrencyPolicy::Merge => self.in_flight.is_empty(),
            };

        Settlement {
            apply,
            run_queued,
            idle,
        }
    }

    /// Forget run `generation`, which was admitted but never spawned.
    ///
    /// Returns whether no authoritative run remains in flight.
    pub(crate) fn abandon(&mut self, generation: u64) -> bool {
        self.in_flight.shift_remove(&generation);
        if self.in_flight.is_empty() {
            self.queued = false;
        }
        match self.policy {
            ConcurrencyPolicy::Supersede | ConcurrencyPolicy::IgnoreStale => {
                generation == self.latest
            }
            ConcurrencyPolicy::Queue | ConcurrencyPolicy::Merge => self.in_flight.is_empty(),
        }
    }

    /// Cancel everything in flight and refuse further runs.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.queued = false;
        for token in self.in_flight.values() {
            token.cancel();
        }
    }
}
