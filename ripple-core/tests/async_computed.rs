//! Async Computed Tests
//!
//! Each derivation run parks on a gate keyed by the input it read, so tests
//! decide exactly when and in which order runs complete.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ripple_core::reactive::{AsyncComputed, Computed, ConcurrencyPolicy, Effect, Signal};
use ripple_core::ReactiveError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Release handles for parked runs, plus a log of every run started.
#[derive(Clone, Default)]
struct Gates {
    open: Arc<Mutex<HashMap<i32, oneshot::Sender<()>>>>,
    started: Arc<Mutex<Vec<i32>>>,
    tokens: Arc<Mutex<HashMap<i32, CancellationToken>>>,
}

impl Gates {
    /// Build an async computed over `input` whose runs yield `input * 10`
    /// once released.
    fn computed(&self, input: &Signal<i32>, policy: ConcurrencyPolicy) -> AsyncComputed<i32> {
        let gates = self.clone();
        let input = input.clone();
        AsyncComputed::builder(0, move |token: CancellationToken| {
            let value = input.get();
            let (release, parked) = oneshot::channel();
            gates.open.lock().insert(value, release);
            gates.started.lock().push(value);
            gates.tokens.lock().insert(value, token.clone());
            async move {
                tokio::select! {
                    _ = token.cancelled() => Err(anyhow::Error::new(ReactiveError::Cancelled)),
                    _ = parked => anyhow::Ok(value * 10),
                }
            }
        })
        .policy(policy)
        .build()
        .unwrap()
    }

    async fn release(&self, value: i32) {
        wait_until(|| self.open.lock().contains_key(&value)).await;
        let sender = self.open.lock().remove(&value).unwrap();
        sender.send(()).unwrap();
    }

    fn started(&self) -> Vec<i32> {
        self.started.lock().clone()
    }

    fn is_cancelled(&self, value: i32) -> bool {
        self.tokens.lock()[&value].is_cancelled()
    }
}

fn record_transitions(signal: &Signal<bool>) -> Arc<Mutex<Vec<bool>>> {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    signal.subscribe(move |value| sink.lock().push(*value));
    transitions
}

/// A superseded run is cancelled and `is_executing` stays true across the
/// hand-off to its replacement.
#[tokio::test]
async fn supersede_hands_off_without_flicker() {
    let gates = Gates::default();
    let input = Signal::new(1);
    let computed = gates.computed(&input, ConcurrencyPolicy::Supersede);
    let transitions = record_transitions(&computed.is_executing());

    input.set(2);
    assert!(gates.is_cancelled(1));
    assert!(!gates.is_cancelled(2));

    gates.release(2).await;
    wait_until(|| computed.get() == 20).await;

    assert_eq!(*transitions.lock(), vec![false]);
    assert_eq!(gates.started(), vec![1, 2]);
    assert_eq!(computed.running(), 0);
}

/// Triggers arriving during a run coalesce into one queued run that reads
/// the state current when it starts.
#[tokio::test]
async fn queue_runs_one_follow_up_with_latest_input() {
    let gates = Gates::default();
    let input = Signal::new(1);
    let computed = gates.computed(&input, ConcurrencyPolicy::Queue);

    input.set(2);
    input.set(3);
    assert_eq!(gates.started(), vec![1]);
    assert!(!gates.is_cancelled(1));

    gates.release(1).await;
    wait_until(|| computed.get() == 10).await;

    // The queued run picked up the latest input and keeps the node executing
    wait_until(|| gates.started() == vec![1, 3]).await;
    assert!(computed.is_executing().get());

    gates.release(3).await;
    wait_until(|| computed.get() == 30).await;
    wait_until(|| !computed.is_executing().get()).await;
}

/// Merge applies every result in completion order.
#[tokio::test]
async fn merge_applies_results_in_completion_order() {
    let gates = Gates::default();
    let input = Signal::new(1);
    let computed = gates.computed(&input, ConcurrencyPolicy::Merge);

    let applied = Arc::new(Mutex::new(Vec::new()));
    let (c, sink) = (computed.clone(), applied.clone());
    let _watch = Effect::new(move || sink.lock().push(c.get()));

    input.set(2);
    assert_eq!(computed.running(), 2);

    gates.release(2).await;
    wait_until(|| computed.get() == 20).await;
    assert!(computed.is_executing().get());

    gates.release(1).await;
    wait_until(|| computed.get() == 10).await;
    wait_until(|| !computed.is_executing().get()).await;

    assert_eq!(*applied.lock(), vec![0, 20, 10]);
}

/// IgnoreStale lets older runs finish but drops their results.
#[tokio::test]
async fn ignore_stale_drops_older_results() {
    let gates = Gates::default();
    let input = Signal::new(1);
    let computed = gates.computed(&input, ConcurrencyPolicy::IgnoreStale);

    input.set(2);
    assert!(!gates.is_cancelled(1));

    gates.release(2).await;
    wait_until(|| computed.get() == 20).await;
    assert!(!computed.is_executing().get());

    gates.release(1).await;
    wait_until(|| computed.running() == 0).await;
    assert_eq!(computed.get(), 20);
}

/// Computeds and effects downstream of an async computed follow its results.
#[tokio::test]
async fn downstream_nodes_follow_async_results() {
    let gates = Gates::default();
    let input = Signal::new(1);
    let computed = gates.computed(&input, ConcurrencyPolicy::default());

    let c = computed.clone();
    let plus_one = Computed::new(move || c.get() + 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (p, sink) = (plus_one.clone(), seen.clone());
    let _effect = Effect::new(move || sink.lock().push(p.get()));

    gates.release(1).await;
    wait_until(|| plus_one.get() == 11).await;

    input.set(4);
    gates.release(4).await;
    wait_until(|| plus_one.get() == 41).await;

    assert_eq!(*seen.lock(), vec![1, 11, 41]);
}

/// A failing run surfaces through `try_get` and recovers on the next input.
#[tokio::test]
async fn failure_then_recovery() {
    let input = Signal::new(0);
    let i = input.clone();
    let computed = AsyncComputed::builder(1, move |_token| {
        let value = i.get();
        async move {
            if value < 0 {
                anyhow::bail!("negative input {value}");
            }
            Ok(value)
        }
    })
    .build()
    .unwrap();

    input.set(-5);
    wait_until(|| computed.try_get().is_err()).await;
    let error = computed.try_get().unwrap_err();
    assert!(error.to_string().contains("negative input -5"));

    input.set(7);
    wait_until(|| matches!(computed.try_get(), Ok(7))).await;
}

/// A fallback replaces failures with a value.
#[tokio::test]
async fn fallback_replaces_failures() {
    let input = Signal::new(0);
    let i = input.clone();
    let computed = AsyncComputed::builder(1, move |_token| {
        let value = i.get();
        async move {
            if value < 0 {
                anyhow::bail!("negative input");
            }
            Ok(value)
        }
    })
    .fallback(|| Some(-1))
    .build()
    .unwrap();

    wait_until(|| computed.get() == 0).await;
    input.set(-3);
    wait_until(|| computed.get() == -1).await;
}

/// A derivation that panics before returning its future leaves the node
/// ready to run again on the next change, whatever the policy.
#[tokio::test]
async fn panicking_derivation_recovers_on_next_change() {
    for policy in [ConcurrencyPolicy::Supersede, ConcurrencyPolicy::Queue] {
        let input = Signal::new(1);
        let i = input.clone();
        let computed = AsyncComputed::builder(0, move |_token| {
            let value = i.get();
            assert_ne!(value, 2, "refusing input 2");
            async move { anyhow::Ok(value * 10) }
        })
        .policy(policy)
        .build()
        .unwrap();
        wait_until(|| computed.get() == 10).await;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| input.set(2)));
        assert!(result.is_err());
        assert_eq!(computed.running(), 0);
        assert!(!computed.is_executing().get());

        input.set(3);
        wait_until(|| computed.get() == 30).await;
        assert_eq!(computed.running(), 0);
    }
}
