//! Factory Composition Tests
//!
//! Decorating factories stacked on top of each other, observed through the
//! nodes they build.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ripple_core::factory::{gate_signal, CancelGateFactory, CoreFactory, OnErrorFactory, SignalFactory};
use ripple_core::reactive::{AsyncComputed, ComputedOptions, ConcurrencyPolicy, EffectOptions, Signal};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

type Reports = Arc<Mutex<Vec<String>>>;

fn stacked(gate: &Signal<CancellationToken>) -> (OnErrorFactory<CancelGateFactory<CoreFactory>>, Reports) {
    let reports = Reports::default();
    let sink = reports.clone();
    let factory = OnErrorFactory::new(CancelGateFactory::new(CoreFactory, gate.clone()), move |error| {
        sink.lock().push(error.to_string());
    })
    .ignore_cancellation(true);
    (factory, reports)
}

/// A closed gate freezes computeds and effects without being reported as an
/// error; reopening it catches everything up.
#[test]
fn gate_and_error_reporting_compose() {
    init_tracing();
    let gate = gate_signal(CancellationToken::new());
    let (factory, reports) = stacked(&gate);

    let input = Signal::new(1);
    let i = input.clone();
    let doubled = factory.computed(
        move || {
            let value = i.get();
            anyhow::ensure!(value >= 0, "negative input {value}");
            Ok(value * 2)
        },
        ComputedOptions::new().name("doubled"),
    );

    let runs = Arc::new(AtomicI32::new(0));
    let last = Arc::new(AtomicI32::new(0));
    let (d, r, l) = (doubled.clone(), runs.clone(), last.clone());
    let _effect = factory.effect(
        move || {
            if let Ok(value) = d.try_get() {
                l.store(value, Ordering::SeqCst);
            }
            r.fetch_add(1, Ordering::SeqCst);
        },
        EffectOptions::new().name("mirror"),
    );
    assert_eq!(last.load(Ordering::SeqCst), 2);

    gate.get_untracked().cancel();
    gate.set(gate.get_untracked());
    input.set(5);

    // Frozen: previous value kept, nothing reported
    assert_eq!(doubled.get(), 2);
    assert_eq!(last.load(Ordering::SeqCst), 2);
    assert!(reports.lock().is_empty());

    gate.set(CancellationToken::new());
    assert_eq!(doubled.get(), 10);
    assert_eq!(last.load(Ordering::SeqCst), 10);

    // Real failures still get through to the hook
    input.set(-1);
    assert!(doubled.try_get().is_err());
    assert_eq!(*reports.lock(), vec!["derivation failed: negative input -1".to_string()]);
    assert!(runs.load(Ordering::SeqCst) >= 3);
}

/// Async derivations built through the gate see their token cancelled when
/// the gate closes, and the cancellation is not reported.
#[tokio::test]
async fn gated_async_computed_is_cancelled_by_the_gate() {
    init_tracing();
    let gate = gate_signal(CancellationToken::new());
    let (factory, reports) = stacked(&gate);

    let observed = Arc::new(Mutex::new(None::<CancellationToken>));
    let sink = observed.clone();
    let builder = AsyncComputed::builder(0, move |token: CancellationToken| {
        *sink.lock() = Some(token.clone());
        async move {
            token.cancelled().await;
            Err::<i32, _>(anyhow::Error::new(ripple_core::ReactiveError::Cancelled))
        }
    })
    .policy(ConcurrencyPolicy::Supersede);
    let computed = factory.async_computed(builder).unwrap();

    assert!(computed.is_executing().get());
    let token = observed.lock().clone().unwrap();
    assert!(!token.is_cancelled());

    gate.get_untracked().cancel();
    wait_until(|| token.is_cancelled()).await;
    wait_until(|| computed.running() == 0).await;

    // Cancellation never replaces the last value
    assert_eq!(computed.get(), 0);
    assert!(reports.lock().is_empty());
}

/// Async effects built through the error layer report their failures.
#[tokio::test]
async fn async_effect_failures_are_reported() {
    init_tracing();
    let reports = Reports::default();
    let sink = reports.clone();
    let factory = OnErrorFactory::new(CoreFactory, move |error| sink.lock().push(error.to_string()));

    let input = Signal::new(0);
    let i = input.clone();
    let _effect = factory
        .async_effect(
            move |_token| {
                let value = i.get();
                async move {
                    anyhow::ensure!(value % 2 == 0, "odd value {value}");
                    Ok(())
                }
            },
            ConcurrencyPolicy::Queue,
            EffectOptions::new(),
        )
        .unwrap();

    input.set(3);
    wait_until(|| !reports.lock().is_empty()).await;
    assert_eq!(*reports.lock(), vec!["derivation failed: odd value 3".to_string()]);
}
