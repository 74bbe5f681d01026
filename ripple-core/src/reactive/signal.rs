//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (computed/effect), the
//!    read is recorded together with the signal's current version.
//!
//! 2. When the evaluation finishes, its owner subscribes to every recorded
//!    signal.
//!
//! 3. When a signal's value changes, every subscribed dependent is marked
//!    dirty inside an atomic batch, then effects are flushed.
//!
//! A write that is equal to the current value under the signal's comparer
//! is a no-op: no version bump, no dirtying, no notification.
//!
//! # Thread Safety
//!
//! Signals are `Send + Sync`. The value lives behind a `RwLock` and the
//! dependent set behind a `Mutex`; neither lock is held while dependents or
//! subscribers are being notified.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::context::ReactiveContext;
use super::runtime::Runtime;
use super::subscriber::{Subscriber, SubscriberId};
use crate::graph::{describe, mark_all, Dependents, DirtyState, NodeId, NodeKind, Reactive, Source};

/// Decides whether two values are equal. Equal writes are no-ops.
pub type Comparer<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// The comparer used when none is configured: `PartialEq`.
pub fn default_comparer<T: PartialEq + 'static>() -> Comparer<T> {
    Arc::new(|a: &T, b: &T| a == b)
}

/// Construction options for a [`Signal`].
pub struct SignalOptions<T> {
    name: Option<String>,
    comparer: Option<Comparer<T>>,
}

impl<T> Default for SignalOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            comparer: None,
        }
    }
}

impl<T> SignalOptions<T> {
    /// Start from the defaults: unnamed, `PartialEq` comparison.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the signal. The name shows up in logs and errors.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Use a custom equality comparer.
    pub fn comparer<F>(mut self, comparer: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.comparer = Some(Arc::new(comparer));
        self
    }
}

/// A reactive signal holding a value of type T.
///
/// Cloning a signal yields another handle to the same cell.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::Signal;
///
/// let count = Signal::new(0);
/// assert_eq!(count.get(), 0);
///
/// count.set(5);
/// count.update(|v| v + 1);
/// assert_eq!(count.get(), 6);
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    body: Arc<SignalBody<T>>,
}

struct SignalBody<T> {
    id: NodeId,
    name: Option<String>,
    value: RwLock<T>,
    /// Bumped on every effective write.
    version: AtomicU64,
    comparer: Comparer<T>,
    dependents: Mutex<Dependents>,
    subscribers: RwLock<Vec<Arc<Subscriber<T>>>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_options(value, SignalOptions::new())
    }

    /// Create a signal that uses `comparer` to detect no-op writes.
    pub fn with_comparer<F>(value: T, comparer: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::build(value, None, Arc::new(comparer))
    }

    /// Create a signal from explicit options.
    pub fn with_options(value: T, options: SignalOptions<T>) -> Self
    where
        T: PartialEq,
    {
        let comparer = options.comparer.unwrap_or_else(default_comparer::<T>);
        Self::build(value, options.name, comparer)
    }

    fn build(value: T, name: Option<String>, comparer: Comparer<T>) -> Self {
        Self {
            body: Arc::new(SignalBody {
                id: NodeId::new(),
                name,
                value: RwLock::new(value),
                version: AtomicU64::new(0),
                comparer,
                dependents: Mutex::new(Dependents::default()),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> NodeId {
        self.body.id
    }

    /// Get the signal's name, if it was given one.
    pub fn name(&self) -> Option<&str> {
        self.body.name.as_deref()
    }

    /// Number of effective writes so far.
    pub fn version(&self) -> u64 {
        self.body.version.load(Ordering::SeqCst)
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the signal
    /// as a dependency of the running computation.
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Borrow the current value, registering the read like [`Signal::get`].
    ///
    /// The value stays locked while `f` runs, so `f` must not write this
    /// signal. Use [`Signal::get`] when it might.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.body.value.read())
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.body.value.read().clone()
    }

    /// Set a new value and notify dependents.
    ///
    /// Dependent effects run before this returns, unless an atomic operation
    /// is open on this thread.
    pub fn set(&self, value: T) {
        self.replace(value);
    }

    /// Set a new value and return the one that is no longer held.
    ///
    /// For a no-op write that is `value` itself.
    pub fn replace(&self, value: T) -> T {
        let previous = {
            let mut current = self.body.value.write();
            if (self.body.comparer)(&current, &value) {
                tracing::trace!(signal = %self.describe(), "equal write ignored");
                return value;
            }
            let previous = std::mem::replace(&mut *current, value);
            self.body.version.fetch_add(1, Ordering::SeqCst);
            previous
        };

        tracing::trace!(signal = %self.describe(), version = self.version(), "signal written");
        self.body.notify();
        previous
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.get_untracked();
        self.set(f(&current));
    }

    /// Register a callback invoked with every new value.
    ///
    /// Callbacks run inside the atomic batch of the write that produced the
    /// value, so signals they write are flushed together with it.
    pub fn subscribe<F>(&self, notify: F) -> SubscriberId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let subscriber = Subscriber::new(notify);
        let id = subscriber.id();
        self.body.subscribers.write().push(Arc::new(subscriber));
        tracing::trace!(signal = %self.describe(), ?id, "subscriber added");
        id
    }

    /// Remove a subscriber. Unknown IDs are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.body.subscribers.write().retain(|s| s.id() != id);
    }

    /// Get the number of push subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.body.subscribers.read().len()
    }

    /// Get the number of computeds and effects currently depending on this
    /// signal.
    pub fn dependent_count(&self) -> usize {
        self.body.dependents.lock().len()
    }

    fn track(&self) {
        if ReactiveContext::is_tracking() {
            // Version first: a write landing in between makes the record look
            // stale rather than fresh.
            let version = self.body.version.load(Ordering::SeqCst);
            let source: Arc<dyn Source> = self.body.clone();
            ReactiveContext::record(&source, version);
        }
    }

    fn describe(&self) -> String {
        describe(NodeKind::Signal, self.body.id, self.body.name.as_deref())
    }
}

impl<T> SignalBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn notify(&self) {
        let dependents = self.dependents.lock().live();
        let subscribers = self.subscribers.read().clone();

        Runtime::atomic(|| {
            mark_all(dependents, DirtyState::Dirty);

            if !subscribers.is_empty() {
                let value = self.value.read().clone();
                for subscriber in &subscribers {
                    subscriber.notify(&value);
                }
            }
        });
    }
}

impl<T> Source for SignalBody<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn refresh(&self) -> u64 {
        self.version()
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn add_dependent(&self, id: NodeId, dependent: Weak<dyn Reactive>) {
        self.dependents.lock().insert(id, dependent);
    }

    fn remove_dependent(&self, id: NodeId) {
        self.dependents.lock().remove(id);
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            body: Arc::clone(&self.body),
        }
    }
}

impl<T> Default for Signal<T>
where
    T: Clone + Send + Sync + Default + PartialEq + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.body.id)
            .field("name", &self.body.name)
            .field("value", &self.get_untracked())
            .field("version", &self.version())
            .field("dependent_count", &self.dependent_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
