//! Push-style subscribers.
//!
//! Besides being read by computeds and effects, a signal can push every new
//! value to plain callbacks. This is the observable boundary other systems
//! bind to: a callback is registered with `subscribe`, removed with
//! `unsubscribe`, and never participates in dependency tracking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A callback notified with each new value of a signal.
pub struct Subscriber<T> {
    id: SubscriberId,
    notify: Box<dyn Fn(&T) + Send + Sync>,
}

impl<T> Subscriber<T> {
    /// Create a new subscriber with the given notification callback.
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            id: SubscriberId::new(),
            notify: Box::new(notify),
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Deliver a value.
    pub fn notify(&self, value: &T) {
        (self.notify)(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn subscriber_notify_passes_value() {
        let seen = Arc::new(AtomicI32::new(0));
        let seen_clone = seen.clone();

        let subscriber = Subscriber::new(move |value: &i32| {
            seen_clone.store(*value, Ordering::SeqCst);
        });

        subscriber.notify(&7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
