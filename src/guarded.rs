//! Lock-protected values with change notification.
//!
//! Every piece of state shared between the reader threads and the caller
//! (connection state, channel state) lives in a [`GuardedValue`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by [`GuardedValue::add_observer`], used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverFn<T> = dyn Fn(&T, &T) + Send + Sync;

/// Mutex-protected value with change-notification observers.
///
/// Observers run with `(old, new)` only when the value actually changed,
/// and only after the internal lock has been released, so an observer may
/// call [`set`](GuardedValue::set) again without deadlocking.
pub struct GuardedValue<T> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    value: T,
    observers: Vec<(ObserverId, Arc<ObserverFn<T>>)>,
    next_id: u64,
}

impl<T: Clone + PartialEq> GuardedValue<T> {
    /// Create a new guarded value. `name` identifies it in log output.
    pub fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                value,
                observers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Replace the value, notifying observers if it changed.
    pub fn set(&self, new: T) {
        let (old, observers) = {
            let mut inner = self.inner.lock();
            if inner.value == new {
                return;
            }
            let old = std::mem::replace(&mut inner.value, new.clone());
            let observers: Vec<Arc<ObserverFn<T>>> =
                inner.observers.iter().map(|(_, f)| Arc::clone(f)).collect();
            (old, observers)
        };

        for observer in observers {
            // A panicking observer must not poison the caller of `set` or
            // starve the remaining observers.
            if panic::catch_unwind(AssertUnwindSafe(|| observer(&old, &new))).is_err() {
                log::error!("observer for {} panicked", self.name);
            }
        }
    }

    /// Register a change observer.
    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.observers.push((id, Arc::new(observer)));
        id
    }

    /// Remove a previously registered observer. Unknown ids are ignored.
    pub fn remove_observer(&self, id: ObserverId) {
        self.inner.lock().observers.retain(|(oid, _)| *oid != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_set() {
        let value = GuardedValue::new(1u32, "test");
        assert_eq!(value.get(), 1);
        value.set(2);
        assert_eq!(value.get(), 2);
    }

    #[test]
    fn test_observer_fires_only_on_change() {
        let value = GuardedValue::new(0u32, "test");
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        value.add_observer(move |old, new| {
            assert_ne!(old, new);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        value.set(0); // unchanged, no notification
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        value.set(1);
        value.set(1); // unchanged again
        value.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_sees_old_and_new() {
        let value = GuardedValue::new(10u32, "test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        value.add_observer(move |old, new| {
            seen_clone.lock().push((*old, *new));
        });

        value.set(20);
        value.set(30);
        assert_eq!(*seen.lock(), vec![(10, 20), (20, 30)]);
    }

    #[test]
    fn test_remove_observer() {
        let value = GuardedValue::new(0u32, "test");
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let id = value.add_observer(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        value.set(1);
        value.remove_observer(id);
        value.remove_observer(id); // removing twice is fine
        value.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let value = GuardedValue::new(0u32, "test");
        let calls = Arc::new(AtomicUsize::new(0));

        value.add_observer(|_, _| panic!("observer failure"));
        let calls_clone = Arc::clone(&calls);
        value.add_observer(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        value.set(1); // must not propagate the panic
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(value.get(), 1);
    }

    #[test]
    fn test_observer_may_set_again() {
        let value = Arc::new(GuardedValue::new(0u32, "test"));

        let value_clone = Arc::clone(&value);
        value.add_observer(move |_, new| {
            // Clamp anything above 10 back down; triggers a nested set.
            if *new > 10 {
                value_clone.set(10);
            }
        });

        value.set(99);
        assert_eq!(value.get(), 10);
    }
}
