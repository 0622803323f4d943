//! Typed observer registry shared by the connectivity monitor and the sync
//! engine. Listeners run in registration order; a panicking listener is
//! caught and logged so it never starves the ones behind it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use log::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

pub struct Listeners<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

/// Handle returned by [`Listeners::subscribe`]. Unsubscribes on drop, or
/// explicitly via [`Subscription::unsubscribe`].
pub struct Subscription<T> {
    id: u64,
    registry: Weak<Mutex<Registry<T>>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(cb)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every listener with `event`. The lock is released before the
    /// callbacks run, so a listener may subscribe or unsubscribe reentrantly.
    pub fn emit(&self, event: &T) {
        let callbacks: Vec<Callback<T>> = {
            let registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            registry.entries.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
                warn!("event listener panicked; continuing with remaining listeners");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscription<T> {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_run_in_registration_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let _a = listeners.subscribe(move |v| s1.lock().unwrap().push(("a", *v)));
        let s2 = seen.clone();
        let _b = listeners.subscribe(move |v| s2.lock().unwrap().push(("b", *v)));

        listeners.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn panicking_listener_does_not_block_later_ones() {
        let listeners: Listeners<()> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = listeners.subscribe(|_| panic!("listener bug"));
        let h = hits.clone();
        let _good = listeners.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let listeners: Listeners<()> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = listeners.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 1);

        listeners.emit(&());
        sub.unsubscribe();
        listeners.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }
}
