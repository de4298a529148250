//! Typed observer registries.
//!
//! Listeners are held weakly: the registry never keeps a listener alive, and
//! registration hands back a [`Subscription`] that unregisters on drop.
//! Notification happens synchronously on the calling thread, never on the
//! audio thread.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Entries<L> = Mutex<Vec<(u64, Weak<L>)>>;

struct Inner<L: ?Sized> {
    entries: Entries<L>,
    next_id: Mutex<u64>,
}

/// Registry of weakly held listeners of type `L`.
pub struct ListenerRegistry<L: ?Sized> {
    inner: Arc<Inner<L>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerRegistry<L> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
            }),
        }
    }

    /// Register `listener`. Dropping the returned token unregisters it.
    pub fn subscribe(&self, listener: &Arc<L>) -> Subscription {
        let id = {
            let mut next = self.inner.next_id.lock();
            *next += 1;
            *next
        };
        self.inner
            .entries
            .lock()
            .push((id, Arc::downgrade(listener)));
        let registry: Weak<Inner<L>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = registry.upgrade() {
                    inner.entries.lock().retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    /// Invoke `f` for every live listener. Dead entries are pruned.
    ///
    /// The registry lock is not held while listeners run, so a listener may
    /// subscribe or unsubscribe from inside its callback.
    pub fn notify(&self, mut f: impl FnMut(&L)) {
        let live: Vec<Arc<L>> = {
            let mut entries = self.inner.entries.lock();
            entries.retain(|(_, w)| w.strong_count() > 0);
            entries.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for listener in &live {
            f(listener);
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .count()
    }

    /// `true` when no live listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("entries", &self.inner.entries.lock().len())
            .finish()
    }
}

/// Registration token. Unregisters its listener when dropped.
#[must_use = "dropping a Subscription unregisters the listener immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister now.
    pub fn cancel(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
