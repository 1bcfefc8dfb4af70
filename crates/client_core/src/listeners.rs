use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of callbacks keyed by registration id. Dispatch iterates over a
/// snapshot, so callbacks may subscribe or unsubscribe while being notified.
pub struct ListenerRegistry<T> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        self: &Arc<Self>,
        listener: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, Arc::new(listener));
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Calls every listener registered at the time of the call, in
    /// registration order.
    pub fn dispatch(&self, notice: &T) {
        let snapshot: Vec<Listener<T>> = self.lock().values().cloned().collect();
        for listener in snapshot {
            listener(notice);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Listener<T>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Disposer for a registered listener; dropping it unregisters the listener.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription<T: 'static> {
    id: u64,
    registry: Weak<ListenerRegistry<T>>,
}

impl<T: 'static> Subscription<T> {
    pub fn unsubscribe(self) {}

    /// Keeps the listener registered for the registry's whole lifetime.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl<T: 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

#[cfg(test)]
#[path = "tests/listeners_tests.rs"]
mod tests;
