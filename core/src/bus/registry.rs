use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by [`SubscriptionRegistry::subscribe`]; identifies one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of callbacks for one event kind.
///
/// Delivery follows registration order. Publishing works on a snapshot of the
/// list, so a callback may subscribe or unsubscribe without deadlocking.
pub struct SubscriptionRegistry<T> {
    name: &'static str,
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, Callback<T>)>>,
}

impl<T> SubscriptionRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut entries) = self.entries.write() {
            entries.push((id, Arc::new(callback)));
            log::debug!("{}: added subscriber {:?}", self.name, id);
        }
        id
    }

    /// Removes the callback registered under `id`. Returns whether it was present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        before != entries.len()
    }

    /// Delivers `event` to every subscriber and returns how many were called.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<Callback<T>> = match self.entries.read() {
            Ok(entries) => entries.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return 0,
        };
        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
