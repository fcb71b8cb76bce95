//! Keyed callback registry.
//!
//! Callbacks run in registration order. Dispatch snapshots the callback list
//! first, so a callback may subscribe or unsubscribe without deadlocking.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Registry<K, T> {
    entries: RwLock<HashMap<K, Vec<(u64, Callback<T>)>>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash + Clone, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, T> Registry<K, T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, key: K, callback: Callback<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.entry(key).or_default().push((id, callback));
        id
    }

    pub fn remove(&self, key: &K, id: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let Some(list) = entries.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(cb_id, _)| *cb_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Call every callback registered for `key`. Returns how many ran.
    pub fn dispatch(&self, key: &K, value: &T) -> usize {
        let callbacks: Vec<Callback<T>> = {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match entries.get(key) {
                Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return 0,
            }
        };
        for callback in &callbacks {
            callback(value);
        }
        callbacks.len()
    }

    pub fn count(&self, key: &K) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by every `subscribe` call.
///
/// Dropping it keeps the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<K, T>(registry: &Arc<Registry<K, T>>, key: K, id: u64) -> Self
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        T: 'static,
    {
        let registry = Arc::downgrade(registry);
        Self {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(&key, id);
                }
            })),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry: Registry<&str, i32> = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            registry.register("t", Arc::new(move |v: &i32| seen.lock().unwrap().push((tag, *v))));
        }
        assert_eq!(registry.dispatch(&"t", &7), 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn test_remove_only_target() {
        let registry: Registry<&str, i32> = Registry::new();
        let a = registry.register("t", Arc::new(|_: &i32| {}));
        let _b = registry.register("t", Arc::new(|_: &i32| {}));
        assert!(registry.remove(&"t", a));
        assert!(!registry.remove(&"t", a));
        assert_eq!(registry.count(&"t"), 1);
    }

    #[test]
    fn test_keys_isolated() {
        let registry: Registry<&str, i32> = Registry::new();
        registry.register("a", Arc::new(|_: &i32| {}));
        assert_eq!(registry.dispatch(&"b", &1), 0);
    }

    #[test]
    fn test_subscription_unsubscribe() {
        let registry: Arc<Registry<String, i32>> = Arc::new(Registry::new());
        let id = registry.register("k".into(), Arc::new(|_: &i32| {}));
        let sub = Subscription::new(&registry, "k".to_string(), id);
        assert_eq!(registry.count(&"k".to_string()), 1);
        sub.unsubscribe();
        assert_eq!(registry.count(&"k".to_string()), 0);
    }

    #[test]
    fn test_callback_may_register_during_dispatch() {
        let registry: Arc<Registry<&'static str, i32>> = Arc::new(Registry::new());
        let inner = registry.clone();
        registry.register(
            "t",
            Arc::new(move |_: &i32| {
                inner.register("t", Arc::new(|_: &i32| {}));
            }),
        );
        assert_eq!(registry.dispatch(&"t", &0), 1);
        assert_eq!(registry.count(&"t"), 2);
    }
}
