//! Process-wide cache guaranteeing one live store per service.
//!
//! The registry only holds [`Weak`] references: callers own their stores through
//! `Arc`, and once the last `Arc` drops the store is gone. The next request for
//! the same service builds a fresh store with a fresh lock. Dead entries are
//! pruned lazily on lookup misses; there is no teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::store::SecureStore;

/// Weakly-referencing map from service description to live store.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: Mutex<HashMap<String, Weak<SecureStore>>>,
}

impl StoreRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    #[must_use]
    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<StoreRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::new)
    }

    // The map only holds weak references, so it stays consistent even if a
    // holder panicked.
    fn stores(&self) -> MutexGuard<'_, HashMap<String, Weak<SecureStore>>> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live store registered under `key`, or registers the one built by `factory`.
    ///
    /// The lookup, the factory call and the insert share one critical section, so
    /// concurrent callers with the same key all receive the same instance.
    /// `factory` must not block.
    pub fn resolve_or_create<F>(&self, key: &str, factory: F) -> Arc<SecureStore>
    where
        F: FnOnce() -> SecureStore,
    {
        let mut stores = self.stores();
        if let Some(store) = stores.get(key).and_then(Weak::upgrade) {
            log::debug!("store registry hit for {key}");
            return store;
        }

        stores.retain(|_, store| store.strong_count() > 0);
        let store = Arc::new(factory());
        stores.insert(key.to_string(), Arc::downgrade(&store));
        log::debug!("store registry created store for {key}");
        store
    }

    /// Returns the number of registered stores that are still alive.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.stores()
            .values()
            .filter(|store| store.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use super::*;
    use crate::platform::memory::MemoryBackend;
    use crate::service::{Flavor, Service};
    use crate::{AccessControl, Identifier, SecureItemBackend};

    fn service(name: &str) -> Service {
        Service::standard(
            Identifier::new(name).expect("identifier"),
            Flavor::SecureEnclave(AccessControl::UserPresence),
        )
    }

    fn backend() -> Arc<dyn SecureItemBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn test_live_instance_is_reused() {
        let registry = StoreRegistry::new();
        let backend = backend();
        let first = SecureStore::open_in(&registry, Arc::clone(&backend), service("a"));
        let second = SecureStore::open_in(&registry, Arc::clone(&backend), service("a"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn test_global_registry_is_one_instance() {
        assert!(std::ptr::eq(StoreRegistry::global(), StoreRegistry::global()));
    }

    #[test]
    fn test_dropped_instance_is_replaced() {
        let registry = StoreRegistry::new();
        let backend = backend();
        drop(SecureStore::open_in(&registry, Arc::clone(&backend), service("a")));
        assert_eq!(registry.live_count(), 0);

        let calls = AtomicUsize::new(0);
        let store = registry.resolve_or_create(&service("a").description(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            SecureStore::new(Arc::clone(&backend), service("a"))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_count(), 1);
        assert_eq!(store.service(), &service("a"));
    }

    #[test]
    fn test_dead_entries_are_pruned_on_miss() {
        let registry = StoreRegistry::new();
        let backend = backend();
        drop(SecureStore::open_in(&registry, Arc::clone(&backend), service("a")));
        drop(SecureStore::open_in(&registry, Arc::clone(&backend), service("b")));
        assert_eq!(registry.stores().len(), 2);
        let _c = SecureStore::open_in(&registry, Arc::clone(&backend), service("c"));
        assert_eq!(registry.stores().len(), 1);
    }

    #[test]
    fn test_concurrent_resolution_has_single_winner() {
        const THREADS: usize = 16;
        let registry = Arc::new(StoreRegistry::new());
        let backend = backend();
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let backend = Arc::clone(&backend);
                let factory_calls = Arc::clone(&factory_calls);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.resolve_or_create(&service("shared").description(), || {
                        factory_calls.fetch_add(1, Ordering::SeqCst);
                        SecureStore::new(backend, service("shared"))
                    })
                })
            })
            .collect();

        let stores: Vec<Arc<SecureStore>> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread join"))
            .collect();

        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert!(stores.iter().all(|store| Arc::ptr_eq(store, &stores[0])));
        assert_eq!(registry.live_count(), 1);
    }
}
