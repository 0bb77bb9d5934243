use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::fetch::FetchResponse;

/// Named cache stores shared by the dispatcher and the page.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Looks up `key` in one store.
    async fn match_in(&self, store: &str, key: &str) -> Option<FetchResponse>;
    /// Looks up `key` across every store in creation order.
    async fn match_any(&self, key: &str) -> Option<FetchResponse>;
    /// Inserts or replaces an entry, creating the store when missing.
    async fn put(&self, store: &str, key: &str, response: FetchResponse);
    /// Removes a whole store. Returns `false` when it did not exist.
    async fn delete_store(&self, store: &str) -> bool;
    async fn store_names(&self) -> Vec<String>;
    async fn keys(&self, store: &str) -> Vec<String>;
    /// Sum of cached body sizes across all stores.
    async fn total_bytes(&self) -> u64;
}

type Store = HashMap<String, FetchResponse>;

/// Process-local [`CacheStorage`].
#[derive(Default)]
pub struct MemoryCacheStorage {
    stores: Mutex<Vec<(String, Store)>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stores<R>(&self, f: impl FnOnce(&mut Vec<(String, Store)>) -> R) -> R {
        let mut stores = match self.stores.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut stores)
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn match_in(&self, store: &str, key: &str) -> Option<FetchResponse> {
        self.with_stores(|stores| {
            stores
                .iter()
                .find(|(name, _)| name == store)
                .and_then(|(_, entries)| entries.get(key).cloned())
        })
    }

    async fn match_any(&self, key: &str) -> Option<FetchResponse> {
        self.with_stores(|stores| {
            stores
                .iter()
                .find_map(|(_, entries)| entries.get(key).cloned())
        })
    }

    async fn put(&self, store: &str, key: &str, response: FetchResponse) {
        self.with_stores(|stores| {
            match stores.iter_mut().find(|(name, _)| name == store) {
                Some((_, entries)) => {
                    entries.insert(key.to_string(), response);
                }
                None => {
                    let mut entries = Store::new();
                    entries.insert(key.to_string(), response);
                    stores.push((store.to_string(), entries));
                }
            }
        })
    }

    async fn delete_store(&self, store: &str) -> bool {
        self.with_stores(|stores| {
            let before = stores.len();
            stores.retain(|(name, _)| name != store);
            stores.len() != before
        })
    }

    async fn store_names(&self) -> Vec<String> {
        self.with_stores(|stores| stores.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn keys(&self, store: &str) -> Vec<String> {
        self.with_stores(|stores| {
            let mut keys: Vec<String> = stores
                .iter()
                .find(|(name, _)| name == store)
                .map(|(_, entries)| entries.keys().cloned().collect())
                .unwrap_or_default();
            keys.sort();
            keys
        })
    }

    async fn total_bytes(&self) -> u64 {
        self.with_stores(|stores| {
            stores
                .iter()
                .flat_map(|(_, entries)| entries.values())
                .map(FetchResponse::size)
                .sum()
        })
    }
}
