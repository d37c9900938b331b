//! Owned application registry
//!
//! Tracks the applications this node is responsible for along with one
//! bounded time-series cache per owned application. The set is replaced
//! wholesale on every successful refresh.

use super::AppIdSource;
use crate::cache::TimeSeriesCache;
use crate::models::AppInstanceMetric;
use crate::shard;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Cache type held for every owned application
pub type AppCache = TimeSeriesCache<AppInstanceMetric>;

/// Outcome of replacing the owned set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub owned: usize,
    pub added: usize,
    pub removed: usize,
}

/// Registry of owned applications and their caches
pub struct AppRegistry {
    node_index: usize,
    node_count: usize,
    cache_capacity: usize,
    owned: RwLock<HashSet<String>>,
    caches: RwLock<HashMap<String, Arc<AppCache>>>,
}

impl AppRegistry {
    /// Create an empty registry for node `node_index` out of `node_count`
    pub fn new(node_index: usize, node_count: usize, cache_capacity: usize) -> Self {
        Self {
            node_index,
            node_count,
            cache_capacity,
            owned: RwLock::new(HashSet::new()),
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Recompute ownership from the full application list.
    ///
    /// Newly owned applications get an empty cache; caches of applications
    /// no longer owned are dropped together with their samples.
    pub fn replace(&self, all_app_ids: &HashSet<String>) -> RefreshSummary {
        let owned: HashSet<String> = all_app_ids
            .iter()
            .filter(|id| shard::is_owner(id, self.node_index, self.node_count))
            .cloned()
            .collect();

        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);

        let before = caches.len();
        caches.retain(|id, _| owned.contains(id));
        let removed = before - caches.len();

        let mut added = 0;
        for id in &owned {
            if !caches.contains_key(id) {
                debug!(app_id = %id, "Creating cache for newly owned application");
                caches.insert(id.clone(), Arc::new(AppCache::new(self.cache_capacity)));
                added += 1;
            }
        }

        let summary = RefreshSummary {
            owned: owned.len(),
            added,
            removed,
        };

        *self.owned.write().unwrap_or_else(PoisonError::into_inner) = owned;
        summary
    }

    /// Snapshot of the owned application ids
    pub fn app_ids(&self) -> HashSet<String> {
        self.owned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_owned(&self, app_id: &str) -> bool {
        self.owned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(app_id)
    }

    /// Cache of an owned application
    pub fn cache(&self, app_id: &str) -> Option<Arc<AppCache>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .cloned()
    }

    /// Store a sample in its application's cache.
    ///
    /// Returns false when the application is not owned.
    pub fn put(&self, metric: AppInstanceMetric) -> bool {
        match self.cache(&metric.app_id) {
            Some(cache) => {
                cache.put(metric);
                true
            }
            None => false,
        }
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

impl AppIdSource for AppRegistry {
    fn app_ids(&self) -> HashSet<String> {
        AppRegistry::app_ids(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{METRIC_NAME_THROUGHPUT, UNIT_RPS};

    fn ids(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn metric(app_id: &str, timestamp: i64) -> AppInstanceMetric {
        AppInstanceMetric {
            app_id: app_id.to_string(),
            instance_index: 0,
            collected_at: timestamp,
            name: METRIC_NAME_THROUGHPUT.to_string(),
            unit: UNIT_RPS.to_string(),
            value: "1".to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_replace_keeps_only_owned_apps() {
        // app-id-1..8 hash to nodes 2, 2, 0, 0, 1, 1, 2, 0
        let registry = AppRegistry::new(0, 3, 10);
        let all = ids(&[
            "app-id-1", "app-id-2", "app-id-3", "app-id-4", "app-id-5", "app-id-6", "app-id-7",
            "app-id-8",
        ]);

        let summary = registry.replace(&all);
        assert_eq!(summary.owned, 3);
        assert_eq!(summary.added, 3);
        assert_eq!(registry.app_ids(), ids(&["app-id-3", "app-id-4", "app-id-8"]));
        assert!(registry.cache("app-id-3").is_some());
        assert!(registry.cache("app-id-1").is_none());
    }

    #[test]
    fn test_replace_drops_caches_of_lost_apps() {
        let registry = AppRegistry::new(0, 1, 10);
        registry.replace(&ids(&["app-a", "app-b"]));
        assert!(registry.put(metric("app-a", 1)));
        assert!(registry.put(metric("app-b", 1)));

        let summary = registry.replace(&ids(&["app-b", "app-c"]));
        assert_eq!(
            summary,
            RefreshSummary {
                owned: 2,
                added: 1,
                removed: 1
            }
        );
        assert!(registry.cache("app-a").is_none());
        assert!(!registry.is_owned("app-a"));

        // Surviving caches keep their samples
        assert_eq!(registry.cache("app-b").map(|c| c.len()), Some(1));
        assert_eq!(registry.cache("app-c").map(|c| c.len()), Some(0));
    }

    #[test]
    fn test_put_for_unowned_app_is_noop() {
        let registry = AppRegistry::new(0, 1, 10);
        assert!(!registry.put(metric("unknown", 1)));
        assert!(registry.cache("unknown").is_none());
    }

    #[test]
    fn test_cache_uses_configured_capacity() {
        let registry = AppRegistry::new(0, 1, 2);
        registry.replace(&ids(&["app-a"]));
        for ts in 0..5 {
            registry.put(metric("app-a", ts));
        }
        let cache = registry.cache("app-a").unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.capacity(), 2);
    }
}
