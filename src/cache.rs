//! Process-wide caches shared across reconciles
//!
//! Two structures outlive individual reconcile ticks: the serve-config cache
//! (suppresses re-pushing an unchanged Serve config to the dashboard) and the
//! deletion schedule (defers dangling-cluster deletion by a grace period).
//! Both are intentionally non-persistent; after an operator restart they are
//! rebuilt from observation. Reconciles for unrelated RayServices run
//! concurrently, so both tolerate concurrent access; neither carries
//! cross-key invariants.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use tracing::debug;

fn service_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Last applied Serve config per RayService and cluster.
///
/// The Ray dashboard does not cache the Serve application config, so without
/// this map every tick would re-push an identical config. Keyed by RayService
/// (bounded LRU), each entry maps cluster name to the last config text
/// successfully applied to that cluster's dashboard.
pub struct ServeConfigCache {
    inner: Mutex<LruCache<String, Arc<DashMap<String, String>>>>,
}

impl ServeConfigCache {
    /// Create a cache holding at most `capacity` RayService entries
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<DashMap<String, String>>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Last config applied to `cluster_name` on behalf of the given RayService
    pub fn get(&self, namespace: &str, name: &str, cluster_name: &str) -> Option<String> {
        let mut inner = self.lock();
        inner
            .get(&service_key(namespace, name))
            .and_then(|clusters| clusters.get(cluster_name).map(|v| v.value().clone()))
    }

    /// Record a successfully applied config. Empty configs are not cached.
    pub fn put(&self, namespace: &str, name: &str, cluster_name: &str, serve_config: &str) {
        if serve_config.is_empty() {
            return;
        }
        let mut inner = self.lock();
        let clusters = inner.get_or_insert(service_key(namespace, name), || Arc::new(DashMap::new()));
        clusters.insert(cluster_name.to_string(), serve_config.to_string());
    }

    /// Drop entries for clusters that are neither active nor pending.
    ///
    /// Invoked once per reconcile tick before any planner work so retired
    /// clusters do not pin stale configs.
    pub fn cleanup(&self, namespace: &str, name: &str, active_cluster: &str, pending_cluster: &str) {
        let mut inner = self.lock();
        if let Some(clusters) = inner.get(&service_key(namespace, name)) {
            clusters.retain(|cluster_name, _| {
                let keep = cluster_name == active_cluster || cluster_name == pending_cluster;
                if !keep {
                    debug!(cluster = %cluster_name, "removing stale serve config from cache");
                }
                keep
            });
        }
    }
}

/// Deferred deletion times for dangling RayClusters, keyed by
/// `namespace/name`.
///
/// An entry is added the first time a reconcile observes a cluster owned by
/// the service whose name is neither active nor pending; the cluster is
/// deleted on a later tick once the scheduled time has passed.
#[derive(Default)]
pub struct DeletionSchedule {
    inner: DashMap<String, DateTime<Utc>>,
}

impl DeletionSchedule {
    /// Create an empty schedule
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduled deletion time for a cluster, if one has been recorded
    pub fn get(&self, namespace: &str, name: &str) -> Option<DateTime<Utc>> {
        self.inner.get(&service_key(namespace, name)).map(|e| *e)
    }

    /// Record the deletion time for a cluster
    pub fn schedule(&self, namespace: &str, name: &str, at: DateTime<Utc>) {
        self.inner.insert(service_key(namespace, name), at);
    }

    /// Drop a cluster's entry (after its delete has been issued)
    pub fn remove(&self, namespace: &str, name: &str) {
        self.inner.remove(&service_key(namespace, name));
    }

    /// Number of scheduled deletions
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
