//! Process-wide memoized observations, keyed by cluster name.
//!
//! Entries never expire. They are cleared when a redeploy decision proves them wrong, or when
//! the cluster is deleted, so the next pass re-reads the remote cluster.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Taint;
use parking_lot::RwLock;

/// Agent images currently running in a cluster. An empty string means the workload is absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentImages {
    pub node_agent: String,
    pub cluster_agent: String,
}

pub type ImageCache = dyn ClusterCache<AgentImages>;
pub type TaintCache = dyn ClusterCache<Vec<Taint>>;

/// Keyed store for a single kind of observation. `get` distinguishes an absent entry (`None`)
/// from a cached empty value.
pub trait ClusterCache<V>: Send + Sync {
    fn get(&self, cluster: &str) -> Option<V>;
    fn set(&self, cluster: &str, value: V);
    fn clear(&self, cluster: &str);
}

/// Thread-safe in-memory cache. One lock guards the whole map.
#[derive(Debug)]
pub struct SharedCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> Default for SharedCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> SharedCache<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: Clone + Send + Sync> ClusterCache<V> for SharedCache<V> {
    fn get(&self, cluster: &str) -> Option<V> {
        self.entries.read().get(cluster).cloned()
    }

    fn set(&self, cluster: &str, value: V) {
        self.entries.write().insert(cluster.to_string(), value);
    }

    fn clear(&self, cluster: &str) {
        self.entries.write().remove(cluster);
    }
}
