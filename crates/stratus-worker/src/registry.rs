//! Registry of worker clusters, keyed by cluster name.
//!
//! Pure name-to-capability lookup: heavy client construction stays
//! inside the lazily-initialized `WorkerCluster` entries. The Cluster
//! reconciler feeds the registry (`observe` on every pass, `forget` on
//! deletion); everything else only reads.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use stratus_common::crd::Cluster;

use crate::client::WorkerCluster;

#[derive(Default)]
pub struct Clusterset {
    inner: RwLock<HashMap<String, Arc<WorkerCluster>>>,
}

impl Clusterset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered cluster names
    pub fn list(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("clusterset lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Look up a cluster by name
    pub fn get(&self, name: &str) -> Option<Arc<WorkerCluster>> {
        self.inner
            .read()
            .expect("clusterset lock poisoned")
            .get(name)
            .cloned()
    }

    /// Insert or replace an entry
    pub fn set(&self, worker: Arc<WorkerCluster>) {
        self.inner
            .write()
            .expect("clusterset lock poisoned")
            .insert(worker.name().to_string(), worker);
    }

    /// Evict an entry; subsequent lookups report not-found
    pub fn forget(&self, name: &str) {
        self.inner
            .write()
            .expect("clusterset lock poisoned")
            .remove(name);
    }

    /// Register a Cluster resource, rebuilding the entry only when its
    /// kubeconfig content actually changed. A resourceVersion bump alone
    /// keeps the existing (warm) entry.
    pub fn observe(&self, resource: &Cluster) -> Arc<WorkerCluster> {
        let name = resource.metadata.name.clone().unwrap_or_default();
        if let Some(existing) = self.get(&name) {
            if !existing.kubeconfig_changed(resource) {
                return existing;
            }
            info!(cluster = %name, "kubeconfig changed, rebuilding worker cluster entry");
        }
        let worker = WorkerCluster::new(resource);
        self.set(worker.clone());
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::crd::ClusterSpec;

    fn cluster(name: &str, kube_config: &str) -> Cluster {
        let mut c = Cluster::new(
            name,
            ClusterSpec {
                kube_config: kube_config.to_string(),
                ..Default::default()
            },
        );
        c.metadata.name = Some(name.to_string());
        c
    }

    #[test]
    fn observe_then_get() {
        let set = Clusterset::new();
        assert!(set.get("worker-1").is_none());
        set.observe(&cluster("worker-1", "blob-a"));
        assert!(set.get("worker-1").is_some());
        assert_eq!(set.list(), vec!["worker-1".to_string()]);
    }

    #[test]
    fn observe_keeps_entry_when_kubeconfig_unchanged() {
        let set = Clusterset::new();
        let first = set.observe(&cluster("worker-1", "blob-a"));
        let second = set.observe(&cluster("worker-1", "blob-a"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn observe_rebuilds_on_kubeconfig_change() {
        let set = Clusterset::new();
        let first = set.observe(&cluster("worker-1", "blob-a"));
        let second = set.observe(&cluster("worker-1", "blob-b"));
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.kubeconfig_changed(&cluster("worker-1", "blob-b")));
    }

    #[test]
    fn forget_evicts() {
        let set = Clusterset::new();
        set.observe(&cluster("worker-1", "blob-a"));
        set.forget("worker-1");
        assert!(set.get("worker-1").is_none());
    }
}
