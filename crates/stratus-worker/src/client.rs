//! Per-cluster client bundle.
//!
//! A `WorkerCluster` wraps the kubeconfig blob stored on a Cluster
//! resource and lazily derives everything else on first access: the kube
//! client, API-group discovery, and the reflector-backed object store.
//! Discovery results are cached and only discarded by `reset()`, so
//! capability checks cost one round-trip per client lifetime, not one
//! per reconcile.

use std::sync::Arc;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use stratus_common::crd::Cluster;
use stratus_common::{Error, Result};

use crate::store::ClusterStore;

/// API group served by Gateway API CRDs; absent on clusters without them
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

#[derive(Default)]
struct Inner {
    client: Option<Client>,
    api_groups: Option<Vec<String>>,
    store: Option<Arc<ClusterStore>>,
}

/// Lazily-initialized access to one worker cluster
pub struct WorkerCluster {
    name: String,
    kube_config: String,
    inner: Mutex<Inner>,
}

impl WorkerCluster {
    pub fn new(resource: &Cluster) -> Arc<Self> {
        Arc::new(Self {
            name: resource.metadata.name.clone().unwrap_or_default(),
            kube_config: resource.spec.kube_config.clone(),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the given Cluster resource carries a different credential
    /// blob than the one this bundle was built from
    pub fn kubeconfig_changed(&self, resource: &Cluster) -> bool {
        self.kube_config != resource.spec.kube_config
    }

    /// The kube client for this cluster, built on first access.
    ///
    /// kube-rs multiplexes every API group over one client, so this is
    /// the only connection the bundle ever establishes.
    pub async fn client(&self) -> Result<Client> {
        let mut inner = self.inner.lock().await;
        if let Some(client) = &inner.client {
            return Ok(client.clone());
        }
        let client = self.build_client().await?;
        inner.client = Some(client.clone());
        Ok(client)
    }

    async fn build_client(&self) -> Result<Client> {
        let kubeconfig = Kubeconfig::from_yaml(&self.kube_config)
            .map_err(|e| Error::cluster_unavailable(&self.name, format!("invalid kubeconfig: {e}")))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::cluster_unavailable(&self.name, format!("kubeconfig rejected: {e}"))
            })?;
        config.connect_timeout = Some(Duration::from_secs(10));
        config.read_timeout = Some(Duration::from_secs(30));
        let client = Client::try_from(config)
            .map_err(|e| Error::cluster_unavailable(&self.name, format!("client build: {e}")))?;
        debug!(cluster = %self.name, "worker cluster client established");
        Ok(client)
    }

    /// Names of the API groups served by the cluster, cached after the
    /// first discovery round-trip
    pub async fn api_groups(&self) -> Result<Vec<String>> {
        {
            let inner = self.inner.lock().await;
            if let Some(groups) = &inner.api_groups {
                return Ok(groups.clone());
            }
        }
        // Discovery outside the lock; a racing duplicate is harmless.
        let client = self.client().await?;
        let group_list = client.list_api_groups().await?;
        let groups: Vec<String> = group_list.groups.into_iter().map(|g| g.name).collect();
        let mut inner = self.inner.lock().await;
        inner.api_groups = Some(groups.clone());
        Ok(groups)
    }

    /// Client for Gateway API objects, or `None` when the cluster does
    /// not serve the Gateway API group. `None` means the capability is
    /// absent, not that something failed.
    pub async fn gateway_client(&self) -> Result<Option<Client>> {
        let groups = self.api_groups().await?;
        if !groups.iter().any(|g| g == GATEWAY_API_GROUP) {
            warn!(cluster = %self.name, "Gateway API not installed, skipping gateway resources");
            return Ok(None);
        }
        Ok(Some(self.client().await?))
    }

    /// Reflector-backed object store for this cluster, started on first
    /// access and shared by every reconcile thereafter
    pub async fn store(&self) -> Result<Arc<ClusterStore>> {
        {
            let inner = self.inner.lock().await;
            if let Some(store) = &inner.store {
                return Ok(store.clone());
            }
        }
        let client = self.client().await?;
        let store = ClusterStore::start(&self.name, client).await?;
        let mut inner = self.inner.lock().await;
        Ok(inner.store.get_or_insert(store).clone())
    }

    /// Discard every cached client, discovery result, and store, forcing
    /// lazy re-derivation on next access
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
        debug!(cluster = %self.name, "worker cluster caches reset");
    }
}
