//! Cached object stores for one worker cluster.
//!
//! Status computation reads actual cluster state on every pass; routing
//! those reads through the live API server would not scale with
//! reconciler concurrency. Each store is a reflector over platform-owned
//! objects (label-filtered watch), started once per cluster and shared.
//! Readers tolerate results lagging real state by one watch event.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use stratus_common::labels::{owned_selector, APPLICATION_LABEL_KEY};
use stratus_common::{Error, Result};

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Informer-backed listers for the native kinds the reconcilers read
pub struct ClusterStore {
    cluster: String,
    deployments: Store<Deployment>,
    stateful_sets: Store<StatefulSet>,
    pods: Store<Pod>,
    services: Store<Service>,
    hpas: Store<HorizontalPodAutoscaler>,
    config_maps: Store<ConfigMap>,
    secrets: Store<Secret>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterStore {
    /// Start watches for every cached kind and wait (bounded) until all
    /// caches report synced.
    pub async fn start(cluster: &str, client: Client) -> Result<Arc<Self>> {
        let (deployments, t1) = spawn_watch::<Deployment>(&client, cluster);
        let (stateful_sets, t2) = spawn_watch::<StatefulSet>(&client, cluster);
        let (pods, t3) = spawn_watch::<Pod>(&client, cluster);
        let (services, t4) = spawn_watch::<Service>(&client, cluster);
        let (hpas, t5) = spawn_watch::<HorizontalPodAutoscaler>(&client, cluster);
        let (config_maps, t6) = spawn_watch::<ConfigMap>(&client, cluster);
        let (secrets, t7) = spawn_watch::<Secret>(&client, cluster);

        let store = Self {
            cluster: cluster.to_string(),
            deployments,
            stateful_sets,
            pods,
            services,
            hpas,
            config_maps,
            secrets,
            tasks: vec![t1, t2, t3, t4, t5, t6, t7],
        };

        store.wait_ready(&store.deployments).await?;
        store.wait_ready(&store.stateful_sets).await?;
        store.wait_ready(&store.pods).await?;
        store.wait_ready(&store.services).await?;
        store.wait_ready(&store.hpas).await?;
        store.wait_ready(&store.config_maps).await?;
        store.wait_ready(&store.secrets).await?;

        info!(cluster = %cluster, "object store caches synced");
        Ok(Arc::new(store))
    }

    async fn wait_ready<K>(&self, reader: &Store<K>) -> Result<()>
    where
        K: Resource + Clone + 'static,
        K::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        tokio::time::timeout(CACHE_SYNC_TIMEOUT, reader.wait_until_ready())
            .await
            .map_err(|_| {
                Error::cluster_unavailable(&self.cluster, "object store cache sync timed out")
            })?
            .map_err(|e| Error::internal_with_context(e.to_string(), "store"))
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.deployments.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn stateful_set(&self, namespace: &str, name: &str) -> Option<Arc<StatefulSet>> {
        self.stateful_sets.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn hpa(&self, namespace: &str, name: &str) -> Option<Arc<HorizontalPodAutoscaler>> {
        self.hpas.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        self.config_maps.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets.get(&ObjectRef::new(name).within(namespace))
    }

    /// Cached ConfigMap names belonging to one application
    pub fn config_map_names_for(&self, namespace: &str, app: &str) -> Vec<String> {
        names_for(&self.config_maps, namespace, app)
    }

    /// Cached Service names belonging to one application
    pub fn service_names_for(&self, namespace: &str, app: &str) -> Vec<String> {
        names_for(&self.services, namespace, app)
    }
}

impl Drop for ClusterStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn names_for<K>(store: &Store<K>, namespace: &str, app: &str) -> Vec<String>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    store
        .state()
        .into_iter()
        .filter(|obj| {
            obj.meta().namespace.as_deref() == Some(namespace)
                && obj
                    .meta()
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(APPLICATION_LABEL_KEY))
                    .map(String::as_str)
                    == Some(app)
        })
        .filter_map(|obj| obj.meta().name.clone())
        .collect()
}

fn spawn_watch<K>(client: &Client, cluster: &str) -> (Store<K>, JoinHandle<()>)
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(client.clone());
    let (reader, writer) = reflector::store();
    let config = watcher::Config::default().labels(&owned_selector());
    let stream = reflector::reflector(writer, watcher(api, config));
    let cluster = cluster.to_string();
    let task = tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream.default_backoff().touched_objects());
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                warn!(cluster = %cluster, error = %e, "watch stream error");
            }
        }
    });
    (reader, task)
}
