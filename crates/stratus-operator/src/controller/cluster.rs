//! Cluster controller.
//!
//! Registers worker clusters in the shared registry, probes their health
//! on a fixed cadence, seeds the built-in admin Space and extension
//! chart repository, provisions the shared Gateway per GatewayClass,
//! and aggregates child Space/Extension phases into status. A deleted
//! Cluster is detected by re-fetch returning not-found; its registry
//! entry is evicted and its Spaces cascade-deleted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams};
use kube::config::Kubeconfig;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use stratus_common::apply;
use stratus_common::crd::condition_types::{GATEWAY_READY, PING_PASSED};
use stratus_common::crd::{
    Cluster, ClusterPhase, ClusterStatus, Extension, HelmRepository, HelmRepositorySpec, Space,
    SpaceSpec,
};
use stratus_common::labels::{builtin_resource_labels, cluster_selector, SYSTEM_NAMESPACE};
use stratus_common::{Error, Result};
use stratus_worker::{Clusterset, WorkerCluster};

use crate::controller::{Outcome, REQUEUE_STEADY};
use crate::gateway;

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Master-cluster operations used by the Cluster reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterKubeClient: Send + Sync {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>>;

    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Patch status if it differs from the live object's status
    async fn patch_cluster_status(&self, name: &str, status: &ClusterStatus) -> Result<()>;

    async fn list_spaces_of(&self, cluster: &str) -> Result<Vec<Space>>;

    async fn list_extensions_of(&self, cluster: &str) -> Result<Vec<Extension>>;

    /// Cascade-delete every Space targeting the cluster
    async fn delete_spaces_of(&self, cluster: &str) -> Result<()>;

    /// Create the built-in admin Space if absent; the first connected
    /// cluster claims it
    async fn ensure_builtin_space(&self, cluster: &str) -> Result<()>;

    /// Create the built-in extension chart repository if absent
    async fn ensure_builtin_helm_repository(&self) -> Result<()>;
}

/// Worker-cluster probes and provisioning for one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Health-check the API server
    async fn ping(&self) -> Result<()>;

    /// Server git version
    async fn version(&self) -> Result<String>;

    /// Create the platform system namespace if absent
    async fn ensure_system_namespace(&self) -> Result<()>;

    /// Installed GatewayClass names, or `None` when the cluster does not
    /// serve the Gateway API group
    async fn gateway_classes(&self) -> Result<Option<Vec<String>>>;

    /// Apply the shared Gateway for one class
    async fn apply_gateway(&self, class: &str, domains: &[String]) -> Result<()>;
}

/// Resolves the probe for a Cluster resource, registering it in the
/// cluster registry as a side effect
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProbeFactory: Send + Sync {
    async fn probe(&self, resource: &Cluster) -> Arc<dyn ClusterProbe>;
}

// =============================================================================
// Real implementations
// =============================================================================

pub struct ClusterKubeClientImpl {
    client: Client,
}

impl ClusterKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterKubeClient for ClusterKubeClientImpl {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        apply::apply(&api, cluster).await
    }

    async fn patch_cluster_status(&self, name: &str, status: &ClusterStatus) -> Result<()> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        if let Some(live) = api.get_opt(name).await? {
            if live.status.as_ref() == Some(status) {
                debug!(cluster = %name, "status unchanged, skipping patch");
                return Ok(());
            }
        }
        let value = serde_json::to_value(status)
            .map_err(|e| Error::serialization_of("ClusterStatus", e.to_string()))?;
        apply::patch_status(&api, name, value).await?;
        Ok(())
    }

    async fn list_spaces_of(&self, cluster: &str) -> Result<Vec<Space>> {
        let api: Api<Space> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&cluster_selector(cluster));
        Ok(api.list(&params).await?.items)
    }

    async fn list_extensions_of(&self, cluster: &str) -> Result<Vec<Extension>> {
        let api: Api<Extension> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|e| e.spec.cluster == cluster)
            .collect())
    }

    async fn delete_spaces_of(&self, cluster: &str) -> Result<()> {
        let api: Api<Space> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&cluster_selector(cluster));
        api.delete_collection(&DeleteParams::default(), &params)
            .await?;
        Ok(())
    }

    async fn ensure_builtin_space(&self, cluster: &str) -> Result<()> {
        let api: Api<Space> = Api::all(self.client.clone());
        if api.get_opt(SYSTEM_NAMESPACE).await?.is_none() {
            apply::apply(&api, &builtin_space(cluster)).await?;
            info!(space = SYSTEM_NAMESPACE, cluster = %cluster, "created built-in admin space");
        }
        Ok(())
    }

    async fn ensure_builtin_helm_repository(&self) -> Result<()> {
        use k8s_openapi::api::core::v1::Namespace;
        // The repository CR is namespaced, so the master-side system
        // namespace must exist before it.
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        if namespaces.get_opt(SYSTEM_NAMESPACE).await?.is_none() {
            let ns = Namespace {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(SYSTEM_NAMESPACE.to_string()),
                    labels: Some(builtin_resource_labels()),
                    ..Default::default()
                },
                ..Default::default()
            };
            apply::apply(&namespaces, &ns).await?;
        }
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        if api.get_opt(EXTENSION_REPOSITORY_NAME).await?.is_none() {
            apply::apply(&api, &builtin_extension_repository()).await?;
            info!(repository = EXTENSION_REPOSITORY_NAME, "created built-in extension repository");
        }
        Ok(())
    }
}

/// Name of the built-in repository serving extension charts
pub const EXTENSION_REPOSITORY_NAME: &str = "stratus-extension";

const EXTENSION_REPOSITORY_URL: &str = "https://charts.stratus.io/extensions";

/// Built-in admin Space projecting the system namespace into the cluster
fn builtin_space(cluster: &str) -> Space {
    let mut space = Space::new(
        SYSTEM_NAMESPACE,
        SpaceSpec {
            display_name: Some("System".to_string()),
            description: Some("Built-in space hosting platform add-ons".to_string()),
            cluster: cluster.to_string(),
            ..Default::default()
        },
    );
    space.metadata.name = Some(SYSTEM_NAMESPACE.to_string());
    space.metadata.labels = Some(builtin_resource_labels());
    space
}

/// Built-in chart repository Extensions install from
fn builtin_extension_repository() -> HelmRepository {
    let mut repository = HelmRepository::new(
        EXTENSION_REPOSITORY_NAME,
        HelmRepositorySpec {
            display_name: Some("Stratus Extensions".to_string()),
            url: EXTENSION_REPOSITORY_URL.to_string(),
            ..Default::default()
        },
    );
    repository.metadata.name = Some(EXTENSION_REPOSITORY_NAME.to_string());
    repository.metadata.namespace = Some(SYSTEM_NAMESPACE.to_string());
    repository.metadata.labels = Some(builtin_resource_labels());
    repository
}

pub struct WorkerClusterProbe {
    worker: Arc<WorkerCluster>,
}

#[async_trait]
impl ClusterProbe for WorkerClusterProbe {
    async fn ping(&self) -> Result<()> {
        let client = self.worker.client().await?;
        let request = http::Request::builder()
            .uri("/livez")
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context(e.to_string(), "ping"))?;
        let body = client
            .request_text(request)
            .await
            .map_err(|e| Error::cluster_unavailable(self.worker.name(), e.to_string()))?;
        if body.trim() == "ok" {
            Ok(())
        } else {
            Err(Error::cluster_unavailable(
                self.worker.name(),
                format!("livez returned {body:?}"),
            ))
        }
    }

    async fn version(&self) -> Result<String> {
        let client = self.worker.client().await?;
        let info = client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn ensure_system_namespace(&self) -> Result<()> {
        use k8s_openapi::api::core::v1::Namespace;
        let client = self.worker.client().await?;
        let api: Api<Namespace> = Api::all(client);
        if api.get_opt(SYSTEM_NAMESPACE).await?.is_none() {
            let ns = Namespace {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(SYSTEM_NAMESPACE.to_string()),
                    labels: Some(builtin_resource_labels()),
                    ..Default::default()
                },
                ..Default::default()
            };
            apply::apply(&api, &ns).await?;
            info!(cluster = %self.worker.name(), "created system namespace");
        }
        Ok(())
    }

    async fn gateway_classes(&self) -> Result<Option<Vec<String>>> {
        let Some(client) = self.worker.gateway_client().await? else {
            return Ok(None);
        };
        let api: Api<DynamicObject> = Api::all_with(client, &gateway::gateway_class_resource());
        let classes = api.list(&Default::default()).await?;
        Ok(Some(classes.items.iter().map(|c| c.name_any()).collect()))
    }

    async fn apply_gateway(&self, class: &str, domains: &[String]) -> Result<()> {
        let Some(client) = self.worker.gateway_client().await? else {
            return Ok(());
        };
        let desired = gateway::build_gateway(self.worker.name(), class, domains);
        let api: Api<DynamicObject> =
            Api::namespaced_with(client, SYSTEM_NAMESPACE, &gateway::gateway_resource());
        apply::apply(&api, &desired).await?;
        Ok(())
    }
}

/// Registers Cluster resources in the shared registry and hands out
/// probes backed by the registered entry
pub struct RegistryProbeFactory {
    clusters: Arc<Clusterset>,
}

impl RegistryProbeFactory {
    pub fn new(clusters: Arc<Clusterset>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl ClusterProbeFactory for RegistryProbeFactory {
    async fn probe(&self, resource: &Cluster) -> Arc<dyn ClusterProbe> {
        let worker = self.clusters.observe(resource);
        Arc::new(WorkerClusterProbe { worker })
    }
}

// =============================================================================
// Controller context
// =============================================================================

pub struct ClusterContext {
    pub kube: Arc<dyn ClusterKubeClient>,
    pub probes: Arc<dyn ClusterProbeFactory>,
    pub clusters: Arc<Clusterset>,
}

impl ClusterContext {
    pub fn from_client(client: Client, clusters: Arc<Clusterset>) -> Self {
        Self {
            kube: Arc::new(ClusterKubeClientImpl::new(client)),
            probes: Arc::new(RegistryProbeFactory::new(clusters.clone())),
            clusters,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ClusterKubeClient>,
        probes: Arc<dyn ClusterProbeFactory>,
    ) -> Self {
        Self {
            kube,
            probes,
            clusters: Arc::new(Clusterset::new()),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<ClusterContext>) -> Result<Action> {
    let name = cluster.name_any();
    run(&name, &ctx).await.map(Outcome::into_action)
}

async fn run(name: &str, ctx: &ClusterContext) -> Result<Outcome> {
    // The watch delivers the last-known object; re-fetch so deletion is
    // observed as not-found.
    let Some(mut cluster) = ctx.kube.get_cluster(name).await? else {
        info!(cluster = %name, "cluster deleted, evicting and cascading spaces");
        ctx.clusters.forget(name);
        ctx.kube.delete_spaces_of(name).await?;
        return Ok(Outcome::AwaitChange);
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        // No finalizer on Clusters; cleanup runs once the object is gone.
        return Ok(Outcome::AwaitChange);
    }

    if cluster.check_or_set_required_labels() {
        debug!(cluster = %name, "healing required labels");
        ctx.kube.update_cluster(&cluster).await?;
        return Ok(Outcome::RequeueAfter(Duration::ZERO));
    }

    let probe = ctx.probes.probe(&cluster).await;

    let ping = probe.ping().await;
    cluster.set_condition(PING_PASSED, &ping);
    if let Err(e) = &ping {
        warn!(cluster = %name, error = %e, "ping failed, marking disconnected");
        let status = cluster.status.get_or_insert_with(Default::default);
        status.phase = ClusterPhase::Disconnected;
        let status = status.clone();
        ctx.kube.patch_cluster_status(name, &status).await?;
        return Ok(Outcome::RequeueAfter(REQUEUE_STEADY));
    }

    probe.ensure_system_namespace().await?;
    ctx.kube.ensure_builtin_space(name).await?;
    ctx.kube.ensure_builtin_helm_repository().await?;
    let version = probe.version().await?;

    match probe.gateway_classes().await? {
        None => {
            // Gateway API not installed; the capability is absent, not broken.
            debug!(cluster = %name, "gateway api absent, skipping gateway provisioning");
        }
        Some(classes) => {
            let mut result = Ok(());
            for class in &classes {
                if let Err(e) = probe
                    .apply_gateway(class, &cluster.spec.wild_card_domains)
                    .await
                {
                    warn!(cluster = %name, class = %class, error = %e, "gateway apply failed");
                    result = Err(e);
                    break;
                }
            }
            cluster.set_condition(GATEWAY_READY, &result);
        }
    }

    let spaces = ctx.kube.list_spaces_of(name).await?;
    let extensions = ctx.kube.list_extensions_of(name).await?;
    cluster.set_status_spaces(spaces.iter().map(|s| (s.name_any(), s.phase())));
    cluster.set_status_extensions(extensions.iter().map(|e| (e.name_any(), e.phase())));

    let status = cluster.status.get_or_insert_with(Default::default);
    status.phase = ClusterPhase::Connected;
    status.server = server_from_kubeconfig(&cluster.spec.kube_config);
    status.version = Some(version);
    let status = status.clone();
    ctx.kube.patch_cluster_status(name, &status).await?;

    Ok(Outcome::RequeueAfter(REQUEUE_STEADY))
}

/// API server endpoint recorded in the credential blob
fn server_from_kubeconfig(kube_config: &str) -> Option<String> {
    let config = Kubeconfig::from_yaml(kube_config).ok()?;
    config.clusters.first()?.cluster.as_ref()?.server.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::crd::{ClusterSpec, ExtensionSpec, SpacePhase, SpaceSpec, SpaceStatus};

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
  - name: worker-1
    cluster:
      server: https://10.0.0.10:6443
contexts: []
users: []
"#;

    fn sample_cluster(name: &str) -> Cluster {
        let mut c = Cluster::new(
            name,
            ClusterSpec {
                kube_config: KUBECONFIG.to_string(),
                wild_card_domains: vec!["*.apps.example.com".to_string()],
                ..Default::default()
            },
        );
        c.metadata.name = Some(name.to_string());
        c.check_or_set_required_labels();
        c
    }

    fn ready_space(name: &str, cluster: &str) -> Space {
        let mut s = Space::new(
            name,
            SpaceSpec {
                cluster: cluster.to_string(),
                ..Default::default()
            },
        );
        s.metadata.name = Some(name.to_string());
        s.status = Some(SpaceStatus {
            phase: SpacePhase::Ready,
            ..Default::default()
        });
        s
    }

    fn healthy_probe() -> MockClusterProbe {
        let mut probe = MockClusterProbe::new();
        probe.expect_ping().returning(|| Ok(()));
        probe.expect_version().returning(|| Ok("v1.33.1".to_string()));
        probe.expect_ensure_system_namespace().returning(|| Ok(()));
        probe
    }

    fn factory_returning(probe: MockClusterProbe) -> MockClusterProbeFactory {
        let probe: Arc<dyn ClusterProbe> = Arc::new(probe);
        let mut factory = MockClusterProbeFactory::new();
        factory.expect_probe().returning(move |_| probe.clone());
        factory
    }

    /// Story: a deleted cluster is evicted from the registry and its
    /// spaces cascade-deleted
    #[tokio::test]
    async fn story_deleted_cluster_is_cleaned_up() {
        let mut kube = MockClusterKubeClient::new();
        kube.expect_get_cluster().returning(|_| Ok(None));
        kube.expect_delete_spaces_of()
            .withf(|c| c == "worker-1")
            .once()
            .returning(|_| Ok(()));

        let ctx = Arc::new(ClusterContext::for_testing(
            Arc::new(kube),
            Arc::new(MockClusterProbeFactory::new()),
        ));
        ctx.clusters.observe(&sample_cluster("worker-1"));

        let action = reconcile(Arc::new(sample_cluster("worker-1")), ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(ctx.clusters.get("worker-1").is_none());
    }

    /// Story: missing required labels are healed before anything else
    #[tokio::test]
    async fn story_labels_healed_before_probing() {
        let mut unlabeled = sample_cluster("worker-1");
        unlabeled.metadata.labels = None;
        let fetched = unlabeled.clone();

        let mut kube = MockClusterKubeClient::new();
        kube.expect_get_cluster()
            .returning(move |_| Ok(Some(fetched.clone())));
        kube.expect_update_cluster()
            .once()
            .returning(|c| Ok(c.clone()));

        // No probe expectations: touching the worker before labels settle
        // would panic the mock.
        let ctx = Arc::new(ClusterContext::for_testing(
            Arc::new(kube),
            Arc::new(MockClusterProbeFactory::new()),
        ));

        let action = reconcile(Arc::new(unlabeled), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));
    }

    /// Story: a failed ping marks the cluster Disconnected and keeps probing
    #[tokio::test]
    async fn story_ping_failure_marks_disconnected() {
        let fetched = sample_cluster("worker-1");
        let mut kube = MockClusterKubeClient::new();
        kube.expect_get_cluster()
            .returning(move |_| Ok(Some(fetched.clone())));
        kube.expect_patch_cluster_status()
            .withf(|_, status| {
                status.phase == ClusterPhase::Disconnected
                    && status
                        .conditions
                        .iter()
                        .any(|c| c.type_ == PING_PASSED && !c.is_true())
            })
            .once()
            .returning(|_, _| Ok(()));

        let mut probe = MockClusterProbe::new();
        probe
            .expect_ping()
            .returning(|| Err(Error::cluster_unavailable("worker-1", "connection refused")));

        let ctx = Arc::new(ClusterContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(probe)),
        ));

        let action = reconcile(Arc::new(sample_cluster("worker-1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_STEADY));
    }

    /// Story: a healthy cluster connects, provisions gateways per class,
    /// and aggregates child phases
    #[tokio::test]
    async fn story_healthy_cluster_connects() {
        let fetched = sample_cluster("worker-1");
        let mut kube = MockClusterKubeClient::new();
        kube.expect_get_cluster()
            .returning(move |_| Ok(Some(fetched.clone())));
        kube.expect_ensure_builtin_space()
            .withf(|c| c == "worker-1")
            .once()
            .returning(|_| Ok(()));
        kube.expect_ensure_builtin_helm_repository()
            .once()
            .returning(|| Ok(()));
        kube.expect_list_spaces_of()
            .returning(|c| Ok(vec![ready_space("team-a", c)]));
        kube.expect_list_extensions_of().returning(|_| {
            let mut e = Extension::new("velero", ExtensionSpec::default());
            e.metadata.name = Some("velero".to_string());
            Ok(vec![e])
        });
        kube.expect_patch_cluster_status()
            .withf(|_, status| {
                status.phase == ClusterPhase::Connected
                    && status.server.as_deref() == Some("https://10.0.0.10:6443")
                    && status.version.as_deref() == Some("v1.33.1")
                    && status.spaces.get("team-a") == Some(&SpacePhase::Ready)
                    && status.extension_count == 1
                    && status.conditions.iter().any(|c| c.type_ == GATEWAY_READY && c.is_true())
            })
            .once()
            .returning(|_, _| Ok(()));

        let mut probe = healthy_probe();
        probe
            .expect_gateway_classes()
            .returning(|| Ok(Some(vec!["nginx".to_string()])));
        probe
            .expect_apply_gateway()
            .withf(|class, domains| class == "nginx" && domains == ["*.apps.example.com"])
            .once()
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(ClusterContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(probe)),
        ));

        let action = reconcile(Arc::new(sample_cluster("worker-1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_STEADY));
    }

    /// Story: clusters without the Gateway API still connect; no gateway
    /// objects are attempted
    #[tokio::test]
    async fn story_gateway_capability_absent() {
        let fetched = sample_cluster("worker-1");
        let mut kube = MockClusterKubeClient::new();
        kube.expect_get_cluster()
            .returning(move |_| Ok(Some(fetched.clone())));
        kube.expect_ensure_builtin_space().returning(|_| Ok(()));
        kube.expect_ensure_builtin_helm_repository()
            .returning(|| Ok(()));
        kube.expect_list_spaces_of().returning(|_| Ok(vec![]));
        kube.expect_list_extensions_of().returning(|_| Ok(vec![]));
        kube.expect_patch_cluster_status()
            .withf(|_, status| {
                status.phase == ClusterPhase::Connected
                    && !status.conditions.iter().any(|c| c.type_ == GATEWAY_READY)
            })
            .once()
            .returning(|_, _| Ok(()));

        let mut probe = healthy_probe();
        probe.expect_gateway_classes().returning(|| Ok(None));

        let ctx = Arc::new(ClusterContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(probe)),
        ));

        let action = reconcile(Arc::new(sample_cluster("worker-1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_STEADY));
    }

    #[test]
    fn builtin_resources_are_labeled_and_placed() {
        let space = builtin_space("worker-1");
        assert_eq!(space.metadata.name.as_deref(), Some(SYSTEM_NAMESPACE));
        assert_eq!(space.spec.cluster, "worker-1");
        assert!(space
            .metadata
            .labels
            .unwrap()
            .contains_key(stratus_common::labels::BUILTIN_LABEL_KEY));

        let repository = builtin_extension_repository();
        assert_eq!(
            repository.metadata.name.as_deref(),
            Some(EXTENSION_REPOSITORY_NAME)
        );
        assert_eq!(
            repository.metadata.namespace.as_deref(),
            Some(SYSTEM_NAMESPACE)
        );
        assert!(repository.spec.url.starts_with("https://"));
    }

    #[test]
    fn server_parsed_from_kubeconfig() {
        assert_eq!(
            server_from_kubeconfig(KUBECONFIG).as_deref(),
            Some("https://10.0.0.10:6443")
        );
        assert!(server_from_kubeconfig("not yaml: [").is_none());
    }
}
