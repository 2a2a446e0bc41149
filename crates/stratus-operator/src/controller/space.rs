//! Space controller.
//!
//! A Space projects into a namespace of the same name in both the master
//! and its target worker cluster, plus an optional ResourceQuota and
//! LimitRange in the worker namespace. A pre-existing namespace that is
//! not labeled platform-owned is never adopted; that is an ownership
//! violation requiring operator intervention.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LimitRange, LimitRangeItem, Namespace, ResourceQuota, ResourceQuotaSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use stratus_common::apply;
use stratus_common::crd::condition_types::{
    CLUSTER_READY, LIMIT_RANGE_READY, NAMESPACE_READY, RESOURCE_QUOTA_READY,
};
use stratus_common::crd::status::delete_condition;
use stratus_common::crd::{
    Application, Cluster, ClusterPhase, HelmRepository, Space, SpacePhase, SpaceStatus, Workflow,
    SPACE_FINALIZER,
};
use stratus_common::labels::{is_platform_owned, space_required_labels};
use stratus_common::{Error, Result};
use stratus_worker::Clusterset;

use crate::controller::{Outcome, REQUEUE_STEADY, REQUEUE_WARMUP};

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Master-cluster operations used by the Space reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpaceKubeClient: Send + Sync {
    async fn get_space(&self, name: &str) -> Result<Option<Space>>;

    async fn update_space(&self, space: &Space) -> Result<Space>;

    /// Patch status if it differs from the live object's status
    async fn patch_space_status(&self, name: &str, status: &SpaceStatus) -> Result<()>;

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>>;

    async fn list_applications(&self, namespace: &str) -> Result<Vec<Application>>;

    /// Namespace handling in the master cluster
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    async fn apply_namespace(&self, namespace: Namespace) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Delete every child custom resource in the space's namespace
    async fn delete_children(&self, namespace: &str) -> Result<()>;
}

/// Worker-cluster operations used by the Space reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpaceWorker: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    async fn apply_namespace(&self, namespace: Namespace) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn get_resource_quota(&self, namespace: &str, name: &str)
        -> Result<Option<ResourceQuota>>;
    async fn apply_resource_quota(&self, quota: ResourceQuota) -> Result<()>;
    async fn delete_resource_quota(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_limit_range(&self, namespace: &str, name: &str) -> Result<Option<LimitRange>>;
    async fn apply_limit_range(&self, limit_range: LimitRange) -> Result<()>;
    async fn delete_limit_range(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Resolves worker operations for a cluster name; `None` until the
/// Cluster reconciler has registered the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpaceWorkerFactory: Send + Sync {
    async fn worker(&self, cluster: &str) -> Result<Option<Arc<dyn SpaceWorker>>>;
}

// =============================================================================
// Real implementations
// =============================================================================

pub struct SpaceKubeClientImpl {
    client: Client,
}

impl SpaceKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SpaceKubeClient for SpaceKubeClientImpl {
    async fn get_space(&self, name: &str) -> Result<Option<Space>> {
        let api: Api<Space> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_space(&self, space: &Space) -> Result<Space> {
        let api: Api<Space> = Api::all(self.client.clone());
        apply::apply(&api, space).await
    }

    async fn patch_space_status(&self, name: &str, status: &SpaceStatus) -> Result<()> {
        let api: Api<Space> = Api::all(self.client.clone());
        if let Some(live) = api.get_opt(name).await? {
            if live.status.as_ref() == Some(status) {
                debug!(space = %name, "status unchanged, skipping patch");
                return Ok(());
            }
        }
        let value = serde_json::to_value(status)
            .map_err(|e| Error::serialization_of("SpaceStatus", e.to_string()))?;
        apply::patch_status(&api, name, value).await?;
        Ok(())
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_applications(&self, namespace: &str) -> Result<Vec<Application>> {
        let api: Api<Application> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn apply_namespace(&self, namespace: Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        apply::apply(&api, &namespace).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        apply::delete(&api, name).await
    }

    async fn delete_children(&self, namespace: &str) -> Result<()> {
        let params = DeleteParams::default();
        let list = ListParams::default();
        let apps: Api<Application> = Api::namespaced(self.client.clone(), namespace);
        apps.delete_collection(&params, &list).await?;
        let repos: Api<HelmRepository> = Api::namespaced(self.client.clone(), namespace);
        repos.delete_collection(&params, &list).await?;
        let workflows: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        workflows.delete_collection(&params, &list).await?;
        Ok(())
    }
}

pub struct SpaceWorkerImpl {
    client: Client,
}

#[async_trait]
impl SpaceWorker for SpaceWorkerImpl {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn apply_namespace(&self, namespace: Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        apply::apply(&api, &namespace).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        apply::delete(&api, name).await
    }

    async fn get_resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceQuota>> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_resource_quota(&self, quota: ResourceQuota) -> Result<()> {
        let namespace = quota.namespace().unwrap_or_default();
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), &namespace);
        apply::apply(&api, &quota).await?;
        Ok(())
    }

    async fn delete_resource_quota(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        apply::delete(&api, name).await
    }

    async fn get_limit_range(&self, namespace: &str, name: &str) -> Result<Option<LimitRange>> {
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_limit_range(&self, limit_range: LimitRange) -> Result<()> {
        let namespace = limit_range.namespace().unwrap_or_default();
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), &namespace);
        apply::apply(&api, &limit_range).await?;
        Ok(())
    }

    async fn delete_limit_range(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        apply::delete(&api, name).await
    }
}

pub struct RegistrySpaceWorkerFactory {
    clusters: Arc<Clusterset>,
}

impl RegistrySpaceWorkerFactory {
    pub fn new(clusters: Arc<Clusterset>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl SpaceWorkerFactory for RegistrySpaceWorkerFactory {
    async fn worker(&self, cluster: &str) -> Result<Option<Arc<dyn SpaceWorker>>> {
        let Some(worker) = self.clusters.get(cluster) else {
            return Ok(None);
        };
        let client = worker.client().await?;
        Ok(Some(Arc::new(SpaceWorkerImpl { client })))
    }
}

// =============================================================================
// Controller context
// =============================================================================

pub struct SpaceContext {
    pub kube: Arc<dyn SpaceKubeClient>,
    pub workers: Arc<dyn SpaceWorkerFactory>,
}

impl SpaceContext {
    pub fn from_client(client: Client, clusters: Arc<Clusterset>) -> Self {
        Self {
            kube: Arc::new(SpaceKubeClientImpl::new(client)),
            workers: Arc::new(RegistrySpaceWorkerFactory::new(clusters)),
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn SpaceKubeClient>,
        workers: Arc<dyn SpaceWorkerFactory>,
    ) -> Self {
        Self { kube, workers }
    }
}

// =============================================================================
// Derived objects
// =============================================================================

pub fn resource_quota_name(space: &str) -> String {
    format!("{space}-quota")
}

pub fn limit_range_name(space: &str) -> String {
    format!("{space}-limit-range")
}

fn namespace_for(space: &Space) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: space.metadata.name.clone(),
            labels: space.metadata.labels.clone(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Map the declared quota into ResourceQuota hard limits using the
/// `requests.*` / `limits.*` key convention
fn build_resource_quota(space: &Space) -> ResourceQuota {
    let name = space.name_any();
    let mut hard: BTreeMap<String, Quantity> = BTreeMap::new();
    if let Some(rq) = &space.spec.resource_quota {
        if let Some(requests) = &rq.requests {
            for (key, value) in requests {
                hard.insert(format!("requests.{key}"), value.clone());
            }
        }
        if let Some(limits) = &rq.limits {
            for (key, value) in limits {
                hard.insert(format!("limits.{key}"), value.clone());
            }
        }
    }
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(resource_quota_name(&name)),
            namespace: Some(name.clone()),
            labels: Some(space_required_labels(&name)),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Default per-container limits enforced through a LimitRange
fn build_limit_range(space: &Space) -> LimitRange {
    let name = space.name_any();
    let mut default: BTreeMap<String, Quantity> = BTreeMap::new();
    if let Some(lr) = &space.spec.limit_range {
        if let Some(cpu) = &lr.cpu {
            default.insert("cpu".to_string(), cpu.clone());
        }
        if let Some(memory) = &lr.memory {
            default.insert("memory".to_string(), memory.clone());
        }
    }
    LimitRange {
        metadata: ObjectMeta {
            name: Some(limit_range_name(&name)),
            namespace: Some(name.clone()),
            labels: Some(space_required_labels(&name)),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::LimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                default: Some(default),
                ..Default::default()
            }],
        }),
    }
}

fn quota_changed(current: &ResourceQuota, desired: &ResourceQuota) -> bool {
    if current.metadata.labels != desired.metadata.labels {
        return true;
    }
    let current_hard = current.spec.as_ref().and_then(|s| s.hard.as_ref());
    let desired_hard = desired.spec.as_ref().and_then(|s| s.hard.as_ref());
    current_hard != desired_hard
}

fn limit_range_changed(current: &LimitRange, desired: &LimitRange) -> bool {
    if current.metadata.labels != desired.metadata.labels {
        return true;
    }
    current.spec.as_ref().map(|s| &s.limits) != desired.spec.as_ref().map(|s| &s.limits)
}

// =============================================================================
// Reconciliation
// =============================================================================

#[instrument(skip(space, ctx), fields(space = %space.name_any()))]
pub async fn reconcile(space: Arc<Space>, ctx: Arc<SpaceContext>) -> Result<Action> {
    let name = space.name_any();
    run(&name, &ctx).await.map(Outcome::into_action)
}

async fn run(name: &str, ctx: &SpaceContext) -> Result<Outcome> {
    let Some(mut space) = ctx.kube.get_space(name).await? else {
        return Ok(Outcome::AwaitChange);
    };

    if space.check_or_set_required_labels() {
        debug!(space = %name, "healing required labels");
        ctx.kube.update_space(&space).await?;
        return Ok(Outcome::RequeueAfter(Duration::ZERO));
    }

    let cluster_name = space.spec.cluster.clone();

    // Deletion must progress even when the cluster is gone or not yet
    // registered, otherwise the finalizer deadlocks the cascade.
    if space.metadata.deletion_timestamp.is_some() {
        let worker = if ctx.kube.get_cluster(&cluster_name).await?.is_some() {
            ctx.workers.worker(&cluster_name).await?
        } else {
            None
        };
        return finalize(name, &mut space, ctx, worker.as_deref()).await;
    }

    // Cluster gating: the target cluster must exist and be connected
    // before anything is projected into it.
    let cluster_ready = match ctx.kube.get_cluster(&cluster_name).await? {
        None => Err(Error::validation_for_field(
            name,
            "spec.cluster",
            format!("cluster {cluster_name} not found"),
        )),
        Some(cluster) if cluster.phase() != ClusterPhase::Connected => Err(
            Error::cluster_unavailable(&cluster_name, "cluster is not connected"),
        ),
        Some(_) => Ok(()),
    };
    space.set_condition(CLUSTER_READY, &cluster_ready);
    if cluster_ready.is_err() {
        set_phase(&mut space, SpacePhase::NotReady);
        patch_status(ctx, name, &space).await?;
        return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
    }

    let Some(worker) = ctx.workers.worker(&cluster_name).await? else {
        debug!(space = %name, cluster = %cluster_name, "cluster not registered yet");
        return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
    };

    if space.check_or_set_finalizer() {
        space = ctx.kube.update_space(&space).await?;
    }

    // Namespaces on both sides. An unowned namespace is never adopted.
    let namespaces = ensure_namespaces(name, &space, ctx, worker.as_ref()).await;
    space.set_condition(NAMESPACE_READY, &namespaces);
    if let Err(e) = namespaces {
        set_phase(&mut space, SpacePhase::NotReady);
        patch_status(ctx, name, &space).await?;
        return Err(e);
    }

    ensure_quota(name, &mut space, worker.as_ref()).await?;
    ensure_limit_range(name, &mut space, worker.as_ref()).await?;

    let apps = ctx.kube.list_applications(name).await?;
    space.set_status_applications(apps.iter().map(|a| (a.name_any(), a.phase())));
    set_phase(&mut space, SpacePhase::Ready);
    patch_status(ctx, name, &space).await?;

    Ok(Outcome::RequeueAfter(REQUEUE_STEADY))
}

fn set_phase(space: &mut Space, phase: SpacePhase) {
    space.status.get_or_insert_with(Default::default).phase = phase;
}

async fn patch_status(ctx: &SpaceContext, name: &str, space: &Space) -> Result<()> {
    let status = space.status.clone().unwrap_or_default();
    ctx.kube.patch_space_status(name, &status).await
}

async fn ensure_namespaces(
    name: &str,
    space: &Space,
    ctx: &SpaceContext,
    worker: &dyn SpaceWorker,
) -> Result<()> {
    match ctx.kube.get_namespace(name).await? {
        None => {
            info!(space = %name, "creating master namespace");
            ctx.kube.apply_namespace(namespace_for(space)).await?;
        }
        Some(ns) if !is_platform_owned(ns.metadata.labels.as_ref()) => {
            return Err(Error::ownership_violation(name, "master"));
        }
        Some(_) => {}
    }
    match worker.get_namespace(name).await? {
        None => {
            info!(space = %name, cluster = %space.spec.cluster, "creating worker namespace");
            worker.apply_namespace(namespace_for(space)).await?;
        }
        Some(ns) if !is_platform_owned(ns.metadata.labels.as_ref()) => {
            return Err(Error::ownership_violation(name, &space.spec.cluster));
        }
        Some(_) => {}
    }
    Ok(())
}

async fn ensure_quota(name: &str, space: &mut Space, worker: &dyn SpaceWorker) -> Result<()> {
    let quota_name = resource_quota_name(name);
    match &space.spec.resource_quota {
        Some(_) => {
            let desired = build_resource_quota(space);
            let needs_apply = match worker.get_resource_quota(name, &quota_name).await? {
                Some(current) => quota_changed(&current, &desired),
                None => true,
            };
            let result = if needs_apply {
                worker.apply_resource_quota(desired).await
            } else {
                debug!(space = %name, "resource quota unchanged");
                Ok(())
            };
            space.set_condition(RESOURCE_QUOTA_READY, &result);
            result
        }
        None => {
            worker.delete_resource_quota(name, &quota_name).await?;
            if let Some(status) = &mut space.status {
                delete_condition(&mut status.conditions, RESOURCE_QUOTA_READY);
            }
            Ok(())
        }
    }
}

async fn ensure_limit_range(name: &str, space: &mut Space, worker: &dyn SpaceWorker) -> Result<()> {
    let lr_name = limit_range_name(name);
    match &space.spec.limit_range {
        Some(_) => {
            let desired = build_limit_range(space);
            let needs_apply = match worker.get_limit_range(name, &lr_name).await? {
                Some(current) => limit_range_changed(&current, &desired),
                None => true,
            };
            let result = if needs_apply {
                worker.apply_limit_range(desired).await
            } else {
                debug!(space = %name, "limit range unchanged");
                Ok(())
            };
            space.set_condition(LIMIT_RANGE_READY, &result);
            result
        }
        None => {
            worker.delete_limit_range(name, &lr_name).await?;
            if let Some(status) = &mut space.status {
                delete_condition(&mut status.conditions, LIMIT_RANGE_READY);
            }
            Ok(())
        }
    }
}

/// Tear down both namespaces (or just the managed objects inside an
/// unowned one), delete child custom resources, then release the
/// finalizer.
async fn finalize(
    name: &str,
    space: &mut Space,
    ctx: &SpaceContext,
    worker: Option<&dyn SpaceWorker>,
) -> Result<Outcome> {
    info!(space = %name, "recycling space");
    ctx.kube.delete_children(name).await?;

    match worker {
        Some(worker) => recycle_worker_namespace(name, worker).await?,
        None => warn!(space = %name, "cluster unavailable, skipping worker-side recycle"),
    }

    match ctx.kube.get_namespace(name).await? {
        Some(ns) if is_platform_owned(ns.metadata.labels.as_ref()) => {
            ctx.kube.delete_namespace(name).await?;
        }
        Some(_) => {
            warn!(space = %name, "master namespace not platform-owned, leaving it in place");
        }
        None => {}
    }

    if let Some(finalizers) = &mut space.metadata.finalizers {
        finalizers.retain(|f| f != SPACE_FINALIZER);
    }
    ctx.kube.update_space(space).await?;
    Ok(Outcome::AwaitChange)
}

async fn recycle_worker_namespace(name: &str, worker: &dyn SpaceWorker) -> Result<()> {
    match worker.get_namespace(name).await? {
        Some(ns) if is_platform_owned(ns.metadata.labels.as_ref()) => {
            worker.delete_namespace(name).await
        }
        Some(_) => {
            // Not ours to delete; only remove the objects this Space put there.
            warn!(space = %name, "worker namespace not platform-owned, removing managed objects only");
            worker
                .delete_resource_quota(name, &resource_quota_name(name))
                .await?;
            worker.delete_limit_range(name, &limit_range_name(name)).await
        }
        None => Ok(()),
    }
}
