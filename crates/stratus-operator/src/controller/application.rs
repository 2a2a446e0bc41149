//! Application controller.
//!
//! Compiles an Application spec into its derived objects in the worker
//! cluster: an owner-anchor ServiceAccount, ConfigMaps for mounted
//! files, PVCs for mounted directories, exactly one workload object,
//! Services, HTTPRoutes, and an optional HPA. Derived objects carry the
//! application's stable labels, so garbage collection of renamed mounts
//! and ports is a set difference between what exists and what the
//! current spec derives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service, ServiceAccount};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use stratus_common::apply;
use stratus_common::crd::condition_types::{SPACE_READY, WORKLOAD_READY};
use stratus_common::crd::{
    Application, ApplicationPhase, ApplicationStatus, DesiredState, Space, WorkloadType,
    APPLICATION_FINALIZER,
};
use stratus_common::labels::application_selector;
use stratus_common::{Error, Result};
use stratus_worker::Clusterset;

use crate::controller::{Outcome, REQUEUE_STEADY, REQUEUE_WARMUP};
use crate::gateway::{build_http_route, http_route_resource};
use crate::workload::{self, WorkloadObservation};

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Master-cluster operations used by the Application reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationKubeClient: Send + Sync {
    async fn get_application(&self, namespace: &str, name: &str) -> Result<Option<Application>>;

    async fn update_application(&self, app: &Application) -> Result<Application>;

    /// Patch status if it differs from the live object's status
    async fn patch_application_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationStatus,
    ) -> Result<()>;

    async fn get_space(&self, name: &str) -> Result<Option<Space>>;
}

/// Worker-cluster operations used by the Application reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationWorker: Send + Sync {
    async fn apply_service_account(&self, account: ServiceAccount) -> Result<()>;
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_config_map(&self, config_map: ConfigMap) -> Result<()>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create the claim if absent; existing claims are left untouched
    async fn ensure_pvc(&self, pvc: PersistentVolumeClaim) -> Result<()>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_service(&self, service: Service) -> Result<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_deployment(&self, deployment: Deployment) -> Result<()>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_stateful_set(&self, stateful_set: StatefulSet) -> Result<()>;
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_job(&self, job: Job) -> Result<()>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_cron_job(&self, cron_job: CronJob) -> Result<()>;
    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_hpa(&self, hpa: HorizontalPodAutoscaler) -> Result<()>;
    async fn delete_hpa(&self, namespace: &str, name: &str) -> Result<()>;

    /// Apply an HTTPRoute; `false` when the cluster does not serve the
    /// Gateway API group
    async fn apply_http_route(&self, route: DynamicObject) -> Result<bool>;
    /// Delete every HTTPRoute carrying the application's labels
    async fn delete_http_routes(&self, namespace: &str, app: &str) -> Result<()>;

    /// Names of existing objects carrying the application's labels
    async fn config_map_names(&self, namespace: &str, app: &str) -> Result<Vec<String>>;
    async fn service_names(&self, namespace: &str, app: &str) -> Result<Vec<String>>;
    async fn pvc_names(&self, namespace: &str, app: &str) -> Result<Vec<String>>;

    async fn observe_workload(
        &self,
        workload_type: WorkloadType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadObservation>>;
}

/// Resolves worker operations for a cluster name; `None` until the
/// Cluster reconciler has registered the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationWorkerFactory: Send + Sync {
    async fn worker(&self, cluster: &str) -> Result<Option<Arc<dyn ApplicationWorker>>>;
}

// =============================================================================
// Real implementations
// =============================================================================

pub struct ApplicationKubeClientImpl {
    client: Client,
}

impl ApplicationKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApplicationKubeClient for ApplicationKubeClientImpl {
    async fn get_application(&self, namespace: &str, name: &str) -> Result<Option<Application>> {
        let api: Api<Application> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_application(&self, app: &Application) -> Result<Application> {
        let namespace = app.namespace().unwrap_or_default();
        let api: Api<Application> = Api::namespaced(self.client.clone(), &namespace);
        apply::apply(&api, app).await
    }

    async fn patch_application_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationStatus,
    ) -> Result<()> {
        let api: Api<Application> = Api::namespaced(self.client.clone(), namespace);
        if let Some(live) = api.get_opt(name).await? {
            if live.status.as_ref() == Some(status) {
                debug!(app = %name, "status unchanged, skipping patch");
                return Ok(());
            }
        }
        let value = serde_json::to_value(status)
            .map_err(|e| Error::serialization_of("ApplicationStatus", e.to_string()))?;
        apply::patch_status(&api, name, value).await?;
        Ok(())
    }

    async fn get_space(&self, name: &str) -> Result<Option<Space>> {
        let api: Api<Space> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

macro_rules! namespaced_apply {
    ($self:ident, $obj:ident, $kind:ty) => {{
        let namespace = $obj.namespace().unwrap_or_default();
        let api: Api<$kind> = Api::namespaced($self.client.clone(), &namespace);
        apply::apply(&api, &$obj).await.map(|_| ())
    }};
}

macro_rules! namespaced_delete {
    ($self:ident, $namespace:ident, $name:ident, $kind:ty) => {{
        let api: Api<$kind> = Api::namespaced($self.client.clone(), $namespace);
        apply::delete(&api, $name).await
    }};
}

pub struct ApplicationWorkerImpl {
    client: Client,
}

impl ApplicationWorkerImpl {
    async fn labeled_names<K>(&self, namespace: &str, app: &str) -> Result<Vec<String>>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&application_selector(app));
        Ok(api.list(&params).await?.items.iter().map(|o| o.name_any()).collect())
    }
}

#[async_trait]
impl ApplicationWorker for ApplicationWorkerImpl {
    async fn apply_service_account(&self, account: ServiceAccount) -> Result<()> {
        namespaced_apply!(self, account, ServiceAccount)
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, ServiceAccount)
    }

    async fn apply_config_map(&self, config_map: ConfigMap) -> Result<()> {
        namespaced_apply!(self, config_map, ConfigMap)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, ConfigMap)
    }

    async fn ensure_pvc(&self, pvc: PersistentVolumeClaim) -> Result<()> {
        let namespace = pvc.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        apply::apply_pvc(&api, &pvc).await.map(|_| ())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, PersistentVolumeClaim)
    }

    async fn apply_service(&self, service: Service) -> Result<()> {
        namespaced_apply!(self, service, Service)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, Service)
    }

    async fn apply_deployment(&self, deployment: Deployment) -> Result<()> {
        namespaced_apply!(self, deployment, Deployment)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, Deployment)
    }

    async fn apply_stateful_set(&self, stateful_set: StatefulSet) -> Result<()> {
        namespaced_apply!(self, stateful_set, StatefulSet)
    }

    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, StatefulSet)
    }

    async fn apply_job(&self, job: Job) -> Result<()> {
        namespaced_apply!(self, job, Job)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, Job)
    }

    async fn apply_cron_job(&self, cron_job: CronJob) -> Result<()> {
        namespaced_apply!(self, cron_job, CronJob)
    }

    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, CronJob)
    }

    async fn apply_hpa(&self, hpa: HorizontalPodAutoscaler) -> Result<()> {
        namespaced_apply!(self, hpa, HorizontalPodAutoscaler)
    }

    async fn delete_hpa(&self, namespace: &str, name: &str) -> Result<()> {
        namespaced_delete!(self, namespace, name, HorizontalPodAutoscaler)
    }

    async fn apply_http_route(&self, route: DynamicObject) -> Result<bool> {
        let namespace = route.namespace().unwrap_or_default();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &http_route_resource());
        match apply::apply(&api, &route).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_http_routes(&self, namespace: &str, app: &str) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &http_route_resource());
        let params = ListParams::default().labels(&application_selector(app));
        match api.delete_collection(&DeleteParams::default(), &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn config_map_names(&self, namespace: &str, app: &str) -> Result<Vec<String>> {
        self.labeled_names::<ConfigMap>(namespace, app).await
    }

    async fn service_names(&self, namespace: &str, app: &str) -> Result<Vec<String>> {
        self.labeled_names::<Service>(namespace, app).await
    }

    async fn pvc_names(&self, namespace: &str, app: &str) -> Result<Vec<String>> {
        self.labeled_names::<PersistentVolumeClaim>(namespace, app).await
    }

    async fn observe_workload(
        &self,
        workload_type: WorkloadType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadObservation>> {
        match workload_type {
            WorkloadType::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                Ok(api.get_opt(name).await?.map(|d| {
                    let status = d.status.unwrap_or_default();
                    WorkloadObservation {
                        replicas: status.replicas.unwrap_or(0),
                        ready: status.ready_replicas.unwrap_or(0),
                    }
                }))
            }
            WorkloadType::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                Ok(api.get_opt(name).await?.map(|s| {
                    let status = s.status.unwrap_or_default();
                    WorkloadObservation {
                        replicas: status.replicas,
                        ready: status.ready_replicas.unwrap_or(0),
                    }
                }))
            }
            WorkloadType::Job => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                Ok(api.get_opt(name).await?.map(|j| {
                    let status = j.status.unwrap_or_default();
                    let active = status.active.unwrap_or(0);
                    let succeeded = status.succeeded.unwrap_or(0);
                    WorkloadObservation {
                        replicas: active + succeeded,
                        ready: succeeded,
                    }
                }))
            }
            WorkloadType::CronJob => {
                let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
                Ok(api
                    .get_opt(name)
                    .await?
                    .map(|_| WorkloadObservation { replicas: 0, ready: 0 }))
            }
        }
    }
}

pub struct RegistryApplicationWorkerFactory {
    clusters: Arc<Clusterset>,
}

impl RegistryApplicationWorkerFactory {
    pub fn new(clusters: Arc<Clusterset>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl ApplicationWorkerFactory for RegistryApplicationWorkerFactory {
    async fn worker(&self, cluster: &str) -> Result<Option<Arc<dyn ApplicationWorker>>> {
        let Some(worker) = self.clusters.get(cluster) else {
            return Ok(None);
        };
        let client = worker.client().await?;
        Ok(Some(Arc::new(ApplicationWorkerImpl { client })))
    }
}

// =============================================================================
// Controller context
// =============================================================================

pub struct ApplicationContext {
    pub kube: Arc<dyn ApplicationKubeClient>,
    pub workers: Arc<dyn ApplicationWorkerFactory>,
}

impl ApplicationContext {
    pub fn from_client(client: Client, clusters: Arc<Clusterset>) -> Self {
        Self {
            kube: Arc::new(ApplicationKubeClientImpl::new(client)),
            workers: Arc::new(RegistryApplicationWorkerFactory::new(clusters)),
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ApplicationKubeClient>,
        workers: Arc<dyn ApplicationWorkerFactory>,
    ) -> Self {
        Self { kube, workers }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

#[instrument(skip(app, ctx), fields(app = %app.name_any(), space = app.namespace()))]
pub async fn reconcile(app: Arc<Application>, ctx: Arc<ApplicationContext>) -> Result<Action> {
    let namespace = app.namespace().unwrap_or_default();
    let name = app.name_any();
    run(&namespace, &name, &ctx).await.map(Outcome::into_action)
}

async fn run(namespace: &str, name: &str, ctx: &ApplicationContext) -> Result<Outcome> {
    let Some(mut app) = ctx.kube.get_application(namespace, name).await? else {
        return Ok(Outcome::AwaitChange);
    };

    let space = ctx.kube.get_space(namespace).await?;

    if app.metadata.deletion_timestamp.is_some() {
        return finalize(namespace, name, &mut app, &space, ctx).await;
    }

    // Space gating: nothing is projected until the enclosing space is
    // Ready on its target cluster.
    let space = match space {
        Some(s) if s.is_ready() => {
            app.set_condition(SPACE_READY, &Ok(()));
            s
        }
        other => {
            let reason = if other.is_none() { "not found" } else { "not ready" };
            app.set_condition(
                SPACE_READY,
                &Err(Error::validation_for(name, format!("space {namespace} is {reason}"))),
            );
            set_phase(&mut app, ApplicationPhase::Pending);
            patch_status(ctx, namespace, name, &app).await?;
            return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
        }
    };

    let Some(worker) = ctx.workers.worker(&space.spec.cluster).await? else {
        debug!(app = %name, cluster = %space.spec.cluster, "cluster not registered yet");
        return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
    };

    if app.check_or_set_required_labels() {
        debug!(app = %name, "healing required labels");
        ctx.kube.update_application(&app).await?;
        return Ok(Outcome::RequeueAfter(Duration::ZERO));
    }

    if app.check_or_set_finalizer() {
        app = ctx.kube.update_application(&app).await?;
    }

    let derived = ensure_derived(namespace, name, &app, worker.as_ref()).await;
    app.set_condition(WORKLOAD_READY, &derived);
    if let Err(e) = derived {
        patch_status(ctx, namespace, name, &app).await?;
        return Err(e);
    }

    let phase = observe_phase(namespace, name, &app, worker.as_ref()).await?;
    let settled = matches!(phase, ApplicationPhase::Running | ApplicationPhase::Stopped);
    let edition = app.edition().map(str::to_string);
    app.status.get_or_insert_with(Default::default).edition = edition;
    set_phase(&mut app, phase);
    patch_status(ctx, namespace, name, &app).await?;

    Ok(Outcome::RequeueAfter(if settled {
        REQUEUE_STEADY
    } else {
        REQUEUE_WARMUP
    }))
}

fn set_phase(app: &mut Application, phase: ApplicationPhase) {
    app.status.get_or_insert_with(Default::default).phase = phase;
}

async fn patch_status(
    ctx: &ApplicationContext,
    namespace: &str,
    name: &str,
    app: &Application,
) -> Result<()> {
    let status = app.status.clone().unwrap_or_default();
    ctx.kube.patch_application_status(namespace, name, &status).await
}

/// Bring every derived object in line with the spec, collecting stale
/// siblings first so renames do not leak objects
async fn ensure_derived(
    namespace: &str,
    name: &str,
    app: &Application,
    worker: &dyn ApplicationWorker,
) -> Result<()> {
    worker.apply_service_account(workload::owner_anchor(app)).await?;

    let existing = worker.config_map_names(namespace, name).await?;
    for stale in workload::stale(&existing, workload::desired_config_map_names(app)) {
        info!(app = %name, config_map = %stale, "removing stale config map");
        worker.delete_config_map(namespace, &stale).await?;
    }
    let existing = worker.service_names(namespace, name).await?;
    for stale in workload::stale(&existing, workload::desired_service_names(app)) {
        info!(app = %name, service = %stale, "removing stale service");
        worker.delete_service(namespace, &stale).await?;
    }
    let existing = worker.pvc_names(namespace, name).await?;
    for stale in workload::stale(&existing, workload::desired_pvc_names(app)) {
        info!(app = %name, pvc = %stale, "removing stale pvc");
        worker.delete_pvc(namespace, &stale).await?;
    }

    for config_map in workload::config_maps(app) {
        worker.apply_config_map(config_map).await?;
    }
    for pvc in workload::pvcs(app) {
        worker.ensure_pvc(pvc).await?;
    }

    ensure_workload(namespace, name, app, worker).await?;

    match workload::hpa(app) {
        Some(hpa) => worker.apply_hpa(hpa).await?,
        None => worker.delete_hpa(namespace, name).await?,
    }

    for service in workload::services(app) {
        worker.apply_service(service).await?;
    }

    ensure_http_routes(namespace, name, app, worker).await
}

/// Apply the workload object matching the spec type and delete the other
/// three kinds so a type change never leaves two workloads running
async fn ensure_workload(
    namespace: &str,
    name: &str,
    app: &Application,
    worker: &dyn ApplicationWorker,
) -> Result<()> {
    match app.spec.type_ {
        WorkloadType::Deployment => worker.apply_deployment(workload::deployment(app)).await?,
        WorkloadType::StatefulSet => worker.apply_stateful_set(workload::stateful_set(app)).await?,
        WorkloadType::Job => worker.apply_job(workload::job(app)).await?,
        WorkloadType::CronJob => worker.apply_cron_job(workload::cron_job(app)).await?,
    }
    if app.spec.type_ != WorkloadType::Deployment {
        worker.delete_deployment(namespace, name).await?;
    }
    if app.spec.type_ != WorkloadType::StatefulSet {
        worker.delete_stateful_set(namespace, name).await?;
    }
    if app.spec.type_ != WorkloadType::Job {
        worker.delete_job(namespace, name).await?;
    }
    if app.spec.type_ != WorkloadType::CronJob {
        worker.delete_cron_job(namespace, name).await?;
    }
    Ok(())
}

async fn ensure_http_routes(
    namespace: &str,
    name: &str,
    app: &Application,
    worker: &dyn ApplicationWorker,
) -> Result<()> {
    for port in &app.spec.ports {
        let service = workload::service_name(name, port.number);
        for binding in &port.gateways {
            let Some(route) = build_http_route(namespace, name, &service, port, binding) else {
                continue;
            };
            if !worker.apply_http_route(route).await? {
                debug!(app = %name, "cluster has no Gateway API, skipping http routes");
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn observe_phase(
    namespace: &str,
    name: &str,
    app: &Application,
    worker: &dyn ApplicationWorker,
) -> Result<ApplicationPhase> {
    match app.spec.type_ {
        WorkloadType::Deployment | WorkloadType::StatefulSet => {
            let observed = worker
                .observe_workload(app.spec.type_, namespace, name)
                .await?;
            Ok(workload::compute_phase(
                app.spec.desired_state,
                app.desired_replicas(),
                observed,
            ))
        }
        // Batch workloads report Running once their object exists.
        WorkloadType::Job | WorkloadType::CronJob => Ok(match app.spec.desired_state {
            DesiredState::Running => ApplicationPhase::Running,
            DesiredState::Stopped => ApplicationPhase::Stopped,
        }),
    }
}

/// Tear down every derived object, then release the finalizer. PVCs are
/// deleted with the rest; data outliving its application is not a goal.
async fn finalize(
    namespace: &str,
    name: &str,
    app: &mut Application,
    space: &Option<Space>,
    ctx: &ApplicationContext,
) -> Result<Outcome> {
    let worker = match space {
        // Space already gone: the worker namespace went with it.
        None => None,
        Some(space) => ctx.workers.worker(&space.spec.cluster).await?,
    };

    if let Some(worker) = worker {
        info!(app = %name, "removing derived objects");
        worker.delete_deployment(namespace, name).await?;
        worker.delete_stateful_set(namespace, name).await?;
        worker.delete_job(namespace, name).await?;
        worker.delete_cron_job(namespace, name).await?;
        worker.delete_hpa(namespace, name).await?;
        worker.delete_http_routes(namespace, name).await?;
        for service in worker.service_names(namespace, name).await? {
            worker.delete_service(namespace, &service).await?;
        }
        for config_map in worker.config_map_names(namespace, name).await? {
            worker.delete_config_map(namespace, &config_map).await?;
        }
        for pvc in worker.pvc_names(namespace, name).await? {
            worker.delete_pvc(namespace, &pvc).await?;
        }
        worker
            .delete_service_account(namespace, &workload::owner_anchor_name(name))
            .await?;
    }

    if let Some(finalizers) = &mut app.metadata.finalizers {
        finalizers.retain(|f| f != APPLICATION_FINALIZER);
    }
    ctx.kube.update_application(app).await?;
    Ok(Outcome::AwaitChange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::crd::{
        ApplicationSpec, Autoscaler, MountFile, SpacePhase, SpaceSpec, SpaceStatus,
    };

    fn sample_app(name: &str) -> Application {
        let mut a = Application::new(
            name,
            ApplicationSpec {
                image: "nginx:1.27".to_string(),
                replicas: 2,
                mount_files: vec![MountFile {
                    name: "config".to_string(),
                    path: "/etc/app/config.yaml".to_string(),
                    mode: None,
                    content: "key: value".to_string(),
                }],
                ..Default::default()
            },
        );
        a.metadata.name = Some(name.to_string());
        a.metadata.namespace = Some("team-a".to_string());
        a.check_or_set_required_labels();
        a.check_or_set_finalizer();
        a
    }

    fn ready_space() -> Space {
        let mut s = Space::new(
            "team-a",
            SpaceSpec {
                cluster: "worker-1".to_string(),
                ..Default::default()
            },
        );
        s.metadata.name = Some("team-a".to_string());
        s.status = Some(SpaceStatus {
            phase: SpacePhase::Ready,
            ..Default::default()
        });
        s
    }

    fn factory_returning(worker: MockApplicationWorker) -> MockApplicationWorkerFactory {
        let worker: Arc<dyn ApplicationWorker> = Arc::new(worker);
        let mut factory = MockApplicationWorkerFactory::new();
        factory
            .expect_worker()
            .returning(move |_| Ok(Some(worker.clone())));
        factory
    }

    /// Worker mock that accepts any ensure call; deletes of the other
    /// workload kinds are expected, an apply of the wrong kind is not
    fn permissive_worker() -> MockApplicationWorker {
        let mut worker = MockApplicationWorker::new();
        worker.expect_apply_service_account().returning(|_| Ok(()));
        worker.expect_config_map_names().returning(|_, _| Ok(vec![]));
        worker.expect_service_names().returning(|_, _| Ok(vec![]));
        worker.expect_pvc_names().returning(|_, _| Ok(vec![]));
        worker.expect_apply_config_map().returning(|_| Ok(()));
        worker.expect_apply_service().returning(|_| Ok(()));
        worker.expect_delete_stateful_set().returning(|_, _| Ok(()));
        worker.expect_delete_job().returning(|_, _| Ok(()));
        worker.expect_delete_cron_job().returning(|_, _| Ok(()));
        worker.expect_delete_hpa().returning(|_, _| Ok(()));
        worker
    }

    /// Story: an application in a space that is not ready yet stays Pending
    /// and never touches the worker cluster
    #[tokio::test]
    async fn story_unready_space_gates_reconcile() {
        let fetched = sample_app("web");
        let mut kube = MockApplicationKubeClient::new();
        kube.expect_get_application()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| {
            let mut space = ready_space();
            space.status = None;
            Ok(Some(space))
        });
        kube.expect_patch_application_status()
            .withf(|_, _, status| {
                status.phase == ApplicationPhase::Pending
                    && status
                        .conditions
                        .iter()
                        .any(|c| c.type_ == SPACE_READY && !c.is_true())
            })
            .once()
            .returning(|_, _, _| Ok(()));

        // No factory expectations: resolving a worker here would panic.
        let ctx = Arc::new(ApplicationContext::for_testing(
            Arc::new(kube),
            Arc::new(MockApplicationWorkerFactory::new()),
        ));

        let action = reconcile(Arc::new(sample_app("web")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_WARMUP));
    }

    /// Story: a running deployment reaches Running and settles into the
    /// steady requeue cadence, with the other workload kinds deleted
    #[tokio::test]
    async fn story_deployment_reaches_running() {
        let fetched = sample_app("web");
        let mut kube = MockApplicationKubeClient::new();
        kube.expect_get_application()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_patch_application_status()
            .withf(|_, _, status| {
                status.phase == ApplicationPhase::Running
                    && status.edition.is_some()
                    && status.conditions.iter().any(|c| c.type_ == WORKLOAD_READY && c.is_true())
            })
            .once()
            .returning(|_, _, _| Ok(()));

        let mut worker = permissive_worker();
        worker
            .expect_apply_deployment()
            .withf(|d| d.spec.as_ref().unwrap().replicas == Some(2))
            .once()
            .returning(|_| Ok(()));
        worker
            .expect_observe_workload()
            .returning(|_, _, _| Ok(Some(WorkloadObservation { replicas: 2, ready: 2 })));

        let ctx = Arc::new(ApplicationContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));

        let action = reconcile(Arc::new(sample_app("web")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_STEADY));
    }

    /// Story: while replicas are still coming up the app reports Starting
    /// and polls on the warmup cadence
    #[tokio::test]
    async fn story_starting_deployment_polls_quickly() {
        let fetched = sample_app("web");
        let mut kube = MockApplicationKubeClient::new();
        kube.expect_get_application()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_patch_application_status()
            .withf(|_, _, status| status.phase == ApplicationPhase::Starting)
            .once()
            .returning(|_, _, _| Ok(()));

        let mut worker = permissive_worker();
        worker.expect_apply_deployment().returning(|_| Ok(()));
        worker
            .expect_observe_workload()
            .returning(|_, _, _| Ok(Some(WorkloadObservation { replicas: 2, ready: 1 })));

        let ctx = Arc::new(ApplicationContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));

        let action = reconcile(Arc::new(sample_app("web")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_WARMUP));
    }

    /// Story: renamed mounts leave stale config maps behind; the set
    /// difference removes exactly those
    #[tokio::test]
    async fn story_stale_config_maps_are_collected() {
        let fetched = sample_app("web");
        let mut kube = MockApplicationKubeClient::new();
        kube.expect_get_application()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_patch_application_status().returning(|_, _, _| Ok(()));

        // Built by hand: the permissive helper's unbounded listing
        // expectation would shadow the one below.
        let mut worker = MockApplicationWorker::new();
        worker.expect_apply_service_account().returning(|_| Ok(()));
        // Live cluster still has a config map for the old mount name.
        worker
            .expect_config_map_names()
            .returning(|_, _| Ok(vec!["cm-web-config".to_string(), "cm-web-old".to_string()]));
        worker
            .expect_delete_config_map()
            .withf(|_, name| name == "cm-web-old")
            .once()
            .returning(|_, _| Ok(()));
        worker.expect_service_names().returning(|_, _| Ok(vec![]));
        worker.expect_pvc_names().returning(|_, _| Ok(vec![]));
        worker.expect_apply_config_map().returning(|_| Ok(()));
        worker.expect_apply_service().returning(|_| Ok(()));
        worker.expect_apply_deployment().returning(|_| Ok(()));
        worker.expect_delete_stateful_set().returning(|_, _| Ok(()));
        worker.expect_delete_job().returning(|_, _| Ok(()));
        worker.expect_delete_cron_job().returning(|_, _| Ok(()));
        worker.expect_delete_hpa().returning(|_, _| Ok(()));
        worker
            .expect_observe_workload()
            .returning(|_, _, _| Ok(Some(WorkloadObservation { replicas: 2, ready: 2 })));

        let ctx = Arc::new(ApplicationContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));

        reconcile(Arc::new(sample_app("web")), ctx).await.unwrap();
    }

    /// Story: switching on the autoscaler applies an HPA instead of
    /// deleting one
    #[tokio::test]
    async fn story_autoscaler_applies_hpa() {
        let mut autoscaled = sample_app("web");
        autoscaled.spec.autoscaler = Some(Autoscaler {
            min_replicas: 2,
            max_replicas: 8,
            target_cpu_utilization_percentage: 70,
        });
        let fetched = autoscaled.clone();

        let mut kube = MockApplicationKubeClient::new();
        kube.expect_get_application()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_patch_application_status().returning(|_, _, _| Ok(()));

        let mut worker = MockApplicationWorker::new();
        worker.expect_apply_service_account().returning(|_| Ok(()));
        worker.expect_config_map_names().returning(|_, _| Ok(vec![]));
        worker.expect_service_names().returning(|_, _| Ok(vec![]));
        worker.expect_pvc_names().returning(|_, _| Ok(vec![]));
        worker.expect_apply_config_map().returning(|_| Ok(()));
        worker.expect_apply_service().returning(|_| Ok(()));
        worker.expect_apply_deployment().returning(|_| Ok(()));
        worker.expect_delete_stateful_set().returning(|_, _| Ok(()));
        worker.expect_delete_job().returning(|_, _| Ok(()));
        worker.expect_delete_cron_job().returning(|_, _| Ok(()));
        worker
            .expect_apply_hpa()
            .withf(|hpa| hpa.spec.as_ref().unwrap().max_replicas == 8)
            .once()
            .returning(|_| Ok(()));
        worker
            .expect_observe_workload()
            .returning(|_, _, _| Ok(Some(WorkloadObservation { replicas: 2, ready: 2 })));

        let ctx = Arc::new(ApplicationContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));

        reconcile(Arc::new(autoscaled), ctx).await.unwrap();
    }

    /// Story: deleting an application removes every derived object and
    /// releases the finalizer
    #[tokio::test]
    async fn story_deletion_removes_derived_objects() {
        let mut deleting = sample_app("web");
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        let fetched = deleting.clone();

        let mut kube = MockApplicationKubeClient::new();
        kube.expect_get_application()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_update_application()
            .withf(|app| {
                app.metadata
                    .finalizers
                    .as_ref()
                    .map(|f| f.is_empty())
                    .unwrap_or(true)
            })
            .once()
            .returning(|a| Ok(a.clone()));

        let mut worker = MockApplicationWorker::new();
        worker.expect_delete_deployment().once().returning(|_, _| Ok(()));
        worker.expect_delete_stateful_set().returning(|_, _| Ok(()));
        worker.expect_delete_job().returning(|_, _| Ok(()));
        worker.expect_delete_cron_job().returning(|_, _| Ok(()));
        worker.expect_delete_hpa().returning(|_, _| Ok(()));
        worker.expect_delete_http_routes().once().returning(|_, _| Ok(()));
        worker
            .expect_service_names()
            .returning(|_, _| Ok(vec!["web-port-80".to_string()]));
        worker.expect_delete_service().once().returning(|_, _| Ok(()));
        worker
            .expect_config_map_names()
            .returning(|_, _| Ok(vec!["cm-web-config".to_string()]));
        worker.expect_delete_config_map().once().returning(|_, _| Ok(()));
        worker.expect_pvc_names().returning(|_, _| Ok(vec![]));
        worker
            .expect_delete_service_account()
            .withf(|_, name| name == "web-application-owner")
            .once()
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(ApplicationContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));

        let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: deleting an application whose space is already gone just
    /// releases the finalizer
    #[tokio::test]
    async fn story_deletion_without_space_releases_finalizer() {
        let mut deleting = sample_app("web");
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        let fetched = deleting.clone();

        let mut kube = MockApplicationKubeClient::new();
        kube.expect_get_application()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(None));
        kube.expect_update_application()
            .once()
            .returning(|a| Ok(a.clone()));

        let ctx = Arc::new(ApplicationContext::for_testing(
            Arc::new(kube),
            Arc::new(MockApplicationWorkerFactory::new()),
        ));

        let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
