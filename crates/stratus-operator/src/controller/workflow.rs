//! Workflow controller.
//!
//! A Pending workflow spawns a one-shot privileged builder pod in the
//! worker cluster that clones the git source and runs the build script.
//! Building polls the pod until it terminates, then the workflow settles
//! into Succeeded or Failed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, Pod, PodSpec, SecretEnvSource, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use stratus_common::apply;
use stratus_common::crd::condition_types::{BUILDER_POD_READY, SPACE_READY};
use stratus_common::crd::{
    Space, Workflow, WorkflowPhase, WorkflowStatus, WORKFLOW_FINALIZER,
};
use stratus_common::labels::{
    LABEL_TRUE, OWNED_LABEL_KEY, SPACE_LABEL_KEY, WORKFLOW_LABEL_KEY,
};
use stratus_common::{Error, Result};
use stratus_worker::Clusterset;

use crate::controller::{Outcome, REQUEUE_STEADY, REQUEUE_WARMUP};

const DEFAULT_BUILDER_IMAGE: &str = "docker:27-dind";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Master-cluster operations used by the Workflow reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowKubeClient: Send + Sync {
    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Option<Workflow>>;

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow>;

    /// Patch status if it differs from the live object's status
    async fn patch_workflow_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WorkflowStatus,
    ) -> Result<()>;

    async fn get_space(&self, name: &str) -> Result<Option<Space>>;
}

/// Worker-cluster operations used by the Workflow reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowWorker: Send + Sync {
    async fn apply_builder_pod(&self, pod: Pod) -> Result<()>;
    async fn delete_builder_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Pod phase string, or `None` when the pod does not exist
    async fn builder_pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// Resolves worker operations for a cluster name; `None` until the
/// Cluster reconciler has registered the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowWorkerFactory: Send + Sync {
    async fn worker(&self, cluster: &str) -> Result<Option<Arc<dyn WorkflowWorker>>>;
}

// =============================================================================
// Real implementations
// =============================================================================

pub struct WorkflowKubeClientImpl {
    client: Client,
}

impl WorkflowKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkflowKubeClient for WorkflowKubeClientImpl {
    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Option<Workflow>> {
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        let namespace = workflow.namespace().unwrap_or_default();
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), &namespace);
        apply::apply(&api, workflow).await
    }

    async fn patch_workflow_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WorkflowStatus,
    ) -> Result<()> {
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        if let Some(live) = api.get_opt(name).await? {
            if live.status.as_ref() == Some(status) {
                debug!(workflow = %name, "status unchanged, skipping patch");
                return Ok(());
            }
        }
        let value = serde_json::to_value(status)
            .map_err(|e| Error::serialization_of("WorkflowStatus", e.to_string()))?;
        apply::patch_status(&api, name, value).await?;
        Ok(())
    }

    async fn get_space(&self, name: &str) -> Result<Option<Space>> {
        let api: Api<Space> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

pub struct WorkflowWorkerImpl {
    client: Client,
}

#[async_trait]
impl WorkflowWorker for WorkflowWorkerImpl {
    async fn apply_builder_pod(&self, pod: Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        apply::apply(&api, &pod).await?;
        Ok(())
    }

    async fn delete_builder_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        apply::delete(&api, name).await
    }

    async fn builder_pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .and_then(|pod| pod.status)
            .and_then(|status| status.phase))
    }
}

pub struct RegistryWorkflowWorkerFactory {
    clusters: Arc<Clusterset>,
}

impl RegistryWorkflowWorkerFactory {
    pub fn new(clusters: Arc<Clusterset>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl WorkflowWorkerFactory for RegistryWorkflowWorkerFactory {
    async fn worker(&self, cluster: &str) -> Result<Option<Arc<dyn WorkflowWorker>>> {
        let Some(worker) = self.clusters.get(cluster) else {
            return Ok(None);
        };
        let client = worker.client().await?;
        Ok(Some(Arc::new(WorkflowWorkerImpl { client })))
    }
}

// =============================================================================
// Controller context
// =============================================================================

pub struct WorkflowContext {
    pub kube: Arc<dyn WorkflowKubeClient>,
    pub workers: Arc<dyn WorkflowWorkerFactory>,
}

impl WorkflowContext {
    pub fn from_client(client: Client, clusters: Arc<Clusterset>) -> Self {
        Self {
            kube: Arc::new(WorkflowKubeClientImpl::new(client)),
            workers: Arc::new(RegistryWorkflowWorkerFactory::new(clusters)),
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn WorkflowKubeClient>,
        workers: Arc<dyn WorkflowWorkerFactory>,
    ) -> Self {
        Self { kube, workers }
    }
}

// =============================================================================
// Builder pod
// =============================================================================

pub fn builder_pod_name(workflow: &str) -> String {
    format!("{workflow}-builder")
}

/// One-shot privileged pod running the build script against the git source
pub fn build_builder_pod(namespace: &str, workflow: &Workflow) -> Pod {
    let name = workflow.name_any();
    let mut env = vec![EnvVar {
        name: "GIT_REPOSITORY".to_string(),
        value: Some(workflow.spec.git.repository.clone()),
        ..Default::default()
    }];
    if let Some(branch) = &workflow.spec.git.branch {
        env.push(EnvVar {
            name: "GIT_BRANCH".to_string(),
            value: Some(branch.clone()),
            ..Default::default()
        });
    }
    let env_from = workflow.spec.git.credentials_secret.as_ref().map(|secret| {
        vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: secret.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        }]
    });
    let image = workflow
        .spec
        .builder_image
        .clone()
        .unwrap_or_else(|| DEFAULT_BUILDER_IMAGE.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(builder_pod_name(&name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string()),
                (SPACE_LABEL_KEY.to_string(), namespace.to_string()),
                (WORKFLOW_LABEL_KEY.to_string(), name),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "builder".to_string(),
                image: Some(image),
                command: Some(vec!["sh".to_string(), "-c".to_string()]),
                args: Some(vec![workflow.spec.build_script.clone()]),
                env: Some(env),
                env_from,
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

#[instrument(skip(workflow, ctx), fields(workflow = %workflow.name_any(), space = workflow.namespace()))]
pub async fn reconcile(workflow: Arc<Workflow>, ctx: Arc<WorkflowContext>) -> Result<Action> {
    let namespace = workflow.namespace().unwrap_or_default();
    let name = workflow.name_any();
    run(&namespace, &name, &ctx).await.map(Outcome::into_action)
}

async fn run(namespace: &str, name: &str, ctx: &WorkflowContext) -> Result<Outcome> {
    let Some(mut workflow) = ctx.kube.get_workflow(namespace, name).await? else {
        return Ok(Outcome::AwaitChange);
    };

    if workflow.check_or_set_required_labels() {
        debug!(workflow = %name, "healing required labels");
        ctx.kube.update_workflow(&workflow).await?;
        return Ok(Outcome::RequeueAfter(Duration::ZERO));
    }

    let space = ctx.kube.get_space(namespace).await?;

    if workflow.metadata.deletion_timestamp.is_some() {
        return finalize(namespace, name, &mut workflow, &space, ctx).await;
    }

    let space = match space {
        Some(s) if s.is_ready() => {
            workflow.set_condition(SPACE_READY, &Ok(()));
            s
        }
        other => {
            let reason = if other.is_none() { "not found" } else { "not ready" };
            workflow.set_condition(
                SPACE_READY,
                &Err(Error::validation_for(name, format!("space {namespace} is {reason}"))),
            );
            patch_status(ctx, namespace, name, &workflow).await?;
            return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
        }
    };

    let Some(worker) = ctx.workers.worker(&space.spec.cluster).await? else {
        debug!(workflow = %name, cluster = %space.spec.cluster, "cluster not registered yet");
        return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
    };

    if workflow.check_or_set_finalizer() {
        workflow = ctx.kube.update_workflow(&workflow).await?;
    }

    match workflow.phase() {
        WorkflowPhase::Pending => {
            info!(workflow = %name, "spawning builder pod");
            let spawned = worker
                .apply_builder_pod(build_builder_pod(namespace, &workflow))
                .await;
            workflow.set_condition(BUILDER_POD_READY, &spawned);
            spawned?;
            set_phase(&mut workflow, WorkflowPhase::Building);
            patch_status(ctx, namespace, name, &workflow).await?;
            Ok(Outcome::RequeueAfter(REQUEUE_WARMUP))
        }
        WorkflowPhase::Building => {
            let pod_phase = worker
                .builder_pod_phase(namespace, &builder_pod_name(name))
                .await?;
            match pod_phase.as_deref() {
                Some("Succeeded") => {
                    info!(workflow = %name, "build succeeded");
                    set_phase(&mut workflow, WorkflowPhase::Succeeded);
                    patch_status(ctx, namespace, name, &workflow).await?;
                    Ok(Outcome::AwaitChange)
                }
                Some("Failed") => {
                    info!(workflow = %name, "build failed");
                    set_phase(&mut workflow, WorkflowPhase::Failed);
                    patch_status(ctx, namespace, name, &workflow).await?;
                    Ok(Outcome::AwaitChange)
                }
                // Pending, Running, or pod not visible yet: keep polling.
                _ => Ok(Outcome::RequeueAfter(REQUEUE_STEADY)),
            }
        }
        WorkflowPhase::Succeeded | WorkflowPhase::Failed => Ok(Outcome::AwaitChange),
    }
}

fn set_phase(workflow: &mut Workflow, phase: WorkflowPhase) {
    workflow.status.get_or_insert_with(Default::default).phase = phase;
}

async fn patch_status(
    ctx: &WorkflowContext,
    namespace: &str,
    name: &str,
    workflow: &Workflow,
) -> Result<()> {
    let status = workflow.status.clone().unwrap_or_default();
    ctx.kube.patch_workflow_status(namespace, name, &status).await
}

/// Remove the builder pod if the worker is still reachable, then release
/// the finalizer
async fn finalize(
    namespace: &str,
    name: &str,
    workflow: &mut Workflow,
    space: &Option<Space>,
    ctx: &WorkflowContext,
) -> Result<Outcome> {
    if let Some(space) = space {
        if let Some(worker) = ctx.workers.worker(&space.spec.cluster).await? {
            worker
                .delete_builder_pod(namespace, &builder_pod_name(name))
                .await?;
        }
    }

    if let Some(finalizers) = &mut workflow.metadata.finalizers {
        finalizers.retain(|f| f != WORKFLOW_FINALIZER);
    }
    ctx.kube.update_workflow(workflow).await?;
    Ok(Outcome::AwaitChange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::crd::{GitSource, SpacePhase, SpaceSpec, SpaceStatus, WorkflowSpec};

    fn sample_workflow(name: &str) -> Workflow {
        let mut w = Workflow::new(
            name,
            WorkflowSpec {
                git: GitSource {
                    repository: "https://example.com/web.git".to_string(),
                    branch: Some("main".to_string()),
                    credentials_secret: Some("git-creds".to_string()),
                },
                build_script: "docker build -t web .".to_string(),
                ..Default::default()
            },
        );
        w.metadata.name = Some(name.to_string());
        w.metadata.namespace = Some("team-a".to_string());
        w.check_or_set_required_labels();
        w.check_or_set_finalizer();
        w
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

    fn factory_returning(worker: MockWorkflowWorker) -> MockWorkflowWorkerFactory {
        let worker: Arc<dyn WorkflowWorker> = Arc::new(worker);
        let mut factory = MockWorkflowWorkerFactory::new();
        factory
            .expect_worker()
            .returning(move |_| Ok(Some(worker.clone())));
        factory
    }

    #[test]
    fn builder_pod_runs_the_script() {
        let workflow = sample_workflow("build-web");
        let pod = build_builder_pod("team-a", &workflow);
        assert_eq!(pod.metadata.name.as_deref(), Some("build-web-builder"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some(DEFAULT_BUILDER_IMAGE));
        assert_eq!(container.args.as_ref().unwrap()[0], "docker build -t web .");
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "GIT_REPOSITORY"));
        assert!(env.iter().any(|e| e.name == "GIT_BRANCH"));
        let env_from = container.env_from.as_ref().unwrap();
        assert_eq!(env_from[0].secret_ref.as_ref().unwrap().name, "git-creds");
        assert_eq!(
            container.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
    }

    /// Story: a pending workflow spawns its builder pod and moves to
    /// Building on the warmup cadence
    #[tokio::test]
    async fn story_pending_workflow_spawns_builder() {
        let fetched = sample_workflow("build-web");
        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_workflow()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_patch_workflow_status()
            .withf(|_, _, status| {
                status.phase == WorkflowPhase::Building
                    && status
                        .conditions
                        .iter()
                        .any(|c| c.type_ == BUILDER_POD_READY && c.is_true())
            })
            .once()
            .returning(|_, _, _| Ok(()));

        let mut worker = MockWorkflowWorker::new();
        worker
            .expect_apply_builder_pod()
            .withf(|pod| pod.metadata.name.as_deref() == Some("build-web-builder"))
            .once()
            .returning(|_| Ok(()));

        let ctx = Arc::new(WorkflowContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));
        let action = reconcile(Arc::new(sample_workflow("build-web")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_WARMUP));
    }

    /// Story: a building workflow polls the pod and settles Succeeded when
    /// it terminates cleanly
    #[tokio::test]
    async fn story_building_workflow_succeeds() {
        let mut building = sample_workflow("build-web");
        building.status = Some(WorkflowStatus {
            phase: WorkflowPhase::Building,
            ..Default::default()
        });
        let fetched = building.clone();

        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_workflow()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_patch_workflow_status()
            .withf(|_, _, status| status.phase == WorkflowPhase::Succeeded)
            .once()
            .returning(|_, _, _| Ok(()));

        let mut worker = MockWorkflowWorker::new();
        worker
            .expect_builder_pod_phase()
            .returning(|_, _| Ok(Some("Succeeded".to_string())));

        let ctx = Arc::new(WorkflowContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));
        let action = reconcile(Arc::new(building), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a still-running build keeps polling on the steady cadence
    #[tokio::test]
    async fn story_running_build_keeps_polling() {
        let mut building = sample_workflow("build-web");
        building.status = Some(WorkflowStatus {
            phase: WorkflowPhase::Building,
            ..Default::default()
        });
        let fetched = building.clone();

        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_workflow()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));

        let mut worker = MockWorkflowWorker::new();
        worker
            .expect_builder_pod_phase()
            .returning(|_, _| Ok(Some("Running".to_string())));

        let ctx = Arc::new(WorkflowContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));
        let action = reconcile(Arc::new(building), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_STEADY));
    }

    /// Story: an unready space gates the build without touching the worker
    #[tokio::test]
    async fn story_unready_space_gates_build() {
        let fetched = sample_workflow("build-web");
        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_workflow()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| {
            let mut space = ready_space();
            space.status = None;
            Ok(Some(space))
        });
        kube.expect_patch_workflow_status()
            .withf(|_, _, status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.type_ == SPACE_READY && !c.is_true())
            })
            .once()
            .returning(|_, _, _| Ok(()));

        // No factory expectations: resolving a worker here would panic.
        let ctx = Arc::new(WorkflowContext::for_testing(
            Arc::new(kube),
            Arc::new(MockWorkflowWorkerFactory::new()),
        ));
        let action = reconcile(Arc::new(sample_workflow("build-web")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_WARMUP));
    }

    /// Story: deletion removes the builder pod and releases the finalizer
    #[tokio::test]
    async fn story_deletion_removes_builder_pod() {
        let mut deleting = sample_workflow("build-web");
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        let fetched = deleting.clone();

        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_workflow()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(ready_space())));
        kube.expect_update_workflow()
            .withf(|w| {
                w.metadata
                    .finalizers
                    .as_ref()
                    .map(|f| f.is_empty())
                    .unwrap_or(true)
            })
            .once()
            .returning(|w| Ok(w.clone()));

        let mut worker = MockWorkflowWorker::new();
        worker
            .expect_delete_builder_pod()
            .withf(|_, name| name == "build-web-builder")
            .once()
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(WorkflowContext::for_testing(
            Arc::new(kube),
            Arc::new(factory_returning(worker)),
        ));
        let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
