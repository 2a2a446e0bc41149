//! Extension controller.
//!
//! Extensions install cluster add-ons through the Helm CLI, so the
//! reconciler is a phase machine rather than a drift loop: Pending and
//! Failed attempt an install, Installed and Uninstalled hold until the
//! spec changes. The chart repository must be a HelmRepository in the
//! system namespace that has reached the Added phase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use stratus_common::apply;
use stratus_common::crd::condition_types::{
    CLUSTER_READY, HELM_CHART_INSTALLED, HELM_CHART_UNINSTALLED, HELM_REPOSITORY_ADDED,
    KUBE_APPLIED,
};
use stratus_common::crd::{
    Cluster, ClusterPhase, Extension, ExtensionPhase, ExtensionStatus, HelmRepository,
    HelmRepositoryPhase, InstallType, EXTENSION_FINALIZER,
};
use stratus_common::labels::SYSTEM_NAMESPACE;
use stratus_common::{Error, Result};

use crate::controller::{Outcome, REQUEUE_STEADY, REQUEUE_WARMUP};
use crate::helm::{HelmClient, HelmInstallRequest};

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Master-cluster operations used by the Extension reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExtensionKubeClient: Send + Sync {
    async fn get_extension(&self, name: &str) -> Result<Option<Extension>>;

    async fn update_extension(&self, extension: &Extension) -> Result<Extension>;

    /// Patch status if it differs from the live object's status
    async fn patch_extension_status(&self, name: &str, status: &ExtensionStatus) -> Result<()>;

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>>;

    /// Chart repository lookup in the system namespace
    async fn get_helm_repository(&self, name: &str) -> Result<Option<HelmRepository>>;
}

// =============================================================================
// Real implementation
// =============================================================================

pub struct ExtensionKubeClientImpl {
    client: Client,
}

impl ExtensionKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExtensionKubeClient for ExtensionKubeClientImpl {
    async fn get_extension(&self, name: &str) -> Result<Option<Extension>> {
        let api: Api<Extension> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_extension(&self, extension: &Extension) -> Result<Extension> {
        let api: Api<Extension> = Api::all(self.client.clone());
        apply::apply(&api, extension).await
    }

    async fn patch_extension_status(&self, name: &str, status: &ExtensionStatus) -> Result<()> {
        let api: Api<Extension> = Api::all(self.client.clone());
        if let Some(live) = api.get_opt(name).await? {
            if live.status.as_ref() == Some(status) {
                debug!(extension = %name, "status unchanged, skipping patch");
                return Ok(());
            }
        }
        let value = serde_json::to_value(status)
            .map_err(|e| Error::serialization_of("ExtensionStatus", e.to_string()))?;
        apply::patch_status(&api, name, value).await?;
        Ok(())
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_helm_repository(&self, name: &str) -> Result<Option<HelmRepository>> {
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        Ok(api.get_opt(name).await?)
    }
}

// =============================================================================
// Controller context
// =============================================================================

pub struct ExtensionContext {
    pub kube: Arc<dyn ExtensionKubeClient>,
    pub helm: Arc<dyn HelmClient>,
}

impl ExtensionContext {
    pub fn from_client(client: Client, helm: Arc<dyn HelmClient>) -> Self {
        Self {
            kube: Arc::new(ExtensionKubeClientImpl::new(client)),
            helm,
        }
    }

    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ExtensionKubeClient>, helm: Arc<dyn HelmClient>) -> Self {
        Self { kube, helm }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

#[instrument(skip(extension, ctx), fields(extension = %extension.name_any()))]
pub async fn reconcile(extension: Arc<Extension>, ctx: Arc<ExtensionContext>) -> Result<Action> {
    let name = extension.name_any();
    run(&name, &ctx).await.map(Outcome::into_action)
}

async fn run(name: &str, ctx: &ExtensionContext) -> Result<Outcome> {
    let Some(mut extension) = ctx.kube.get_extension(name).await? else {
        return Ok(Outcome::AwaitChange);
    };

    if extension.check_or_set_required_labels() {
        debug!(extension = %name, "healing required labels");
        ctx.kube.update_extension(&extension).await?;
        return Ok(Outcome::RequeueAfter(Duration::ZERO));
    }

    let cluster_name = extension.spec.cluster.clone();
    let cluster = ctx.kube.get_cluster(&cluster_name).await?;

    if extension.metadata.deletion_timestamp.is_some() {
        return finalize(name, &mut extension, &cluster, ctx).await;
    }

    let cluster = match cluster {
        Some(c) if c.phase() == ClusterPhase::Connected => {
            extension.set_condition(CLUSTER_READY, &Ok(()));
            c
        }
        Some(_) => {
            extension.set_condition(
                CLUSTER_READY,
                &Err(Error::cluster_unavailable(&cluster_name, "cluster is not connected")),
            );
            patch_status(ctx, name, &extension).await?;
            return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
        }
        None => {
            extension.set_condition(
                CLUSTER_READY,
                &Err(Error::validation_for_field(
                    name,
                    "spec.cluster",
                    format!("cluster {cluster_name} not found"),
                )),
            );
            patch_status(ctx, name, &extension).await?;
            return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
        }
    };

    if extension.check_or_set_finalizer() {
        extension = ctx.kube.update_extension(&extension).await?;
    }

    match extension.spec.install_type {
        InstallType::Helm => install_helm(name, &mut extension, &cluster, ctx).await,
        InstallType::KubeApply => {
            extension.set_condition(
                KUBE_APPLIED,
                &Err(Error::validation_for_field(
                    name,
                    "spec.installType",
                    "KubeApply installation is not supported",
                )),
            );
            set_phase(&mut extension, ExtensionPhase::Failed);
            patch_status(ctx, name, &extension).await?;
            Ok(Outcome::AwaitChange)
        }
    }
}

async fn install_helm(
    name: &str,
    extension: &mut Extension,
    cluster: &Cluster,
    ctx: &ExtensionContext,
) -> Result<Outcome> {
    let Some(helm) = extension.spec.helm.clone() else {
        return Err(Error::validation_for_field(
            name,
            "spec.helm",
            "helm coordinates are required for Helm installation",
        ));
    };

    // Installed and Uninstalled are terminal until the spec changes.
    match extension.phase() {
        ExtensionPhase::Installed | ExtensionPhase::Uninstalled => {
            return Ok(Outcome::AwaitChange)
        }
        ExtensionPhase::Pending | ExtensionPhase::Failed => {}
    }

    let repository = match ctx.kube.get_helm_repository(&helm.repository).await? {
        Some(repo) if repo.phase() == HelmRepositoryPhase::Added => {
            extension.set_condition(HELM_REPOSITORY_ADDED, &Ok(()));
            repo
        }
        other => {
            let reason = if other.is_none() { "not found" } else { "not added yet" };
            extension.set_condition(
                HELM_REPOSITORY_ADDED,
                &Err(Error::validation_for_field(
                    name,
                    "spec.helm.repository",
                    format!("repository {} is {reason}", helm.repository),
                )),
            );
            patch_status(ctx, name, extension).await?;
            return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
        }
    };

    // Aliases are per-operator-process state, so re-add before installing.
    ctx.helm
        .add_repository(&helm.repository, &repository.spec.url)
        .await?;

    let request = HelmInstallRequest {
        release: helm.name.clone(),
        repository: helm.repository.clone(),
        chart: helm.chart.clone(),
        version: helm.version.clone(),
        namespace: extension.spec.target_namespace.clone(),
        values: helm.values.clone(),
    };
    info!(extension = %name, chart = %helm.chart, "installing helm release");
    match ctx.helm.install(&cluster.spec.kube_config, &request).await {
        Ok(release) => {
            extension.set_condition(HELM_CHART_INSTALLED, &Ok(()));
            let status = extension.status.get_or_insert_with(Default::default);
            status.helm_release = Some(release);
            status.phase = ExtensionPhase::Installed;
            patch_status(ctx, name, extension).await?;
            Ok(Outcome::AwaitChange)
        }
        Err(e) => {
            let retryable = e.is_retryable();
            let failed: Result<()> = Err(e);
            extension.set_condition(HELM_CHART_INSTALLED, &failed);
            if retryable {
                patch_status(ctx, name, extension).await?;
                failed.map(|_| Outcome::AwaitChange)
            } else {
                set_phase(extension, ExtensionPhase::Failed);
                patch_status(ctx, name, extension).await?;
                Ok(Outcome::RequeueAfter(REQUEUE_STEADY))
            }
        }
    }
}

fn set_phase(extension: &mut Extension, phase: ExtensionPhase) {
    extension.status.get_or_insert_with(Default::default).phase = phase;
}

async fn patch_status(ctx: &ExtensionContext, name: &str, extension: &Extension) -> Result<()> {
    let status = extension.status.clone().unwrap_or_default();
    ctx.kube.patch_extension_status(name, &status).await
}

/// Uninstall the release if the cluster is still reachable, then release
/// the finalizer
async fn finalize(
    name: &str,
    extension: &mut Extension,
    cluster: &Option<Cluster>,
    ctx: &ExtensionContext,
) -> Result<Outcome> {
    match (cluster, &extension.spec.helm) {
        (Some(cluster), Some(helm)) => {
            info!(extension = %name, release = %helm.name, "uninstalling helm release");
            let result = ctx
                .helm
                .uninstall(
                    &cluster.spec.kube_config,
                    &extension.spec.target_namespace,
                    &helm.name,
                )
                .await;
            extension.set_condition(HELM_CHART_UNINSTALLED, &result);
            result?;
        }
        _ => {
            warn!(extension = %name, "cluster gone, skipping helm uninstall");
        }
    }

    if let Some(finalizers) = &mut extension.metadata.finalizers {
        finalizers.retain(|f| f != EXTENSION_FINALIZER);
    }
    ctx.kube.update_extension(extension).await?;
    Ok(Outcome::AwaitChange)
}
