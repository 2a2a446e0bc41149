//! HelmRepository controller.
//!
//! Registers chart repository aliases with the Helm CLI. The alias list
//! is process-local state, so a repository that already reached Added is
//! left alone until its spec changes, and deletion drops the alias.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use stratus_common::apply;
use stratus_common::crd::condition_types::{HELM_REPOSITORY_ADDED, SPACE_READY};
use stratus_common::crd::{
    HelmRepository, HelmRepositoryPhase, HelmRepositoryStatus, Space, HELM_REPOSITORY_FINALIZER,
};
use stratus_common::{Error, Result};

use crate::controller::{Outcome, REQUEUE_STEADY, REQUEUE_WARMUP};
use crate::helm::HelmClient;

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Master-cluster operations used by the HelmRepository reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmRepositoryKubeClient: Send + Sync {
    async fn get_helm_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRepository>>;

    async fn update_helm_repository(&self, repository: &HelmRepository) -> Result<HelmRepository>;

    /// Patch status if it differs from the live object's status
    async fn patch_helm_repository_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HelmRepositoryStatus,
    ) -> Result<()>;

    async fn get_space(&self, name: &str) -> Result<Option<Space>>;
}

// =============================================================================
// Real implementation
// =============================================================================

pub struct HelmRepositoryKubeClientImpl {
    client: Client,
}

impl HelmRepositoryKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HelmRepositoryKubeClient for HelmRepositoryKubeClientImpl {
    async fn get_helm_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRepository>> {
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_helm_repository(&self, repository: &HelmRepository) -> Result<HelmRepository> {
        let namespace = repository.namespace().unwrap_or_default();
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), &namespace);
        apply::apply(&api, repository).await
    }

    async fn patch_helm_repository_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HelmRepositoryStatus,
    ) -> Result<()> {
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), namespace);
        if let Some(live) = api.get_opt(name).await? {
            if live.status.as_ref() == Some(status) {
                debug!(repository = %name, "status unchanged, skipping patch");
                return Ok(());
            }
        }
        let value = serde_json::to_value(status)
            .map_err(|e| Error::serialization_of("HelmRepositoryStatus", e.to_string()))?;
        apply::patch_status(&api, name, value).await?;
        Ok(())
    }

    async fn get_space(&self, name: &str) -> Result<Option<Space>> {
        let api: Api<Space> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

// =============================================================================
// Controller context
// =============================================================================

pub struct HelmRepositoryContext {
    pub kube: Arc<dyn HelmRepositoryKubeClient>,
    pub helm: Arc<dyn HelmClient>,
}

impl HelmRepositoryContext {
    pub fn from_client(client: Client, helm: Arc<dyn HelmClient>) -> Self {
        Self {
            kube: Arc::new(HelmRepositoryKubeClientImpl::new(client)),
            helm,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn HelmRepositoryKubeClient>,
        helm: Arc<dyn HelmClient>,
    ) -> Self {
        Self { kube, helm }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

#[instrument(skip(repository, ctx), fields(repository = %repository.name_any(), space = repository.namespace()))]
pub async fn reconcile(
    repository: Arc<HelmRepository>,
    ctx: Arc<HelmRepositoryContext>,
) -> Result<Action> {
    let namespace = repository.namespace().unwrap_or_default();
    let name = repository.name_any();
    run(&namespace, &name, &ctx).await.map(Outcome::into_action)
}

async fn run(namespace: &str, name: &str, ctx: &HelmRepositoryContext) -> Result<Outcome> {
    let Some(mut repository) = ctx.kube.get_helm_repository(namespace, name).await? else {
        return Ok(Outcome::AwaitChange);
    };

    if repository.check_or_set_required_labels() {
        debug!(repository = %name, "healing required labels");
        ctx.kube.update_helm_repository(&repository).await?;
        return Ok(Outcome::RequeueAfter(Duration::ZERO));
    }

    if repository.metadata.deletion_timestamp.is_some() {
        return finalize(name, &mut repository, ctx).await;
    }

    // The enclosing space must exist; readiness is not required since
    // alias registration never touches the worker cluster.
    match ctx.kube.get_space(namespace).await? {
        Some(_) => repository.set_condition(SPACE_READY, &Ok(())),
        None => {
            repository.set_condition(
                SPACE_READY,
                &Err(Error::validation_for(name, format!("space {namespace} not found"))),
            );
            patch_status(ctx, namespace, name, &repository).await?;
            return Ok(Outcome::RequeueAfter(REQUEUE_WARMUP));
        }
    }

    if repository.check_or_set_finalizer() {
        repository = ctx.kube.update_helm_repository(&repository).await?;
    }

    if repository.phase() == HelmRepositoryPhase::Added {
        return Ok(Outcome::AwaitChange);
    }

    // Resource names are unique per namespace and serve as the alias.
    info!(repository = %name, url = %repository.spec.url, "adding helm repository");
    match ctx.helm.add_repository(name, &repository.spec.url).await {
        Ok(()) => {
            repository.set_condition(HELM_REPOSITORY_ADDED, &Ok(()));
            set_phase(&mut repository, HelmRepositoryPhase::Added);
            patch_status(ctx, namespace, name, &repository).await?;
            Ok(Outcome::AwaitChange)
        }
        Err(e) => {
            let retryable = e.is_retryable();
            let failed: Result<()> = Err(e);
            repository.set_condition(HELM_REPOSITORY_ADDED, &failed);
            if retryable {
                patch_status(ctx, namespace, name, &repository).await?;
                failed.map(|_| Outcome::AwaitChange)
            } else {
                set_phase(&mut repository, HelmRepositoryPhase::Failed);
                patch_status(ctx, namespace, name, &repository).await?;
                Ok(Outcome::RequeueAfter(REQUEUE_STEADY))
            }
        }
    }
}

fn set_phase(repository: &mut HelmRepository, phase: HelmRepositoryPhase) {
    repository.status.get_or_insert_with(Default::default).phase = phase;
}

async fn patch_status(
    ctx: &HelmRepositoryContext,
    namespace: &str,
    name: &str,
    repository: &HelmRepository,
) -> Result<()> {
    let status = repository.status.clone().unwrap_or_default();
    ctx.kube
        .patch_helm_repository_status(namespace, name, &status)
        .await
}

async fn finalize(
    name: &str,
    repository: &mut HelmRepository,
    ctx: &HelmRepositoryContext,
) -> Result<Outcome> {
    info!(repository = %name, "removing helm repository alias");
    ctx.helm.remove_repository(name).await?;

    if let Some(finalizers) = &mut repository.metadata.finalizers {
        finalizers.retain(|f| f != HELM_REPOSITORY_FINALIZER);
    }
    ctx.kube.update_helm_repository(repository).await?;
    Ok(Outcome::AwaitChange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helm::MockHelmClient;
    use stratus_common::crd::{HelmRepositorySpec, SpaceSpec};

    fn sample_repository(name: &str) -> HelmRepository {
        let mut r = HelmRepository::new(
            name,
            HelmRepositorySpec {
                url: "https://charts.bitnami.com/bitnami".to_string(),
                ..Default::default()
            },
        );
        r.metadata.name = Some(name.to_string());
        r.metadata.namespace = Some("team-a".to_string());
        r.check_or_set_required_labels();
        r.check_or_set_finalizer();
        r
    }

    fn sample_space() -> Space {
        let mut s = Space::new(
            "team-a",
            SpaceSpec {
                cluster: "worker-1".to_string(),
                ..Default::default()
            },
        );
        s.metadata.name = Some("team-a".to_string());
        s
    }

    /// Story: a pending repository registers its alias and lands in Added
    #[tokio::test]
    async fn story_pending_repository_is_added() {
        let fetched = sample_repository("bitnami");
        let mut kube = MockHelmRepositoryKubeClient::new();
        kube.expect_get_helm_repository()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(sample_space())));
        kube.expect_patch_helm_repository_status()
            .withf(|_, _, status| {
                status.phase == HelmRepositoryPhase::Added
                    && status
                        .conditions
                        .iter()
                        .any(|c| c.type_ == HELM_REPOSITORY_ADDED && c.is_true())
            })
            .once()
            .returning(|_, _, _| Ok(()));

        let mut helm = MockHelmClient::new();
        helm.expect_add_repository()
            .withf(|name, url| name == "bitnami" && url == "https://charts.bitnami.com/bitnami")
            .once()
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(HelmRepositoryContext::for_testing(
            Arc::new(kube),
            Arc::new(helm),
        ));
        let action = reconcile(Arc::new(sample_repository("bitnami")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: an Added repository does nothing until its spec changes
    #[tokio::test]
    async fn story_added_repository_holds() {
        let mut added = sample_repository("bitnami");
        added.status = Some(HelmRepositoryStatus {
            phase: HelmRepositoryPhase::Added,
            ..Default::default()
        });
        let fetched = added.clone();

        let mut kube = MockHelmRepositoryKubeClient::new();
        kube.expect_get_helm_repository()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(sample_space())));

        // No helm expectations: any CLI call would panic.
        let ctx = Arc::new(HelmRepositoryContext::for_testing(
            Arc::new(kube),
            Arc::new(MockHelmClient::new()),
        ));
        let action = reconcile(Arc::new(added), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a repository in a missing space defers
    #[tokio::test]
    async fn story_missing_space_defers() {
        let fetched = sample_repository("bitnami");
        let mut kube = MockHelmRepositoryKubeClient::new();
        kube.expect_get_helm_repository()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(None));
        kube.expect_patch_helm_repository_status()
            .withf(|_, _, status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.type_ == SPACE_READY && !c.is_true())
            })
            .once()
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(HelmRepositoryContext::for_testing(
            Arc::new(kube),
            Arc::new(MockHelmClient::new()),
        ));
        let action = reconcile(Arc::new(sample_repository("bitnami")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_WARMUP));
    }

    /// Story: an unreachable registry URL parks the repository in Failed
    #[tokio::test]
    async fn story_bad_url_parks_in_failed() {
        let fetched = sample_repository("bitnami");
        let mut kube = MockHelmRepositoryKubeClient::new();
        kube.expect_get_helm_repository()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_get_space().returning(|_| Ok(Some(sample_space())));
        kube.expect_patch_helm_repository_status()
            .withf(|_, _, status| status.phase == HelmRepositoryPhase::Failed)
            .once()
            .returning(|_, _, _| Ok(()));

        let mut helm = MockHelmClient::new();
        helm.expect_add_repository().returning(|_, _| {
            Err(Error::helm_terminal(
                "bitnami",
                "looks like \"https://charts.bitnami.com/bitnami\" is not a valid chart repository",
            ))
        });

        let ctx = Arc::new(HelmRepositoryContext::for_testing(
            Arc::new(kube),
            Arc::new(helm),
        ));
        let action = reconcile(Arc::new(sample_repository("bitnami")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_STEADY));
    }

    /// Story: deletion drops the alias and releases the finalizer
    #[tokio::test]
    async fn story_deletion_drops_alias() {
        let mut deleting = sample_repository("bitnami");
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        let fetched = deleting.clone();

        let mut kube = MockHelmRepositoryKubeClient::new();
        kube.expect_get_helm_repository()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        kube.expect_update_helm_repository()
            .withf(|r| {
                r.metadata
                    .finalizers
                    .as_ref()
                    .map(|f| f.is_empty())
                    .unwrap_or(true)
            })
            .once()
            .returning(|r| Ok(r.clone()));

        let mut helm = MockHelmClient::new();
        helm.expect_remove_repository()
            .withf(|name| name == "bitnami")
            .once()
            .returning(|_| Ok(()));

        let ctx = Arc::new(HelmRepositoryContext::for_testing(
            Arc::new(kube),
            Arc::new(helm),
        ));
        let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
