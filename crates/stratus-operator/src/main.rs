//! Stratus operator - multi-cluster application platform

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratus_common::crd::{Application, Cluster, Extension, HelmRepository, Space, Workflow};
use stratus_operator::controller::{
    application, cluster, error_policy, extension, helm_repository, space, workflow,
};
use stratus_operator::crds;
use stratus_operator::helm::HelmCli;
use stratus_worker::Clusterset;

/// Stratus - CRD-driven operator projecting spaces, applications, and
/// extensions into worker clusters
#[derive(Parser, Debug)]
#[command(name = "stratus-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds::render_yaml()?);
        return Ok(());
    }

    run_controllers().await
}

async fn run_controllers() -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    crds::ensure_installed(&client).await?;

    // Warm the worker registry from Clusters that already exist, so
    // Space and Application reconciles after a restart do not all wait
    // for their Cluster to be reconciled first.
    let registry = Arc::new(Clusterset::new());
    let clusters_api: Api<Cluster> = Api::all(client.clone());
    for resource in clusters_api.list(&ListParams::default()).await?.items {
        registry.observe(&resource);
    }
    tracing::info!(count = registry.list().len(), "worker registry warmed");

    let helm = Arc::new(HelmCli::new());

    let cluster_ctx = Arc::new(cluster::ClusterContext::from_client(
        client.clone(),
        registry.clone(),
    ));
    let space_ctx = Arc::new(space::SpaceContext::from_client(
        client.clone(),
        registry.clone(),
    ));
    let application_ctx = Arc::new(application::ApplicationContext::from_client(
        client.clone(),
        registry.clone(),
    ));
    let extension_ctx = Arc::new(extension::ExtensionContext::from_client(
        client.clone(),
        helm.clone(),
    ));
    let helm_repository_ctx = Arc::new(helm_repository::HelmRepositoryContext::from_client(
        client.clone(),
        helm,
    ));
    let workflow_ctx = Arc::new(workflow::WorkflowContext::from_client(
        client.clone(),
        registry,
    ));

    tracing::info!("starting stratus controllers");

    let cluster_controller = Controller::new(clusters_api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(cluster::reconcile, error_policy, cluster_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "cluster reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "cluster reconciliation error"),
            }
        });

    let spaces: Api<Space> = Api::all(client.clone());
    let space_controller = Controller::new(spaces, WatcherConfig::default())
        .shutdown_on_signal()
        .run(space::reconcile, error_policy, space_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "space reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "space reconciliation error"),
            }
        });

    let applications: Api<Application> = Api::all(client.clone());
    let application_controller = Controller::new(applications, WatcherConfig::default())
        .shutdown_on_signal()
        .run(application::reconcile, error_policy, application_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "application reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "application reconciliation error"),
            }
        });

    let extensions: Api<Extension> = Api::all(client.clone());
    let extension_controller = Controller::new(extensions, WatcherConfig::default())
        .shutdown_on_signal()
        .run(extension::reconcile, error_policy, extension_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "extension reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "extension reconciliation error"),
            }
        });

    let helm_repositories: Api<HelmRepository> = Api::all(client.clone());
    let helm_repository_controller = Controller::new(helm_repositories, WatcherConfig::default())
        .shutdown_on_signal()
        .run(helm_repository::reconcile, error_policy, helm_repository_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "helm repository reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "helm repository reconciliation error"),
            }
        });

    let workflows: Api<Workflow> = Api::all(client);
    let workflow_controller = Controller::new(workflows, WatcherConfig::default())
        .shutdown_on_signal()
        .run(workflow::reconcile, error_policy, workflow_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "workflow reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "workflow reconciliation error"),
            }
        });

    tokio::select! {
        _ = cluster_controller => tracing::info!("cluster controller completed"),
        _ = space_controller => tracing::info!("space controller completed"),
        _ = application_controller => tracing::info!("application controller completed"),
        _ = extension_controller => tracing::info!("extension controller completed"),
        _ = helm_repository_controller => tracing::info!("helm repository controller completed"),
        _ = workflow_controller => tracing::info!("workflow controller completed"),
    }

    tracing::info!("stratus operator shutting down");
    Ok(())
}
