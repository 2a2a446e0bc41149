//! CRD installation and manifest generation.
//!
//! The operator installs its own CRDs on startup with server-side apply,
//! so the stored schemas always match the running operator version. The
//! same definitions back the `--crd` manifest dump.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing::info;

use stratus_common::crd::{Application, Cluster, Extension, HelmRepository, Space, Workflow};
use stratus_common::labels::FIELD_MANAGER;
use stratus_common::{Error, Result};

/// Every CRD this operator serves
pub fn all() -> Vec<CustomResourceDefinition> {
    vec![
        Application::crd(),
        Cluster::crd(),
        Extension::crd(),
        HelmRepository::crd(),
        Space::crd(),
        Workflow::crd(),
    ]
}

/// Render all CRDs as a multi-document YAML manifest
pub fn render_yaml() -> Result<String> {
    let docs: Result<Vec<String>> = all()
        .iter()
        .map(|crd| {
            serde_yaml::to_string(crd)
                .map_err(|e| Error::serialization_of("CustomResourceDefinition", e.to_string()))
        })
        .collect();
    Ok(docs?.join("---\n"))
}

/// Install or update every CRD with server-side apply
pub async fn ensure_installed(client: &Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in all() {
        let name = crd.name_any();
        info!(crd = %name, "installing custom resource definition");
        api.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }
    Ok(())
}
