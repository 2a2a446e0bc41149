//! Extension Custom Resource Definition
//!
//! An Extension is an add-on installed into a worker cluster, either via
//! a Helm chart or a set of raw manifests.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::{set_condition, Condition, ExtensionPhase};
use crate::error::Error;
use crate::labels::{EXTENSION_LABEL_KEY, LABEL_TRUE, OWNED_LABEL_KEY};

pub const EXTENSION_FINALIZER: &str = "extensions.core.stratus.io/finalizer";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstallType {
    #[default]
    Helm,
    KubeApply,
}

/// Helm chart coordinates for a Helm-installed extension
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmInstallation {
    /// Release name
    pub name: String,
    /// HelmRepository resource the chart comes from
    pub repository: String,
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Chart values as key=value overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

/// Summary of an installed Helm release, mirrored into status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmRelease {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default)]
    pub revision: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub resources: usize,
}

/// Specification for a cluster add-on
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.stratus.io",
    version = "v1alpha1",
    kind = "Extension",
    plural = "extensions",
    status = "ExtensionStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Target worker cluster name
    pub cluster: String,

    /// Namespace in the worker cluster the add-on installs into
    pub target_namespace: String,

    #[serde(default)]
    pub install_type: InstallType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmInstallation>,
}

/// Observed state of an Extension
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    #[serde(default)]
    pub phase: ExtensionPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_release: Option<HelmRelease>,
}

impl Extension {
    /// Ensure the required ownership/identity labels are present.
    /// Returns true when a label had to be added or corrected.
    pub fn check_or_set_required_labels(&mut self) -> bool {
        let name = self.metadata.name.clone().unwrap_or_default();
        let labels = self.metadata.labels.get_or_insert_with(BTreeMap::new);
        let mut changed = false;
        if labels.get(OWNED_LABEL_KEY).map(String::as_str) != Some(LABEL_TRUE) {
            labels.insert(OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string());
            changed = true;
        }
        if labels.get(EXTENSION_LABEL_KEY) != Some(&name) {
            labels.insert(EXTENSION_LABEL_KEY.to_string(), name);
            changed = true;
        }
        changed
    }

    /// Ensure the deletion finalizer is present; true when added
    pub fn check_or_set_finalizer(&mut self) -> bool {
        let finalizers = self.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == EXTENSION_FINALIZER) {
            false
        } else {
            finalizers.push(EXTENSION_FINALIZER.to_string());
            true
        }
    }

    /// Record a condition from an operation result
    pub fn set_condition(&mut self, type_: &str, result: &Result<(), Error>) {
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(&mut status.conditions, Condition::from_result(type_, result));
    }

    pub fn phase(&self) -> ExtensionPhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }
}
