//! Workflow Custom Resource Definition
//!
//! A Workflow is a CI build definition; while Pending it spawns a
//! one-shot builder pod in the worker cluster and tracks its outcome.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::{set_condition, Condition, WorkflowPhase};
use crate::error::Error;
use crate::labels::{LABEL_TRUE, OWNED_LABEL_KEY, SPACE_LABEL_KEY, WORKFLOW_LABEL_KEY};

pub const WORKFLOW_FINALIZER: &str = "workflows.core.stratus.io/finalizer";

/// Git source for a build
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Secret holding git credentials, if the repository is private
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

/// Specification for a CI build workflow
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.stratus.io",
    version = "v1alpha1",
    kind = "Workflow",
    plural = "workflows",
    status = "WorkflowStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub git: GitSource,

    /// Shell script executed inside the builder container
    pub build_script: String,

    /// Image the build script runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_image: Option<String>,

    /// Build retries before the workflow is marked Failed
    #[serde(default)]
    pub retries: i32,
}

/// Observed state of a Workflow
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Workflow {
    /// Ensure the required ownership/identity labels are present.
    /// Returns true when a label had to be added or corrected.
    pub fn check_or_set_required_labels(&mut self) -> bool {
        let name = self.metadata.name.clone().unwrap_or_default();
        let space = self.metadata.namespace.clone().unwrap_or_default();
        let labels = self.metadata.labels.get_or_insert_with(BTreeMap::new);
        let mut changed = false;
        if labels.get(OWNED_LABEL_KEY).map(String::as_str) != Some(LABEL_TRUE) {
            labels.insert(OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string());
            changed = true;
        }
        if labels.get(WORKFLOW_LABEL_KEY) != Some(&name) {
            labels.insert(WORKFLOW_LABEL_KEY.to_string(), name);
            changed = true;
        }
        if labels.get(SPACE_LABEL_KEY) != Some(&space) {
            labels.insert(SPACE_LABEL_KEY.to_string(), space);
            changed = true;
        }
        changed
    }

    /// Ensure the deletion finalizer is present; true when added
    pub fn check_or_set_finalizer(&mut self) -> bool {
        let finalizers = self.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == WORKFLOW_FINALIZER) {
            false
        } else {
            finalizers.push(WORKFLOW_FINALIZER.to_string());
            true
        }
    }

    /// Record a condition from an operation result
    pub fn set_condition(&mut self, type_: &str, result: &Result<(), Error>) {
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(&mut status.conditions, Condition::from_result(type_, result));
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }
}
