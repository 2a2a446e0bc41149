//! HelmRepository Custom Resource Definition
//!
//! A named chart repository scoped to a Space; re-added on every
//! reconcile until it reaches the Added phase.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::{set_condition, Condition, HelmRepositoryPhase};
use crate::error::Error;
use crate::labels::{HELM_REPOSITORY_LABEL_KEY, LABEL_TRUE, OWNED_LABEL_KEY, SPACE_LABEL_KEY};

pub const HELM_REPOSITORY_FINALIZER: &str = "helmrepositories.core.stratus.io/finalizer";

/// Specification for a Helm chart repository
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.stratus.io",
    version = "v1alpha1",
    kind = "HelmRepository",
    plural = "helmrepositories",
    status = "HelmRepositoryStatus",
    namespaced,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Chart repository URL
    pub url: String,
}

/// Observed state of a HelmRepository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryStatus {
    #[serde(default)]
    pub phase: HelmRepositoryPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HelmRepository {
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
        if labels.get(HELM_REPOSITORY_LABEL_KEY) != Some(&name) {
            labels.insert(HELM_REPOSITORY_LABEL_KEY.to_string(), name);
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
        if finalizers.iter().any(|f| f == HELM_REPOSITORY_FINALIZER) {
            false
        } else {
            finalizers.push(HELM_REPOSITORY_FINALIZER.to_string());
            true
        }
    }

    /// Record a condition from an operation result
    pub fn set_condition(&mut self, type_: &str, result: &Result<(), Error>) {
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(&mut status.conditions, Condition::from_result(type_, result));
    }

    pub fn phase(&self) -> HelmRepositoryPhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_include_space_identity() {
        let mut hr = HelmRepository::new(
            "bitnami",
            HelmRepositorySpec {
                url: "https://charts.bitnami.com/bitnami".to_string(),
                ..Default::default()
            },
        );
        hr.metadata.name = Some("bitnami".to_string());
        hr.metadata.namespace = Some("team-a".to_string());
        assert!(hr.check_or_set_required_labels());
        let labels = hr.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(SPACE_LABEL_KEY).map(String::as_str), Some("team-a"));
        assert!(!hr.check_or_set_required_labels());
    }
}
