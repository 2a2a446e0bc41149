//! Space Custom Resource Definition
//!
//! A Space is the tenant boundary: it maps 1:1 to a namespace of the same
//! name in both the master and its target worker cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::{set_condition, ApplicationPhase, Condition, SpacePhase};
use crate::error::Error;
use crate::labels::{CLUSTER_LABEL_KEY, LABEL_TRUE, OWNED_LABEL_KEY, SPACE_LABEL_KEY};

pub const SPACE_FINALIZER: &str = "spaces.core.stratus.io/finalizer";

/// Role granted to a space member
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SpaceMemberRole {
    #[serde(rename = "space-owner")]
    Owner,
    #[serde(rename = "space-maintainer")]
    Maintainer,
    #[serde(rename = "space-viewer")]
    Viewer,
}

/// Default per-container limits applied through a LimitRange
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LimitRangeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
}

/// Specification for a tenant space
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.stratus.io",
    version = "v1alpha1",
    kind = "Space",
    plural = "spaces",
    status = "SpaceStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Applications","type":"integer","jsonPath":".status.applicationCount"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpaceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Target worker cluster name
    pub cluster: String,

    /// Member account to granted roles
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, Vec<SpaceMemberRole>>,

    /// Aggregate resource quota enforced on the worker namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_quota: Option<ResourceRequirements>,

    /// Default container limits enforced on the worker namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_range: Option<LimitRangeSpec>,
}

/// Observed state of a Space
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceStatus {
    #[serde(default)]
    pub phase: SpacePhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub application_count: usize,

    /// Child application name to phase
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub applications: BTreeMap<String, ApplicationPhase>,
}

impl Space {
    /// Ensure the required ownership/identity labels are present.
    /// Returns true when a label had to be added or corrected.
    pub fn check_or_set_required_labels(&mut self) -> bool {
        let name = self.metadata.name.clone().unwrap_or_default();
        let cluster = self.spec.cluster.clone();
        let labels = self.metadata.labels.get_or_insert_with(BTreeMap::new);
        let mut changed = false;
        if labels.get(OWNED_LABEL_KEY).map(String::as_str) != Some(LABEL_TRUE) {
            labels.insert(OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string());
            changed = true;
        }
        if labels.get(SPACE_LABEL_KEY) != Some(&name) {
            labels.insert(SPACE_LABEL_KEY.to_string(), name);
            changed = true;
        }
        if labels.get(CLUSTER_LABEL_KEY) != Some(&cluster) {
            labels.insert(CLUSTER_LABEL_KEY.to_string(), cluster);
            changed = true;
        }
        changed
    }

    /// Ensure the deletion finalizer is present; true when added
    pub fn check_or_set_finalizer(&mut self) -> bool {
        let finalizers = self.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == SPACE_FINALIZER) {
            false
        } else {
            finalizers.push(SPACE_FINALIZER.to_string());
            true
        }
    }

    /// Record a condition from an operation result
    pub fn set_condition(&mut self, type_: &str, result: &Result<(), Error>) {
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(&mut status.conditions, Condition::from_result(type_, result));
    }

    /// Refresh the observed child-application map and count
    pub fn set_status_applications(
        &mut self,
        apps: impl IntoIterator<Item = (String, ApplicationPhase)>,
    ) {
        let status = self.status.get_or_insert_with(Default::default);
        status.applications = apps.into_iter().collect();
        status.application_count = status.applications.len();
    }

    pub fn phase(&self) -> SpacePhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == SpacePhase::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(name: &str, cluster: &str) -> Space {
        let mut s = Space::new(
            name,
            SpaceSpec {
                cluster: cluster.to_string(),
                ..Default::default()
            },
        );
        s.metadata.name = Some(name.to_string());
        s
    }

    #[test]
    fn labels_include_cluster_identity() {
        let mut s = space("team-a", "worker-1");
        assert!(s.check_or_set_required_labels());
        let labels = s.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(CLUSTER_LABEL_KEY).map(String::as_str), Some("worker-1"));
        assert_eq!(labels.get(SPACE_LABEL_KEY).map(String::as_str), Some("team-a"));
        assert!(!s.check_or_set_required_labels());
    }

    #[test]
    fn finalizer_added_once() {
        let mut s = space("team-a", "worker-1");
        assert!(s.check_or_set_finalizer());
        assert!(!s.check_or_set_finalizer());
        assert_eq!(s.metadata.finalizers.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn default_phase_is_not_ready() {
        let s = space("team-a", "worker-1");
        assert_eq!(s.phase(), SpacePhase::NotReady);
        assert!(!s.is_ready());
    }

    #[test]
    fn member_roles_round_trip() {
        let json = serde_json::to_value(SpaceMemberRole::Maintainer).unwrap();
        assert_eq!(json, "space-maintainer");
    }
}
