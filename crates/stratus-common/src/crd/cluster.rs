//! Cluster Custom Resource Definition
//!
//! A Cluster registers a remote worker cluster with the platform. The
//! spec carries the kubeconfig credential blob; everything else about the
//! cluster (server, version, child spaces) is observed into status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::{set_condition, ClusterPhase, Condition, ExtensionPhase, SpacePhase};
use crate::error::Error;
use crate::labels::{CLUSTER_LABEL_KEY, LABEL_TRUE, OWNED_LABEL_KEY};

/// Specification for a registered worker cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.stratus.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Spaces","type":"integer","jsonPath":".status.spaceCount"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".status.server"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Display name shown in the UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Opaque kubeconfig credential blob for the worker cluster.
    /// The sole credential input to the worker-cluster subsystem.
    pub kube_config: String,

    /// Wildcard DNS domains served by the cluster's gateways
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wild_card_domains: Vec<String>,
}

/// Observed state of a worker cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    /// API server endpoint host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Server git version, "unknown" until discovered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub space_count: usize,

    #[serde(default)]
    pub extension_count: usize,

    /// Child space name to phase
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub spaces: BTreeMap<String, SpacePhase>,

    /// Child extension name to phase
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, ExtensionPhase>,
}

impl Cluster {
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
        if labels.get(CLUSTER_LABEL_KEY) != Some(&name) {
            labels.insert(CLUSTER_LABEL_KEY.to_string(), name);
            changed = true;
        }
        changed
    }

    /// Record a condition from an operation result
    pub fn set_condition(&mut self, type_: &str, result: &Result<(), Error>) {
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(&mut status.conditions, Condition::from_result(type_, result));
    }

    /// Refresh the observed child-space map and count
    pub fn set_status_spaces(&mut self, spaces: impl IntoIterator<Item = (String, SpacePhase)>) {
        let status = self.status.get_or_insert_with(Default::default);
        status.spaces = spaces.into_iter().collect();
        status.space_count = status.spaces.len();
    }

    /// Refresh the observed child-extension map and count
    pub fn set_status_extensions(
        &mut self,
        extensions: impl IntoIterator<Item = (String, ExtensionPhase)>,
    ) {
        let status = self.status.get_or_insert_with(Default::default);
        status.extensions = extensions.into_iter().collect();
        status.extension_count = status.extensions.len();
    }

    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> Cluster {
        let mut c = Cluster::new(
            name,
            ClusterSpec {
                kube_config: "apiVersion: v1".to_string(),
                ..Default::default()
            },
        );
        c.metadata.name = Some(name.to_string());
        c
    }

    #[test]
    fn label_self_heal_is_idempotent() {
        let mut c = cluster("worker-1");
        assert!(c.check_or_set_required_labels());
        assert!(!c.check_or_set_required_labels());
        let labels = c.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(CLUSTER_LABEL_KEY).map(String::as_str), Some("worker-1"));
    }

    #[test]
    fn label_self_heal_corrects_wrong_identity() {
        let mut c = cluster("worker-1");
        c.check_or_set_required_labels();
        c.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(CLUSTER_LABEL_KEY.to_string(), "other".to_string());
        assert!(c.check_or_set_required_labels());
    }

    #[test]
    fn status_spaces_count_follows_map() {
        let mut c = cluster("worker-1");
        c.set_status_spaces([
            ("team-a".to_string(), SpacePhase::Ready),
            ("team-b".to_string(), SpacePhase::NotReady),
        ]);
        let status = c.status.as_ref().unwrap();
        assert_eq!(status.space_count, 2);
        assert_eq!(status.spaces.get("team-a"), Some(&SpacePhase::Ready));
    }
}
