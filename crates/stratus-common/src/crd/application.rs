//! Application Custom Resource Definition
//!
//! An Application is a deployable workload inside a Space. Its spec is
//! compiled into exactly one native workload object (Deployment,
//! StatefulSet, Job, or CronJob) plus derived ConfigMaps, PVCs, Services,
//! HTTPRoutes, and an optional HPA in the worker cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Probe, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::{set_condition, ApplicationPhase, Condition};
use crate::error::Error;
use crate::labels::{
    new_edition, APPLICATION_EDITION_LABEL_KEY, APPLICATION_LABEL_KEY, LABEL_TRUE,
    OWNED_LABEL_KEY, SPACE_LABEL_KEY,
};

pub const APPLICATION_FINALIZER: &str = "applications.core.stratus.io/finalizer";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadType {
    #[default]
    Deployment,
    StatefulSet,
    Job,
    CronJob,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
}

/// How a container port is exposed outside the cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GatewayType {
    /// Exposed via a NodePort service
    TCP,
    /// Exposed via an HTTPRoute through the cluster gateway
    HTTP,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_: GatewayType,
    /// Gateway class the HTTP route attaches to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Node port for TCP exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub number: i32,
    /// Container target port; defaults to `number`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<GatewayBinding>,
}

impl Port {
    pub fn target_port(&self) -> i32 {
        self.target.unwrap_or(self.number)
    }
}

/// A file rendered into a ConfigMap and mounted into the main container
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountFile {
    pub name: String,
    pub path: String,
    /// File mode, default 0644
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i32>,
    #[serde(default)]
    pub content: String,
}

/// A directory backed by a PersistentVolumeClaim
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountDirectory {
    pub name: String,
    pub path: String,
    pub storage_capacity: Quantity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Autoscaler {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_cpu_utilization_percentage: i32,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SidecarType {
    /// Runs as an init container
    InitRun,
    /// Ordered before the main container
    PreRun,
    /// Ordered after the main container
    PostRun,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    #[serde(rename = "type")]
    pub type_: SidecarType,
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub privileged: bool,
}

/// Specification for a deployable workload
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.stratus.io",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    status = "ApplicationStatus",
    namespaced,
    printcolumn = r#"{"name":"Workload-Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Edition","type":"string","jsonPath":".status.edition"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "type", default)]
    pub type_: WorkloadType,

    #[serde(default)]
    pub desired_state: DesiredState,

    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    #[serde(default)]
    pub replicas: i32,

    /// Cron expression, CronJob workloads only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthz: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler: Option<Autoscaler>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Sidecar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_files: Vec<MountFile>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_directories: Vec<MountDirectory>,

    #[serde(default)]
    pub privileged: bool,
}

/// Observed state of an Application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Edition stamp copied from the edition label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,

    #[serde(default)]
    pub phase: ApplicationPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Application {
    /// Ensure ownership/identity labels and an edition stamp are present.
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
        if labels.get(APPLICATION_LABEL_KEY) != Some(&name) {
            labels.insert(APPLICATION_LABEL_KEY.to_string(), name);
            changed = true;
        }
        if labels.get(SPACE_LABEL_KEY) != Some(&space) {
            labels.insert(SPACE_LABEL_KEY.to_string(), space);
            changed = true;
        }
        if !labels.contains_key(APPLICATION_EDITION_LABEL_KEY) {
            labels.insert(APPLICATION_EDITION_LABEL_KEY.to_string(), new_edition());
            changed = true;
        }
        changed
    }

    /// Ensure the deletion finalizer is present; true when added
    pub fn check_or_set_finalizer(&mut self) -> bool {
        let finalizers = self.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == APPLICATION_FINALIZER) {
            false
        } else {
            finalizers.push(APPLICATION_FINALIZER.to_string());
            true
        }
    }

    /// Record a condition from an operation result
    pub fn set_condition(&mut self, type_: &str, result: &Result<(), Error>) {
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(&mut status.conditions, Condition::from_result(type_, result));
    }

    /// Current edition label value, if stamped
    pub fn edition(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(APPLICATION_EDITION_LABEL_KEY))
            .map(String::as_str)
    }

    /// Effective replica count after the desired-state switch
    pub fn desired_replicas(&self) -> i32 {
        match self.spec.desired_state {
            DesiredState::Running => self.spec.replicas,
            DesiredState::Stopped => 0,
        }
    }

    pub fn phase(&self) -> ApplicationPhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, ns: &str) -> Application {
        let mut a = Application::new(
            name,
            ApplicationSpec {
                image: "nginx:1.27".to_string(),
                replicas: 2,
                ..Default::default()
            },
        );
        a.metadata.name = Some(name.to_string());
        a.metadata.namespace = Some(ns.to_string());
        a
    }

    #[test]
    fn labels_stamp_edition_once() {
        let mut a = app("web", "team-a");
        assert!(a.check_or_set_required_labels());
        let first = a.edition().unwrap().to_string();
        assert!(!a.check_or_set_required_labels());
        assert_eq!(a.edition().unwrap(), first);
    }

    #[test]
    fn stopped_resolves_to_zero_replicas() {
        let mut a = app("web", "team-a");
        assert_eq!(a.desired_replicas(), 2);
        a.spec.desired_state = DesiredState::Stopped;
        assert_eq!(a.desired_replicas(), 0);
    }

    #[test]
    fn port_target_defaults_to_number() {
        let port = Port {
            number: 80,
            target: None,
            gateways: Vec::new(),
        };
        assert_eq!(port.target_port(), 80);
        let port = Port {
            number: 80,
            target: Some(8080),
            gateways: Vec::new(),
        };
        assert_eq!(port.target_port(), 8080);
    }

    #[test]
    fn workload_type_serializes_as_pascal_case() {
        assert_eq!(
            serde_json::to_value(WorkloadType::StatefulSet).unwrap(),
            "StatefulSet"
        );
        assert_eq!(serde_json::to_value(DesiredState::Stopped).unwrap(), "Stopped");
    }
}
