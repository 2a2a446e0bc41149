//! Shared status machinery: phases and condition lists.
//!
//! Conditions are the health/error channel read by the API layer and UI;
//! each condition type appears at most once per resource, replaced in
//! place when re-reported.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A single observed condition on a resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g., "PingPassed", "NamespaceReady")
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False"
    pub status: String,
    /// Last error message, empty on success
    #[serde(default)]
    pub message: String,
    /// When the condition last changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Build a condition from an operation result: `Ok` reports True with
    /// an empty message, `Err` reports False carrying the error text.
    pub fn from_result(type_: &str, result: &Result<(), Error>) -> Self {
        let (status, message) = match result {
            Ok(()) => ("True".to_string(), String::new()),
            Err(e) => ("False".to_string(), e.to_string()),
        };
        Self {
            type_: type_.to_string(),
            status,
            message,
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Replace the condition of the same type, or append
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Remove the condition of the given type, if present
pub fn delete_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SpacePhase {
    #[default]
    NotReady,
    Ready,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ApplicationPhase {
    #[default]
    Pending,
    Starting,
    Running,
    Rolling,
    Stopping,
    Stopped,
    Abnormal,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExtensionPhase {
    #[default]
    Pending,
    Installed,
    Failed,
    Uninstalled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HelmRepositoryPhase {
    #[default]
    Pending,
    Added,
    Failed,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkflowPhase {
    #[default]
    Pending,
    Building,
    Succeeded,
    Failed,
}

// Condition types reported by the reconcilers.
pub mod condition_types {
    pub const PING_PASSED: &str = "PingPassed";
    pub const GATEWAY_READY: &str = "GatewayReady";

    pub const CLUSTER_READY: &str = "ClusterReady";
    pub const NAMESPACE_READY: &str = "NamespaceReady";
    pub const RESOURCE_QUOTA_READY: &str = "ResourceQuotaReady";
    pub const LIMIT_RANGE_READY: &str = "LimitRangeReady";

    pub const SPACE_READY: &str = "SpaceReady";
    pub const WORKLOAD_READY: &str = "WorkloadReady";

    pub const HELM_REPOSITORY_ADDED: &str = "HelmRepositoryAdded";
    pub const HELM_CHART_INSTALLED: &str = "HelmChartInstalled";
    pub const HELM_CHART_UNINSTALLED: &str = "HelmChartUninstalled";
    pub const KUBE_APPLIED: &str = "KubeApplied";

    pub const BUILDER_POD_READY: &str = "BuilderPodReady";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_replaces_same_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::from_result(condition_types::PING_PASSED, &Ok(())),
        );
        set_condition(
            &mut conditions,
            Condition::from_result(
                condition_types::PING_PASSED,
                &Err(Error::cluster_unavailable("w1", "timeout")),
            ),
        );
        assert_eq!(conditions.len(), 1);
        assert!(!conditions[0].is_true());
        assert!(conditions[0].message.contains("timeout"));
    }

    #[test]
    fn set_condition_appends_new_types() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::from_result(condition_types::PING_PASSED, &Ok(())),
        );
        set_condition(
            &mut conditions,
            Condition::from_result(condition_types::GATEWAY_READY, &Ok(())),
        );
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn delete_condition_removes_type() {
        let mut conditions = vec![Condition::from_result(condition_types::PING_PASSED, &Ok(()))];
        delete_condition(&mut conditions, condition_types::PING_PASSED);
        assert!(conditions.is_empty());
    }

    #[test]
    fn condition_serializes_with_type_key() {
        let condition = Condition::from_result("Ready", &Ok(()));
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
    }
}
