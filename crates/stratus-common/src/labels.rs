//! Ownership and identity labels attached to every managed resource.
//!
//! Two labels are required on everything the platform manages: the
//! platform-owned marker and a parent-identity label naming the owning
//! Cluster/Space/Application. Reconcilers self-heal these before any
//! other logic and refuse destructive operations on unlabeled objects.

use std::collections::BTreeMap;

/// Marker for objects under platform management
pub const OWNED_LABEL_KEY: &str = "stratus.io/owned";
/// Marker for built-in platform resources (admin space, extension repo)
pub const BUILTIN_LABEL_KEY: &str = "stratus.io/builtin";
pub const LABEL_TRUE: &str = "true";

pub const CLUSTER_LABEL_KEY: &str = "stratus.io/cluster";
pub const SPACE_LABEL_KEY: &str = "stratus.io/space";
pub const APPLICATION_LABEL_KEY: &str = "stratus.io/application";
pub const APPLICATION_EDITION_LABEL_KEY: &str = "stratus.io/application-edition";
pub const APPLICATION_VERSION_LABEL_KEY: &str = "stratus.io/application-version";
pub const EXTENSION_LABEL_KEY: &str = "stratus.io/extension";
pub const HELM_REPOSITORY_LABEL_KEY: &str = "stratus.io/helmrepository";
pub const WORKFLOW_LABEL_KEY: &str = "stratus.io/workflow";

pub const APPLICATION_VERSION_STABLE: &str = "stable";
pub const APPLICATION_VERSION_CANARY: &str = "canary";

/// Namespace holding platform-operated resources in every cluster
pub const SYSTEM_NAMESPACE: &str = "stratus-system";

/// Field manager used for server-side apply of platform-managed objects
pub const FIELD_MANAGER: &str = "stratus-operator";

pub type LabelSet = BTreeMap<String, String>;

/// Labels carried by built-in platform resources
pub fn builtin_resource_labels() -> LabelSet {
    BTreeMap::from([
        (OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string()),
        (BUILTIN_LABEL_KEY.to_string(), LABEL_TRUE.to_string()),
    ])
}

/// Required labels for objects owned by a Cluster
pub fn cluster_required_labels(cluster: &str) -> LabelSet {
    BTreeMap::from([
        (OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string()),
        (CLUSTER_LABEL_KEY.to_string(), cluster.to_string()),
    ])
}

/// Required labels for objects owned by a Space
pub fn space_required_labels(space: &str) -> LabelSet {
    BTreeMap::from([
        (OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string()),
        (SPACE_LABEL_KEY.to_string(), space.to_string()),
    ])
}

/// Labels stamped onto every derived resource of an Application's stable track
pub fn application_stable_labels(space: &str, app: &str) -> LabelSet {
    BTreeMap::from([
        (OWNED_LABEL_KEY.to_string(), LABEL_TRUE.to_string()),
        (SPACE_LABEL_KEY.to_string(), space.to_string()),
        (APPLICATION_LABEL_KEY.to_string(), app.to_string()),
        (
            APPLICATION_VERSION_LABEL_KEY.to_string(),
            APPLICATION_VERSION_STABLE.to_string(),
        ),
    ])
}

/// New opaque edition stamp; bumped on meaningful spec changes to force a rollout
pub fn new_edition() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Label selector string matching platform-owned objects
pub fn owned_selector() -> String {
    format!("{OWNED_LABEL_KEY}={LABEL_TRUE}")
}

/// Label selector string matching objects belonging to one Application
pub fn application_selector(app: &str) -> String {
    format!("{OWNED_LABEL_KEY}={LABEL_TRUE},{APPLICATION_LABEL_KEY}={app}")
}

/// Label selector string matching Spaces (or derived objects) of one Cluster
pub fn cluster_selector(cluster: &str) -> String {
    format!("{CLUSTER_LABEL_KEY}={cluster}")
}

/// Whether a label map marks the object as platform-owned
pub fn is_platform_owned(labels: Option<&LabelSet>) -> bool {
    labels
        .and_then(|l| l.get(OWNED_LABEL_KEY))
        .map(|v| v == LABEL_TRUE)
        .unwrap_or(false)
}
