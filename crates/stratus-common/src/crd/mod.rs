//! Custom resource definitions for the Stratus control plane.
//!
//! All kinds live under `core.stratus.io/v1alpha1`. Cluster, Space, and
//! Extension are cluster-scoped; Application, HelmRepository, and
//! Workflow are namespaced under their Space's namespace.

pub mod application;
pub mod cluster;
pub mod extension;
pub mod helm_repository;
pub mod space;
pub mod status;
pub mod workflow;

pub use application::{
    Application, ApplicationSpec, ApplicationStatus, Autoscaler, DesiredState, GatewayBinding,
    GatewayType, MountDirectory, MountFile, Port, Sidecar, SidecarType, WorkloadType,
    APPLICATION_FINALIZER,
};
pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use extension::{
    Extension, ExtensionSpec, ExtensionStatus, HelmInstallation, HelmRelease, InstallType,
    EXTENSION_FINALIZER,
};
pub use helm_repository::{
    HelmRepository, HelmRepositorySpec, HelmRepositoryStatus, HELM_REPOSITORY_FINALIZER,
};
pub use space::{
    LimitRangeSpec, Space, SpaceMemberRole, SpaceSpec, SpaceStatus, SPACE_FINALIZER,
};
pub use status::{
    condition_types, delete_condition, set_condition, ApplicationPhase, ClusterPhase, Condition,
    ExtensionPhase, HelmRepositoryPhase, SpacePhase, WorkflowPhase,
};
pub use workflow::{GitSource, Workflow, WorkflowSpec, WorkflowStatus, WORKFLOW_FINALIZER};
