//! Stratus operator - multi-cluster application platform controllers.
//!
//! Watches the six Stratus resource kinds in the master cluster and
//! projects them into registered worker clusters: Spaces become
//! namespaces with quota policy, Applications become native workload
//! objects with their derived resources, Extensions become Helm
//! releases, and Workflows become one-shot builder pods.

pub mod controller;
pub mod crds;
pub mod gateway;
pub mod helm;
pub mod workload;
