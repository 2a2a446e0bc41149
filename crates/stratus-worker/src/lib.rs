//! Worker-cluster subsystem: per-cluster lazily-initialized clients,
//! the concurrency-safe cluster registry, and reflector-backed object
//! stores shared across reconciles.

pub mod client;
pub mod registry;
pub mod store;

pub use client::{WorkerCluster, GATEWAY_API_GROUP};
pub use registry::Clusterset;
pub use store::ClusterStore;
