//! Reconcilers for the six Stratus resource kinds.
//!
//! Each controller follows the same shape: a kube-client trait for the
//! master cluster, a worker-side trait resolved through the cluster
//! registry, a context struct wiring them together, and a reconcile
//! function driving a small state machine. Expected-pending states
//! (missing dependency, cluster still connecting) requeue; only
//! exceptional failures surface as errors and hit the error policy.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::error;

use stratus_common::Error;

pub mod application;
pub mod cluster;
pub mod extension;
pub mod helm_repository;
pub mod space;
pub mod workflow;

/// Requeue interval while a dependency is expected to appear shortly
pub const REQUEUE_WARMUP: Duration = Duration::from_secs(1);
/// Requeue interval for steady-state drift checks
pub const REQUEUE_STEADY: Duration = Duration::from_secs(15);

/// What a reconcile pass decided about the next one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do until the resource changes
    AwaitChange,
    /// Run again after the given delay
    RequeueAfter(Duration),
}

impl Outcome {
    pub fn into_action(self) -> Action {
        match self {
            Outcome::AwaitChange => Action::await_change(),
            Outcome::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Shared error policy: transient failures retry with a short backoff,
/// everything else waits for a spec change
pub fn error_policy<K, C>(resource: Arc<K>, error: &Error, _ctx: Arc<C>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    error!(
        resource = %resource.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::await_change()
    }
}
