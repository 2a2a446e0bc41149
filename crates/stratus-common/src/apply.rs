//! Idempotent apply/delete primitives for typed objects.
//!
//! `apply` drives create-or-update with optimistic-concurrency retry:
//! absent objects are created with a cleared resourceVersion, present
//! objects are replaced carrying the live resourceVersion. Deletes treat
//! not-found as success. PersistentVolumeClaims get a dedicated path that
//! never rewrites immutable spec fields.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::Error;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::Result;

/// Create the object if absent, otherwise replace it carrying the live
/// resourceVersion. Conflicts are retried a bounded number of times.
pub async fn apply<K>(api: &Api<K>, desired: &K) -> Result<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    let name = desired.name_any();
    retry_on_conflict(&RetryConfig::conflict_default(), "apply", || {
        let api = api.clone();
        let mut desired = desired.clone();
        let name = name.clone();
        async move {
            match api.get_opt(&name).await.map_err(Error::from)? {
                None => {
                    // Create path: a stale resourceVersion would be rejected
                    desired.meta_mut().resource_version = None;
                    debug!(name = %name, "creating object");
                    Ok(api.create(&PostParams::default(), &desired).await?)
                }
                Some(current) => {
                    desired.meta_mut().resource_version = current.resource_version();
                    debug!(name = %name, "replacing object");
                    Ok(api.replace(&name, &PostParams::default(), &desired).await?)
                }
            }
        }
    })
    .await
}

/// Apply a PersistentVolumeClaim without touching immutable spec fields.
///
/// Absent claims are created as-is. Existing claims only take the desired
/// labels, annotations, and storage capacity requests; everything else on
/// the live object (access modes, storage class, volume binding) is kept.
pub async fn apply_pvc(
    api: &Api<PersistentVolumeClaim>,
    desired: &PersistentVolumeClaim,
) -> Result<PersistentVolumeClaim> {
    let name = desired.name_any();
    retry_on_conflict(&RetryConfig::conflict_default(), "apply_pvc", || {
        let api = api.clone();
        let desired = desired.clone();
        let name = name.clone();
        async move {
            match api.get_opt(&name).await.map_err(Error::from)? {
                None => {
                    let mut fresh = desired.clone();
                    fresh.metadata.resource_version = None;
                    Ok(api.create(&PostParams::default(), &fresh).await?)
                }
                Some(mut current) => {
                    overlay_pvc(&mut current, &desired);
                    Ok(api.replace(&name, &PostParams::default(), &current).await?)
                }
            }
        }
    })
    .await
}

/// Copy the mutable surface of a desired PVC onto the live object
fn overlay_pvc(current: &mut PersistentVolumeClaim, desired: &PersistentVolumeClaim) {
    current.metadata.labels = desired.metadata.labels.clone();
    current.metadata.annotations = desired.metadata.annotations.clone();
    let requests = desired
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.clone());
    if let Some(requests) = requests {
        let spec = current.spec.get_or_insert_with(Default::default);
        let resources = spec.resources.get_or_insert_with(Default::default);
        resources.requests = Some(requests);
    }
}

/// Delete by name; not-found counts as success
pub async fn delete<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Merge-patch the status subresource of a named object.
///
/// Callers re-fetch the live object and compare statuses before calling,
/// so an unchanged status never produces a write (and never re-triggers
/// the watch).
pub async fn patch_status<K>(api: &Api<K>, name: &str, status: serde_json::Value) -> Result<K>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?)
}
