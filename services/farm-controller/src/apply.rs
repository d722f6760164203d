//! Declarative apply.
//!
//! The desired object is stamped with its own serialized form; the stamp on
//! the observed object is the only drift signal. What happens on drift is a
//! property of the kind (see [`ManagedResource`]).

use std::time::Duration;

use async_trait::async_trait;
use droidfarm_reconcile::{
    creation_spec, creation_specs_equal, ReconcileError, ReconcileResult, CONFLICT_REQUEUE,
    SHORT_REQUEUE,
};
use tracing::{debug, info};

use crate::api::{Resource, ANNOTATIONS_POINTER, CREATION_SPEC_ANNOTATION};
use crate::store::{Client, StoreError};

/// How a drifted object is brought back in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Copy the desired spec onto the observed object and update it.
    InPlace,
    /// Delete the observed object; the next pass creates it again.
    Recreate,
}

/// Kind-specific apply behaviour.
pub trait ManagedResource: Resource {
    const UPDATE_POLICY: UpdatePolicy;

    /// Requeue delay after deleting a drifted object.
    const RECREATE_BACKOFF: Duration = SHORT_REQUEUE;

    /// Copies the desired spec onto `self`, the observed object.
    fn adopt_spec(&mut self, _desired: &Self) {}

    /// Whether the observed object has converged, for callers that wait.
    fn readiness_satisfied(_desired: &Self, _observed: &Self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Decides whether a drifted recreate-kind object may be replaced now.
#[async_trait]
pub trait UpdateGate<K>: Send + Sync {
    async fn may_update(&self, desired: &K) -> ReconcileResult<bool>;
}

/// Gate that never defers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysUpdate;

#[async_trait]
impl<K: Resource> UpdateGate<K> for AlwaysUpdate {
    async fn may_update(&self, _desired: &K) -> ReconcileResult<bool> {
        Ok(true)
    }
}

/// Applies `desired` with no update gate.
pub async fn apply<K: ManagedResource>(
    client: &Client,
    desired: K,
    wait: bool,
) -> ReconcileResult<ApplyOutcome> {
    apply_gated(client, desired, wait, &AlwaysUpdate).await
}

/// Creates, updates or recreates `desired` so the stored object matches it.
///
/// With `wait`, a freshly created object and an object that has not met
/// [`ManagedResource::readiness_satisfied`] both yield a requeue.
pub async fn apply_gated<K, G>(
    client: &Client,
    mut desired: K,
    wait: bool,
    gate: &G,
) -> ReconcileResult<ApplyOutcome>
where
    K: ManagedResource,
    G: UpdateGate<K> + ?Sized,
{
    let stamp = creation_spec(&desired, ANNOTATIONS_POINTER, CREATION_SPEC_ANNOTATION)?;
    desired
        .meta_mut()
        .annotations
        .insert(CREATION_SPEC_ANNOTATION.to_string(), stamp);
    let key = desired.key();

    let Some(mut observed) = client.get_opt::<K>(&key).await? else {
        info!(kind = K::KIND, object = %key, "creating");
        match client.create(&desired).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(ReconcileError::requeue(
                    format!("{} {key} appeared concurrently", K::KIND),
                    CONFLICT_REQUEUE,
                ));
            }
            Err(e) => return Err(e.into()),
        }
        if wait {
            return Err(ReconcileError::requeue(
                format!("created {} {key}, waiting for it to become ready", K::KIND),
                SHORT_REQUEUE,
            ));
        }
        return Ok(ApplyOutcome::Created);
    };

    if observed.meta().is_marked_for_deletion() {
        return Err(ReconcileError::requeue(
            format!("{} {key} is still terminating", K::KIND),
            SHORT_REQUEUE,
        ));
    }

    let mut outcome = ApplyOutcome::Unchanged;
    if !creation_specs_equal(
        desired.meta().annotation(CREATION_SPEC_ANNOTATION),
        observed.meta().annotation(CREATION_SPEC_ANNOTATION),
    ) {
        match K::UPDATE_POLICY {
            UpdatePolicy::InPlace => {
                info!(kind = K::KIND, object = %key, "spec drifted, updating");
                adopt(&mut observed, &desired);
                observed = match client.update(&observed).await {
                    Ok(updated) => updated,
                    Err(e) if e.is_conflict() => {
                        return Err(ReconcileError::requeue(
                            format!("{} {key} changed while updating", K::KIND),
                            CONFLICT_REQUEUE,
                        ));
                    }
                    Err(e) => return Err(e.into()),
                };
                outcome = ApplyOutcome::Updated;
            }
            UpdatePolicy::Recreate => {
                if !gate.may_update(&desired).await? {
                    return Err(ReconcileError::requeue(
                        format!("{} {key} is not ready to be replaced", K::KIND),
                        SHORT_REQUEUE,
                    ));
                }
                info!(kind = K::KIND, object = %key, "spec drifted, recreating");
                match client.delete::<K>(&key).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                return Err(ReconcileError::requeue(
                    format!("{} {key} changed, recreating", K::KIND),
                    K::RECREATE_BACKOFF,
                ));
            }
        }
    } else {
        debug!(kind = K::KIND, object = %key, "no drift");
    }

    if wait && !K::readiness_satisfied(&desired, &observed) {
        return Err(ReconcileError::requeue(
            format!("waiting for {} {key} to become ready", K::KIND),
            SHORT_REQUEUE,
        ));
    }
    Ok(outcome)
}

/// Moves desired labels, annotations and spec onto the observed object,
/// keeping everything the server owns.
fn adopt<K: ManagedResource>(observed: &mut K, desired: &K) {
    let meta = observed.meta_mut();
    meta.labels = desired.meta().labels.clone();
    meta.annotations.extend(
        desired
            .meta()
            .annotations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    observed.adopt_spec(desired);
}

/// Writes back a read-modify-write change. A lost race becomes a short
/// requeue so the next pass starts from a fresh read.
pub async fn persist<K: Resource>(client: &Client, object: &K) -> ReconcileResult<K> {
    match client.update(object).await {
        Ok(updated) => Ok(updated),
        Err(e) if e.is_conflict() => Err(ReconcileError::requeue(
            format!("{} {} changed concurrently", K::KIND, object.key()),
            CONFLICT_REQUEUE,
        )),
        Err(e) => Err(e.into()),
    }
}
