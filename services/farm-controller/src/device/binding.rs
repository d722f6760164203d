use std::collections::BTreeMap;

use droidfarm_id::ObjectKey;
use droidfarm_reconcile::{ReconcileError, ReconcileResult, SHORT_REQUEUE};
use tracing::{info, warn};

use crate::api::{
    Device, Farm, Job, Pod, Resource, ADB_CONNECTED_ANNOTATION, JOB_NAME_LABEL,
    PROVIDER_SERIAL_ANNOTATION,
};
use crate::apply::{apply, persist};
use crate::builders;
use crate::store::Client;

/// Binds a booted device to its farm-UI provider through a one-shot job.
///
/// Does nothing for devices without a provider endpoint or already bound.
/// The job is waited on through apply; once it has succeeded it is removed
/// together with its pods and the device is marked connected.
pub async fn bind_to_provider(
    client: &Client,
    device: &mut Device,
    pod: &Pod,
) -> ReconcileResult<()> {
    let Some(endpoint) = device.provider_endpoint().map(str::to_string) else {
        return Ok(());
    };
    if device.adb_connected() {
        return Ok(());
    }

    let Some(farm_name) = device.farm_name() else {
        return Err(ReconcileError::Config(format!(
            "device {} has a provider endpoint but no farm",
            device.key()
        )));
    };
    let farm: Farm = client.get(&ObjectKey::cluster(farm_name)).await?;

    let Some(port) = pod.named_port("adb") else {
        return Err(ReconcileError::Config(format!(
            "pod {} declares no port named adb",
            pod.key()
        )));
    };
    let Some(address) = builders::pod_address(pod) else {
        return Err(ReconcileError::requeue(
            "device has not been assigned an address yet",
            SHORT_REQUEUE,
        ));
    };
    let serial = format!("{address}:{port}");

    let job = builders::binding_job(&farm, pod, &endpoint, &serial);
    let job_key = job.key();
    apply(client, job, true).await?;

    cleanup_job(client, &job_key).await;

    info!(device = %device.key(), serial, "device bound to provider");
    let annotations = &mut device.metadata.annotations;
    annotations.insert(ADB_CONNECTED_ANNOTATION.to_string(), "true".to_string());
    annotations.insert(PROVIDER_SERIAL_ANNOTATION.to_string(), serial);
    *device = persist(client, device).await?;
    Ok(())
}

/// Best effort; the job's TTL catches whatever is left behind.
async fn cleanup_job(client: &Client, key: &ObjectKey) {
    match client.delete::<Job>(key).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(job = %key, error = %e, "could not clean up binding job"),
    }
    let selector = BTreeMap::from([(JOB_NAME_LABEL.to_string(), key.name.clone())]);
    if let Err(e) = client.delete_all::<Pod>(&key.namespace, &selector).await {
        warn!(job = %key, error = %e, "could not clean up binding job pods");
    }
}
