use std::sync::Arc;

use droidfarm_id::ObjectKey;
use droidfarm_reconcile::{ReconcileError, ReconcileResult, BOOT_MARK_REQUEUE, SHORT_REQUEUE};
use tracing::{debug, info, instrument, warn};

use super::binding::bind_to_provider;
use crate::adb::{DeviceControl, DeviceControlResult};
use crate::api::{
    Device, DeviceConfig, DeviceConfigSpec, PersistentVolumeClaim, Pod, Resource, VolumeConfig,
    BOOT_COMPLETED_ANNOTATION,
};
use crate::apply::{apply, persist, ApplyOutcome};
use crate::builders;
use crate::registry::{deregister, Registry};
use crate::store::Client;

/// Drives one device from pod creation through boot to provider binding.
///
/// Every wait is a requeue; only misconfiguration and control-plane
/// failures are fatal.
#[derive(Clone)]
pub struct DeviceReconciler {
    client: Client,
    devices: Arc<dyn DeviceControl>,
    registry: Arc<dyn Registry>,
}

impl DeviceReconciler {
    pub fn new(
        client: Client,
        devices: Arc<dyn DeviceControl>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            client,
            devices,
            registry,
        }
    }

    /// Reconciles the device stored under `key`. A missing device is done.
    #[instrument(skip(self), fields(device = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<()> {
        match self.client.get_opt::<Device>(key).await? {
            Some(device) => self.reconcile_device(device).await,
            None => {
                debug!("device no longer exists");
                Ok(())
            }
        }
    }

    pub async fn reconcile_device(&self, mut device: Device) -> ReconcileResult<()> {
        if device.metadata.is_marked_for_deletion() {
            if device.is_farmed() {
                deregister(self.registry.as_ref(), &device).await;
            }
            return Ok(());
        }

        let config = self.effective_config(&device).await?;

        let mut pod = builders::pod_for_device(&device, &config);
        for volume in config.volumes() {
            let claim = self.ensure_claim(&device, volume).await?;
            builders::attach_claim(&mut pod, &claim, volume);
        }
        if apply(&self.client, pod, false).await? == ApplyOutcome::Created {
            return Err(ReconcileError::requeue(
                "requeueing to check pod boot progress",
                SHORT_REQUEUE,
            ));
        }

        let Some(pod) = self.client.get_opt::<Pod>(&device.key()).await? else {
            return Err(ReconcileError::requeue(
                "pod for device not found",
                SHORT_REQUEUE,
            ));
        };
        let Some(ip) = pod.ip() else {
            return Err(ReconcileError::requeue(
                "device has not been assigned an address yet",
                SHORT_REQUEUE,
            ));
        };
        let Some(port) = pod.named_port("adb") else {
            return Err(ReconcileError::Config(format!(
                "pod {} declares no port named adb",
                pod.key()
            )));
        };
        let address = format!("{ip}:{port}");

        match self.boot_completed(&address).await {
            Ok(true) => {}
            Ok(false) => {
                self.reset_progress(&mut device).await?;
                return Err(ReconcileError::requeue(
                    "device is still booting",
                    SHORT_REQUEUE,
                ));
            }
            Err(e) => {
                warn!(address, error = %e, "boot check failed");
                self.reset_progress(&mut device).await?;
                return Err(ReconcileError::requeue(
                    format!("waiting for device control to catch up: {e}"),
                    SHORT_REQUEUE,
                ));
            }
        }

        if !device.boot_completed() {
            info!(address, "device finished booting");
            device
                .metadata
                .annotations
                .insert(BOOT_COMPLETED_ANNOTATION.to_string(), "true".to_string());
            persist(&self.client, &device).await?;
            return Err(ReconcileError::requeue(
                "marked device as booted",
                BOOT_MARK_REQUEUE,
            ));
        }

        bind_to_provider(&self.client, &mut device, &pod).await
    }

    /// Referenced base configuration with the device's inline overrides on top.
    pub async fn effective_config(&self, device: &Device) -> ReconcileResult<DeviceConfigSpec> {
        resolve_config(
            &self.client,
            &device.key().to_string(),
            device.spec.config_ref.as_deref(),
            device.spec.device_config.as_ref(),
        )
        .await
    }

    async fn ensure_claim(
        &self,
        device: &Device,
        volume: &VolumeConfig,
    ) -> ReconcileResult<PersistentVolumeClaim> {
        let desired = builders::claim_for_device(device, volume);
        if let Some(existing) = self
            .client
            .get_opt::<PersistentVolumeClaim>(&desired.key())
            .await?
        {
            return Ok(existing);
        }
        info!(claim = %desired.key(), "creating volume claim");
        Ok(self.client.create(&desired).await?)
    }

    async fn boot_completed(&self, address: &str) -> DeviceControlResult<bool> {
        let mut session = self.devices.connect(address).await?;
        let booted = session.is_boot_completed().await;
        session.close().await;
        booted
    }

    /// Clears stale progress flags so nothing downstream trusts them.
    async fn reset_progress(&self, device: &mut Device) -> ReconcileResult<()> {
        if device.reset_progress() {
            info!(device = %device.key(), "resetting boot and connection flags");
            *device = persist(&self.client, device).await?;
        }
        Ok(())
    }
}

/// Loads the configuration `config_ref` names and layers `inline` over it.
/// A dangling reference is a configuration error.
pub async fn resolve_config(
    client: &Client,
    owner: &str,
    config_ref: Option<&str>,
    inline: Option<&DeviceConfigSpec>,
) -> ReconcileResult<DeviceConfigSpec> {
    let base = match config_ref {
        Some(name) => match client.get_opt::<DeviceConfig>(&ObjectKey::cluster(name)).await? {
            Some(config) => config.spec,
            None => {
                return Err(ReconcileError::Config(format!(
                    "device config {name} referenced by {owner} does not exist"
                )));
            }
        },
        None => DeviceConfigSpec::default(),
    };
    Ok(match inline {
        Some(overrides) => base.merge(overrides.clone()),
        None => base,
    })
}

impl std::fmt::Debug for DeviceReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceReconciler").finish_non_exhaustive()
    }
}
