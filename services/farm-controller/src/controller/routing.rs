//! Maps control-plane events to the queues that must react to them.

use std::sync::Arc;
use std::time::Duration;

use droidfarm_id::ObjectKey;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::queue::WorkQueue;
use crate::api::{
    Deployment, Device, DeviceConfig, DeviceJob, Farm, Pod, Resource, StatefulSet, DEVICE_LABEL,
    FARM_LABEL,
};
use crate::store::{Client, Selector, StoreResult, WatchEvent};

#[derive(Clone)]
pub struct Router {
    client: Client,
    farms: Arc<WorkQueue>,
    devices: Arc<WorkQueue>,
    jobs: Arc<WorkQueue>,
}

impl Router {
    pub fn new(
        client: Client,
        farms: Arc<WorkQueue>,
        devices: Arc<WorkQueue>,
        jobs: Arc<WorkQueue>,
    ) -> Self {
        Self {
            client,
            farms,
            devices,
            jobs,
        }
    }

    pub async fn route(&self, event: &WatchEvent) -> StoreResult<()> {
        match event.kind.as_str() {
            kind if kind == Farm::KIND => self.farms.add(event.key.clone()).await,
            kind if kind == Device::KIND => {
                self.devices.add(event.key.clone()).await;
                if let Some(farm) = event.labels.get(FARM_LABEL) {
                    self.farms.add(ObjectKey::cluster(farm.clone())).await;
                }
            }
            kind if kind == Pod::KIND => {
                if let Some(device) = event.labels.get(DEVICE_LABEL) {
                    self.devices
                        .add(ObjectKey::new(event.key.namespace.clone(), device.clone()))
                        .await;
                }
            }
            kind if kind == Deployment::KIND || kind == StatefulSet::KIND => {
                if let Some(farm) = event.labels.get(FARM_LABEL) {
                    self.farms.add(ObjectKey::cluster(farm.clone())).await;
                }
            }
            kind if kind == DeviceJob::KIND => self.jobs.add(event.key.clone()).await,
            kind if kind == DeviceConfig::KIND => self.route_config(&event.key.name).await?,
            _ => {}
        }
        Ok(())
    }

    /// Queues every farm with a group built from `config`, and every device
    /// that references it directly.
    async fn route_config(&self, config: &str) -> StoreResult<()> {
        let farms: Vec<Farm> = self.client.list(None, &Selector::new()).await?;
        for farm in farms {
            if farm
                .groups()
                .iter()
                .any(|group| group.config_ref() == Some(config))
            {
                debug!(farm = %farm.metadata.name, config, "config change affects farm");
                self.farms.add(farm.key()).await;
            }
        }
        let devices: Vec<Device> = self.client.list(None, &Selector::new()).await?;
        for device in devices {
            if device.spec.config_ref.as_deref() == Some(config) {
                self.devices.add(device.key()).await;
            }
        }
        Ok(())
    }

    /// Queues every farm, device and device job.
    pub async fn resync(&self) -> StoreResult<()> {
        let all = Selector::new();
        for farm in self.client.list::<Farm>(None, &all).await? {
            self.farms.add(farm.key()).await;
        }
        for device in self.client.list::<Device>(None, &all).await? {
            self.devices.add(device.key()).await;
        }
        for job in self.client.list::<DeviceJob>(None, &all).await? {
            self.jobs.add(job.key()).await;
        }
        Ok(())
    }

    /// Feeds watch events and periodic resyncs into the queues until
    /// shutdown.
    pub async fn run(&self, resync_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_secs = resync_interval.as_secs(),
            "Starting event router"
        );
        let mut events = self.client.watch();
        let mut resync = tokio::time::interval(resync_interval);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.route(&event).await {
                            warn!(kind = %event.kind, key = %event.key, error = %e, "failed to route event");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event stream lagged, resyncing");
                        self.resync_logged().await;
                    }
                    Err(RecvError::Closed) => {
                        info!("event stream closed");
                        break;
                    }
                },
                _ = resync.tick() => self.resync_logged().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event router shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn resync_logged(&self) {
        if let Err(e) = self.resync().await {
            error!(error = %e, "resync failed");
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}
