//! Shared fixtures: an in-memory control plane, scripted devices and a
//! recording registry wired to the reconcilers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use droidfarm_controller::adb::FakeDeviceControl;
use droidfarm_controller::api::{
    ConcurrencyPolicy, Deployment, Device, DeviceConfig, DeviceConfigSpec, DeviceGroup,
    EmulatorConfig, Farm, FarmSpec, ObjectMeta, Pod, ProviderConfig, Resource, StatefulSet,
    BOOT_COMPLETED_ANNOTATION, FARM_LABEL,
};
use droidfarm_controller::registry::RecordingRegistry;
use droidfarm_controller::{
    Client, DeviceJobRunner, DeviceReconciler, FarmReconciler, MemoryControlPlane,
};
use droidfarm_id::ObjectKey;
use droidfarm_reconcile::ReconcileResult;
use serde_json::json;

pub const NAMESPACE: &str = "lab";
pub const CONFIG: &str = "pixel";
pub const PROVIDER_NAMESPACE: &str = "farm-ui";

pub struct Fleet {
    pub plane: Arc<MemoryControlPlane>,
    pub client: Client,
    pub devices: FakeDeviceControl,
    pub registry: Arc<RecordingRegistry>,
    pub farms: FarmReconciler,
    pub device_reconciler: DeviceReconciler,
    pub jobs: DeviceJobRunner,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_registry(RecordingRegistry::new())
    }

    pub fn with_registry(registry: RecordingRegistry) -> Self {
        let plane = Arc::new(MemoryControlPlane::new());
        let client = Client::new(plane.clone());
        let devices = FakeDeviceControl::new();
        let registry = Arc::new(registry);
        Self {
            farms: FarmReconciler::new(client.clone(), registry.clone()),
            device_reconciler: DeviceReconciler::new(
                client.clone(),
                Arc::new(devices.clone()),
                registry.clone(),
            ),
            jobs: DeviceJobRunner::new(client.clone(), Arc::new(devices.clone())),
            plane,
            client,
            devices,
            registry,
        }
    }

    /// Stores the base device configuration every fixture group refers to.
    pub async fn seed_config(&self) -> DeviceConfig {
        self.seed_config_with(DeviceConfigSpec {
            docker_image: Some("ghcr.io/droidfarm/emulator:13".to_string()),
            ..DeviceConfigSpec::default()
        })
        .await
    }

    pub async fn seed_config_with(&self, spec: DeviceConfigSpec) -> DeviceConfig {
        self.client
            .create(&DeviceConfig {
                metadata: ObjectMeta::new("", CONFIG),
                spec,
            })
            .await
            .unwrap()
    }

    pub async fn seed_farm(&self, farm: Farm) -> Farm {
        self.client.create(&farm).await.unwrap()
    }

    pub async fn reconcile_farm(&self, name: &str) -> ReconcileResult<()> {
        self.farms.reconcile(&ObjectKey::cluster(name)).await
    }

    pub async fn reconcile_device(&self, name: &str) -> ReconcileResult<()> {
        self.device_reconciler
            .reconcile(&ObjectKey::new(NAMESPACE, name))
            .await
    }

    pub async fn device(&self, name: &str) -> Option<Device> {
        self.client
            .get_opt(&ObjectKey::new(NAMESPACE, name))
            .await
            .unwrap()
    }

    pub async fn pod(&self, name: &str) -> Option<Pod> {
        self.client
            .get_opt(&ObjectKey::new(NAMESPACE, name))
            .await
            .unwrap()
    }

    /// Names of the stored devices in `group`, in ordinal order.
    pub async fn members(&self, group: &str) -> Vec<String> {
        let mut names: Vec<(u32, String)> = self
            .client
            .list::<Device>(Some(NAMESPACE), &Default::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.group_name() == Some(group))
            .filter_map(|d| {
                droidfarm_id::ordinal_of(&d.metadata.name)
                    .ok()
                    .map(|i| (i, d.metadata.name))
            })
            .collect();
        names.sort();
        names.into_iter().map(|(_, name)| name).collect()
    }

    /// Flags a device as booted, as its reconciler would.
    pub async fn mark_booted(&self, name: &str) {
        self.plane
            .modify(
                Device::KIND,
                &ObjectKey::new(NAMESPACE, name),
                |device| {
                    device["metadata"]["annotations"][BOOT_COMPLETED_ANNOTATION] = json!("true");
                },
            )
            .await
            .unwrap();
    }

    /// Flags every stored member of `group` as booted.
    pub async fn mark_group_booted(&self, group: &str) {
        for name in self.members(group).await {
            self.mark_booted(&name).await;
        }
    }

    /// Reports every provider-side workload of `farm` as fully ready.
    pub async fn mark_provider_ready(&self, farm: &str) {
        let selector = BTreeMap::from([(FARM_LABEL.to_string(), farm.to_string())]);
        for set in self
            .client
            .list::<StatefulSet>(Some(PROVIDER_NAMESPACE), &selector)
            .await
            .unwrap()
        {
            self.plane
                .set_ready_replicas(StatefulSet::KIND, &set.key(), set.spec.replicas)
                .await
                .unwrap();
        }
        for deployment in self
            .client
            .list::<Deployment>(Some(PROVIDER_NAMESPACE), &selector)
            .await
            .unwrap()
        {
            self.plane
                .set_ready_replicas(Deployment::KIND, &deployment.key(), deployment.spec.replicas)
                .await
                .unwrap();
        }
    }

    /// Drives the provider stages of `farm` until its workloads exist and
    /// are ready. Groups may or may not have been reached afterwards.
    pub async fn settle_provider(&self, farm: &str, groups: usize) {
        // Database, then one provider per group.
        for _ in 0..=groups {
            let _ = self.reconcile_farm(farm).await;
            self.mark_provider_ready(farm).await;
        }
    }

    pub async fn set_pod_ip(&self, name: &str, ip: &str) {
        self.plane
            .set_pod_ip(&ObjectKey::new(NAMESPACE, name), ip)
            .await
            .unwrap();
    }
}

pub fn group(name: &str, count: u32) -> DeviceGroup {
    DeviceGroup {
        name: name.to_string(),
        emulators: Some(EmulatorConfig {
            namespace: Some(NAMESPACE.to_string()),
            count,
            config_ref: Some(CONFIG.to_string()),
            ..EmulatorConfig::default()
        }),
        host_usb: None,
    }
}

pub fn farm(name: &str, groups: Vec<DeviceGroup>) -> Farm {
    Farm {
        metadata: ObjectMeta::new("", name),
        spec: FarmSpec {
            device_groups: groups,
            ..FarmSpec::default()
        },
    }
}

pub fn with_concurrency(mut farm: Farm, concurrency: u32) -> Farm {
    farm.spec.concurrency_policy = Some(ConcurrencyPolicy::ordered(concurrency));
    farm
}

pub fn with_provider(mut farm: Farm) -> Farm {
    farm.spec.provider = Some(ProviderConfig {
        namespace: Some(PROVIDER_NAMESPACE.to_string()),
        ..ProviderConfig::default()
    });
    farm
}

pub fn requeue_after(result: ReconcileResult<()>) -> Option<std::time::Duration> {
    match result {
        Err(e) => e.requeue_after(),
        Ok(()) => None,
    }
}
