//! Object model for the farm controller.
//!
//! Everything the engine reads or writes is a [`Resource`]: a serde-able
//! object with an [`ObjectMeta`]. Annotations double as the engine's durable
//! state (drift stamp, rollout identity, boot and binding progress).

mod device;
mod device_config;
mod farm;
mod job;
mod meta;
mod workloads;

pub use device::{Device, DeviceSpec};
pub use device_config::{
    DeviceConfig, DeviceConfigSpec, TcpRedirConfig, VolumeConfig, DEFAULT_ADB_PORT,
    DEFAULT_REDIR_IMAGE,
};
pub use farm::{
    ConcurrencyPolicy, DeviceGroup, EmulatorConfig, Farm, FarmSpec, HostUsbConfig, PolicyKind,
    ProviderConfig,
};
pub use job::{
    Action, Activity, DeviceJob, DeviceJobSpec, DeviceJobStatus, DeviceRunStatus, JobTemplate,
    JobTemplateSpec, RunPhase,
};
pub use meta::{ObjectMeta, OwnerReference};
pub use workloads::{
    ClaimSpec, ConfigMap, Container, ContainerPort, Deployment, EnvVar, Job, JobSpec, JobStatus,
    PersistentVolumeClaim, Pod, PodSpec, PodStatus, PodTemplate, PodVolume, ReplicaSpec,
    ReplicaStatus, ResourceRequirements, Service, ServicePort, ServiceSpec, StatefulSet,
    VolumeMount,
};

use droidfarm_id::ObjectKey;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialized desired form of an object, stamped onto the object itself.
pub const CREATION_SPEC_ANNOTATION: &str = "droidfarm.io/creation-spec";
/// Command endpoint of the farm-UI provider a device should bind to.
pub const PROVIDER_ANNOTATION: &str = "droidfarm.io/provider";
/// Set to "true" once the device is bound to its provider.
pub const ADB_CONNECTED_ANNOTATION: &str = "droidfarm.io/adb-connected";
/// Set to "true" once the device reports boot completion.
pub const BOOT_COMPLETED_ANNOTATION: &str = "droidfarm.io/boot-completed";
/// Checksum of the device's effective configuration.
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "droidfarm.io/device-config-checksum";
/// Serial the provider knows the device by.
pub const PROVIDER_SERIAL_ANNOTATION: &str = "droidfarm.io/provider-serial";

/// Farm that a device belongs to.
pub const FARM_LABEL: &str = "droidfarm.io/farm";
/// Group that a device belongs to.
pub const GROUP_LABEL: &str = "droidfarm.io/group";
/// Device configuration a device was built from.
pub const CONFIG_LABEL: &str = "droidfarm.io/config";
/// Set on device pods, naming their device.
pub const DEVICE_LABEL: &str = "device";
/// Set on pods spawned for a one-shot job.
pub const JOB_NAME_LABEL: &str = "job-name";

/// JSON pointer of the annotation map inside any serialized resource.
pub const ANNOTATIONS_POINTER: &str = "/metadata/annotations";

/// A control-plane object.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name used to address the object in the control plane.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(meta.namespace.clone(), meta.name.clone())
    }

    fn name(&self) -> &str {
        &self.meta().name
    }

    /// Owner reference pointing at this object. Requires an assigned uid.
    fn owner_reference(&self) -> Option<OwnerReference> {
        let meta = self.meta();
        meta.uid.as_ref().map(|uid| OwnerReference {
            kind: Self::KIND.to_string(),
            name: meta.name.clone(),
            uid: uid.clone(),
            controller: true,
        })
    }
}

macro_rules! impl_resource {
    ($($ty:ty => $kind:literal),+ $(,)?) => {
        $(
            impl Resource for $ty {
                const KIND: &'static str = $kind;

                fn meta(&self) -> &ObjectMeta {
                    &self.metadata
                }

                fn meta_mut(&mut self) -> &mut ObjectMeta {
                    &mut self.metadata
                }
            }
        )+
    };
}

impl_resource!(
    Farm => "Farm",
    Device => "Device",
    DeviceConfig => "DeviceConfig",
    DeviceJob => "DeviceJob",
    JobTemplate => "JobTemplate",
    Pod => "Pod",
    Service => "Service",
    ConfigMap => "ConfigMap",
    Deployment => "Deployment",
    StatefulSet => "StatefulSet",
    Job => "Job",
    PersistentVolumeClaim => "PersistentVolumeClaim",
);
