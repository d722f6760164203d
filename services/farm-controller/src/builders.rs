//! Desired-object builders.

use std::collections::BTreeMap;

use crate::api::{
    Container, ContainerPort, Deployment, Device, DeviceConfigSpec, DeviceGroup, DeviceSpec,
    EnvVar, Farm, Job, JobSpec, ObjectMeta, PersistentVolumeClaim, Pod, PodSpec, PodTemplate,
    PodVolume, ReplicaSpec, ResourceRequirements, Resource, Service, ServicePort, ServiceSpec,
    StatefulSet, VolumeConfig, VolumeMount, CONFIG_CHECKSUM_ANNOTATION, CONFIG_LABEL,
    DEVICE_LABEL, FARM_LABEL, GROUP_LABEL, PROVIDER_ANNOTATION,
};

const KVM_VOLUME: &str = "kvm";
const KVM_DEVICE: &str = "/dev/kvm";
const DEFAULT_CONNECT_IMAGE: &str = "ghcr.io/droidfarm/adb-connect:latest";
const BINDING_JOB_TTL_SECS: u32 = 600;
const DEFAULT_PROVIDER_IMAGE: &str = "ghcr.io/droidfarm/provider:latest";
const DEFAULT_DATABASE_IMAGE: &str = "rethinkdb:2.4";
const PROVIDER_ADB_PORT: u16 = 5037;
const DATABASE_PORTS: [(&str, u16); 3] =
    [("admin-port", 8080), ("driver-port", 28015), ("cluster-port", 29015)];

/// Labels that tie workloads back to their device.
pub fn device_labels(device: &Device) -> BTreeMap<String, String> {
    let mut labels = device.metadata.labels.clone();
    labels.insert("app".to_string(), "android-device".to_string());
    labels.insert(DEVICE_LABEL.to_string(), device.metadata.name.clone());
    if let Some(config) = &device.spec.config_ref {
        labels.insert(CONFIG_LABEL.to_string(), config.clone());
    }
    labels
}

/// The Device object for member `index` of an emulated group.
pub fn device_for_group(farm: &Farm, group: &DeviceGroup, index: u32, checksum: &str) -> Device {
    let mut annotations = BTreeMap::new();
    if let Some(endpoint) = farm.provider_endpoint(&group.name) {
        annotations.insert(PROVIDER_ANNOTATION.to_string(), endpoint);
    }
    annotations.insert(CONFIG_CHECKSUM_ANNOTATION.to_string(), checksum.to_string());

    let mut labels = farm.device_labels(group);
    if let Some(config) = group.config_ref() {
        labels.insert(CONFIG_LABEL.to_string(), config.to_string());
    }

    Device {
        metadata: ObjectMeta {
            labels,
            annotations,
            owner_references: farm.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(group.namespace(), droidfarm_id::device_name(&group.name, index))
        },
        spec: DeviceSpec {
            config_ref: group.config_ref().map(str::to_string),
            device_config: group.inline_config().cloned(),
            hostname: group.hostname(index),
            subdomain: Some(group.subdomain().to_string()),
        },
    }
}

/// Headless service giving every member of the group a stable DNS name.
pub fn group_service(farm: &Farm, group: &DeviceGroup, config: &DeviceConfigSpec) -> Service {
    let selector = farm.device_labels(group);
    Service {
        metadata: ObjectMeta {
            labels: selector.clone(),
            owner_references: farm.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(group.namespace(), group.subdomain())
        },
        spec: ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: config.service_ports(),
            selector,
        },
    }
}

fn provider_labels(farm: &Farm, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (FARM_LABEL.to_string(), farm.metadata.name.clone()),
        ("app".to_string(), component.to_string()),
    ])
}

fn database_ports() -> Vec<ServicePort> {
    DATABASE_PORTS
        .iter()
        .map(|&(name, port)| ServicePort {
            name: Some(name.to_string()),
            port,
        })
        .collect()
}

/// Headless service fronting the provider database replicas.
pub fn database_service(farm: &Farm) -> Service {
    let labels = provider_labels(farm, "database");
    Service {
        metadata: ObjectMeta {
            labels: labels.clone(),
            owner_references: farm.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(farm.provider_namespace(), farm.database_name())
        },
        spec: ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: database_ports(),
            selector: labels,
        },
    }
}

/// Database the providers register devices in.
pub fn database_statefulset(farm: &Farm) -> StatefulSet {
    let provider = farm.spec.provider.clone().unwrap_or_default();
    let labels = provider_labels(farm, "database");
    let name = farm.database_name();
    StatefulSet {
        metadata: ObjectMeta {
            labels: labels.clone(),
            owner_references: farm.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(farm.provider_namespace(), name.clone())
        },
        spec: ReplicaSpec {
            replicas: provider.database_replicas(),
            service_name: Some(name.clone()),
            selector: labels.clone(),
            template: PodTemplate {
                labels,
                spec: PodSpec {
                    service_account_name: provider.service_account,
                    containers: vec![Container {
                        name: "database".to_string(),
                        image: Some(
                            provider
                                .database_image
                                .unwrap_or_else(|| DEFAULT_DATABASE_IMAGE.to_string()),
                        ),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: DATABASE_PORTS
                            .iter()
                            .map(|&(port_name, port)| ContainerPort::named(port_name, port))
                            .collect(),
                        env: vec![EnvVar::value(
                            "CLUSTER_SUFFIX",
                            format!("{name}.{}.svc", farm.provider_namespace()),
                        )],
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                },
            },
        },
        ..StatefulSet::default()
    }
}

/// Service exposing the provider of `group`; its DNS name is the endpoint
/// devices are bound to.
pub fn provider_service(farm: &Farm, group: &DeviceGroup) -> Service {
    let mut labels = provider_labels(farm, "provider");
    labels.insert(GROUP_LABEL.to_string(), group.name.clone());
    Service {
        metadata: ObjectMeta {
            labels: labels.clone(),
            owner_references: farm.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(farm.provider_namespace(), farm.provider_name(&group.name))
        },
        spec: ServiceSpec {
            cluster_ip: None,
            ports: vec![ServicePort {
                name: Some("adb".to_string()),
                port: PROVIDER_ADB_PORT,
            }],
            selector: labels,
        },
    }
}

/// Provider serving the devices of `group`, backed by the farm database.
pub fn provider_deployment(farm: &Farm, group: &DeviceGroup) -> Deployment {
    let provider = farm.spec.provider.clone().unwrap_or_default();
    let mut labels = provider_labels(farm, "provider");
    labels.insert(GROUP_LABEL.to_string(), group.name.clone());
    let name = farm.provider_name(&group.name);
    Deployment {
        metadata: ObjectMeta {
            labels: labels.clone(),
            owner_references: farm.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(farm.provider_namespace(), name.clone())
        },
        spec: ReplicaSpec {
            replicas: 1,
            service_name: None,
            selector: labels.clone(),
            template: PodTemplate {
                labels,
                spec: PodSpec {
                    service_account_name: provider.service_account,
                    containers: vec![Container {
                        name: "provider".to_string(),
                        image: Some(
                            provider
                                .provider_image
                                .unwrap_or_else(|| DEFAULT_PROVIDER_IMAGE.to_string()),
                        ),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: vec!["--name".to_string(), name],
                        ports: vec![ContainerPort::named("adb", PROVIDER_ADB_PORT)],
                        env: vec![EnvVar::value(
                            "DATABASE_HOST",
                            format!("{}.{}.svc", farm.database_name(), farm.provider_namespace()),
                        )],
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                },
            },
        },
        ..Deployment::default()
    }
}

/// The runtime pod of a device.
pub fn pod_for_device(device: &Device, config: &DeviceConfigSpec) -> Pod {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let kvm = config.kvm_enabled();
    if kvm {
        volumes.push(PodVolume {
            name: KVM_VOLUME.to_string(),
            host_path: Some(KVM_DEVICE.to_string()),
            claim_name: None,
        });
        mounts.push(VolumeMount {
            name: KVM_VOLUME.to_string(),
            mount_path: KVM_DEVICE.to_string(),
        });
    }

    let mut containers = vec![Container {
        name: device.metadata.name.clone(),
        image: config.docker_image.clone(),
        image_pull_policy: config.image_pull_policy.clone(),
        command: config.command.clone().unwrap_or_default(),
        args: config.args.clone().unwrap_or_default(),
        ports: config.container_ports(),
        env: config.env_vars(),
        volume_mounts: mounts,
        resources: config.resources.clone(),
        privileged: kvm.then_some(true),
        pre_stop: vec![
            "bash".to_string(),
            "-c".to_string(),
            "adb shell reboot -p".to_string(),
        ],
    }];
    containers.extend(config.sidecars());

    Pod {
        metadata: ObjectMeta {
            labels: device_labels(device),
            owner_references: device.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(device.metadata.namespace.clone(), device.metadata.name.clone())
        },
        spec: PodSpec {
            hostname: device.spec.hostname.clone(),
            subdomain: device.spec.subdomain.clone(),
            run_as_non_root: kvm.then_some(false),
            image_pull_secrets: config.image_pull_secrets(),
            volumes,
            containers,
            ..PodSpec::default()
        },
        ..Pod::default()
    }
}

/// Claim backing one configured volume of a device.
pub fn claim_for_device(device: &Device, volume: &VolumeConfig) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            labels: device_labels(device),
            owner_references: device.owner_reference().into_iter().collect(),
            ..ObjectMeta::new(
                device.metadata.namespace.clone(),
                format!("{}{}", volume.volume_prefix, device.metadata.name),
            )
        },
        spec: volume.claim_spec.clone(),
    }
}

/// Mounts a claim into the device container of `pod`.
pub fn attach_claim(pod: &mut Pod, claim: &PersistentVolumeClaim, volume: &VolumeConfig) {
    let name = claim.metadata.name.clone();
    pod.spec.volumes.push(PodVolume {
        name: name.clone(),
        host_path: None,
        claim_name: Some(name.clone()),
    });
    if let Some(container) = pod.spec.containers.first_mut() {
        container.volume_mounts.push(VolumeMount {
            name,
            mount_path: volume.mount_point.clone(),
        });
    }
}

/// Address the provider should dial: the stable DNS name when the pod has
/// one, else its IP.
pub fn pod_address(pod: &Pod) -> Option<String> {
    match (&pod.spec.hostname, &pod.spec.subdomain) {
        (Some(host), Some(sub)) if !host.is_empty() && !sub.is_empty() => {
            Some(format!("{host}.{sub}.{}", pod.metadata.namespace))
        }
        _ => pod.ip().map(str::to_string),
    }
}

pub fn binding_job_name(device: &str) -> String {
    format!("{device}-provider-connect")
}

/// One-shot job that attaches `serial` to the provider's command endpoint.
pub fn binding_job(farm: &Farm, pod: &Pod, endpoint: &str, serial: &str) -> Job {
    let provider = farm.spec.provider.clone().unwrap_or_default();
    let labels = pod.metadata.labels.clone();
    Job {
        metadata: ObjectMeta {
            labels: labels.clone(),
            ..ObjectMeta::new(farm.provider_namespace(), binding_job_name(&pod.metadata.name))
        },
        spec: JobSpec {
            ttl_seconds_after_finished: Some(BINDING_JOB_TTL_SECS),
            template: PodTemplate {
                labels,
                spec: PodSpec {
                    service_account_name: provider.service_account,
                    restart_policy: Some("OnFailure".to_string()),
                    containers: vec![Container {
                        name: "provider-connect".to_string(),
                        image: Some(
                            provider
                                .connect_image
                                .unwrap_or_else(|| DEFAULT_CONNECT_IMAGE.to_string()),
                        ),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: vec![
                            "--host".to_string(),
                            endpoint.to_string(),
                            "--connect".to_string(),
                            serial.to_string(),
                        ],
                        resources: Some(ResourceRequirements {
                            limits: BTreeMap::from([
                                ("cpu".to_string(), "100m".to_string()),
                                ("memory".to_string(), "128Mi".to_string()),
                            ]),
                            requests: BTreeMap::new(),
                        }),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                },
            },
        },
        ..Job::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{EmulatorConfig, FarmSpec, ProviderConfig, FARM_LABEL, GROUP_LABEL};

    fn farm() -> Farm {
        Farm {
            metadata: ObjectMeta {
                uid: Some("farm-uid".to_string()),
                ..ObjectMeta::new("", "lab")
            },
            spec: FarmSpec {
                device_groups: vec![DeviceGroup {
                    name: "g1".to_string(),
                    emulators: Some(EmulatorConfig {
                        namespace: Some("devices".to_string()),
                        count: 2,
                        hostname_template: Some("emu-{{ .Index }}".to_string()),
                        config_ref: Some("pixel".to_string()),
                        ..EmulatorConfig::default()
                    }),
                    host_usb: None,
                }],
                concurrency_policy: None,
                provider: Some(ProviderConfig {
                    namespace: Some("stf".to_string()),
                    ..ProviderConfig::default()
                }),
            },
        }
    }

    #[test]
    fn device_for_group_carries_identity() {
        let farm = farm();
        let device = device_for_group(&farm, &farm.spec.device_groups[0], 1, "sum");
        assert_eq!(device.metadata.name, "g1-1");
        assert_eq!(device.metadata.namespace, "devices");
        assert_eq!(device.metadata.label(FARM_LABEL), Some("lab"));
        assert_eq!(device.metadata.label(GROUP_LABEL), Some("g1"));
        assert_eq!(device.metadata.label(CONFIG_LABEL), Some("pixel"));
        assert_eq!(device.config_checksum(), Some("sum"));
        assert_eq!(device.provider_endpoint(), Some("lab-provider-g1.stf.svc"));
        assert_eq!(device.spec.hostname.as_deref(), Some("emu-1"));
        assert_eq!(device.metadata.owner_references[0].uid, "farm-uid");
    }

    #[test]
    fn provider_workloads_live_in_provider_namespace() {
        let farm = farm();
        let group = &farm.spec.device_groups[0];

        let db = database_statefulset(&farm);
        assert_eq!(db.key(), droidfarm_id::ObjectKey::new("stf", "lab-db"));
        assert_eq!(db.spec.replicas, 1);
        assert_eq!(db.spec.service_name.as_deref(), Some("lab-db"));
        assert_eq!(database_service(&farm).spec.cluster_ip.as_deref(), Some("None"));

        let provider = provider_deployment(&farm, group);
        let service = provider_service(&farm, group);
        assert_eq!(provider.metadata.name, "lab-provider-g1");
        assert_eq!(service.spec.selector, provider.spec.template.labels);
        assert_eq!(
            farm.provider_endpoint("g1"),
            Some(format!("{}.stf.svc", service.metadata.name))
        );
    }

    #[test]
    fn pod_address_prefers_dns_name() {
        let mut pod = Pod {
            metadata: ObjectMeta::new("devices", "g1-0"),
            ..Pod::default()
        };
        pod.status.pod_ip = Some("10.1.2.3".to_string());
        assert_eq!(pod_address(&pod).as_deref(), Some("10.1.2.3"));

        pod.spec.hostname = Some("emu-0".to_string());
        pod.spec.subdomain = Some("g1".to_string());
        assert_eq!(pod_address(&pod).as_deref(), Some("emu-0.g1.devices"));
    }

    #[test]
    fn kvm_pods_mount_the_device() {
        let device = Device {
            metadata: ObjectMeta::new("devices", "g1-0"),
            ..Device::default()
        };
        let config = DeviceConfigSpec {
            kvm_enabled: Some(true),
            ..DeviceConfigSpec::default()
        };
        let pod = pod_for_device(&device, &config);
        assert_eq!(pod.spec.volumes[0].host_path.as_deref(), Some(KVM_DEVICE));
        assert_eq!(pod.spec.containers[0].privileged, Some(true));
        assert_eq!(pod.named_port("adb"), Some(5555));
    }
}
