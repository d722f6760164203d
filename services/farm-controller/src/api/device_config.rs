use droidfarm_reconcile::ConfigChecksum;
use serde::{Deserialize, Serialize};

use super::{
    ClaimSpec, Container, ContainerPort, EnvVar, ObjectMeta, ResourceRequirements, ServicePort,
};

pub const DEFAULT_ADB_PORT: u16 = 5555;
pub const DEFAULT_REDIR_IMAGE: &str = "ghcr.io/droidfarm/redir:latest";

/// Cluster-scoped, reusable device configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeviceConfigSpec,
}

/// Configuration of an emulated device. Every field is optional so that a
/// partial spec can be layered over a referenced base with [`merge`].
///
/// [`merge`]: DeviceConfigSpec::merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adb_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_ports: Option<Vec<ContainerPort>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_env_vars: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kvm_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_redir: Option<TcpRedirConfig>,
}

/// A persistent volume attached to every device using the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Claim names are `<prefix><device>`.
    pub volume_prefix: String,
    pub mount_point: String,
    #[serde(default)]
    pub claim_spec: ClaimSpec,
}

/// Sidecar that republishes the device's loopback-bound ADB port on the pod address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRedirConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<String>>,
}

impl TcpRedirConfig {
    fn merge(self, overrides: TcpRedirConfig) -> TcpRedirConfig {
        TcpRedirConfig {
            enabled: overrides.enabled.or(self.enabled),
            image: overrides.image.or(self.image),
            image_pull_policy: overrides.image_pull_policy.or(self.image_pull_policy),
            image_pull_secrets: overrides.image_pull_secrets.or(self.image_pull_secrets),
        }
    }
}

impl DeviceConfigSpec {
    /// Layers `overrides` over `self`. Fields present in `overrides` win; the
    /// redirect sidecar block is merged field by field.
    pub fn merge(self, overrides: DeviceConfigSpec) -> DeviceConfigSpec {
        let tcp_redir = match (self.tcp_redir, overrides.tcp_redir) {
            (Some(base), Some(over)) => Some(base.merge(over)),
            (base, over) => over.or(base),
        };
        DeviceConfigSpec {
            docker_image: overrides.docker_image.or(self.docker_image),
            image_pull_policy: overrides.image_pull_policy.or(self.image_pull_policy),
            image_pull_secrets: overrides.image_pull_secrets.or(self.image_pull_secrets),
            adb_port: overrides.adb_port.or(self.adb_port),
            command: overrides.command.or(self.command),
            args: overrides.args.or(self.args),
            extra_ports: overrides.extra_ports.or(self.extra_ports),
            extra_env_vars: overrides.extra_env_vars.or(self.extra_env_vars),
            kvm_enabled: overrides.kvm_enabled.or(self.kvm_enabled),
            volumes: overrides.volumes.or(self.volumes),
            resources: overrides.resources.or(self.resources),
            tcp_redir,
        }
    }

    /// Rollout identity of this configuration.
    pub fn checksum(&self) -> Result<ConfigChecksum, serde_json::Error> {
        ConfigChecksum::of(self)
    }

    pub fn adb_port(&self) -> u16 {
        match self.adb_port {
            Some(port) if port != 0 => port,
            _ => DEFAULT_ADB_PORT,
        }
    }

    pub fn kvm_enabled(&self) -> bool {
        self.kvm_enabled.unwrap_or(false)
    }

    pub fn redir_enabled(&self) -> bool {
        self.tcp_redir
            .as_ref()
            .and_then(|r| r.enabled)
            .unwrap_or(false)
    }

    pub fn redir_image(&self) -> &str {
        self.tcp_redir
            .as_ref()
            .and_then(|r| r.image.as_deref())
            .filter(|image| !image.is_empty())
            .unwrap_or(DEFAULT_REDIR_IMAGE)
    }

    pub fn adb_container_port(&self) -> ContainerPort {
        ContainerPort::named("adb", self.adb_port())
    }

    /// Ports of the device container. The ADB port moves to the sidecar when
    /// redirection is enabled.
    pub fn container_ports(&self) -> Vec<ContainerPort> {
        let mut ports = Vec::new();
        if !self.redir_enabled() {
            ports.push(self.adb_container_port());
        }
        ports.extend(self.extra_ports.iter().flatten().cloned());
        ports
    }

    pub fn service_ports(&self) -> Vec<ServicePort> {
        let mut ports = vec![ServicePort {
            name: Some("adb".to_string()),
            port: self.adb_port(),
        }];
        ports.extend(self.extra_ports.iter().flatten().map(|p| ServicePort {
            name: p.name.clone(),
            port: p.container_port,
        }));
        ports
    }

    pub fn env_vars(&self) -> Vec<EnvVar> {
        let mut env = vec![
            EnvVar::value("ANDROID_ARCH", "x86"),
            EnvVar::field("POD_IP", "status.podIP"),
        ];
        env.extend(self.extra_env_vars.iter().flatten().cloned());
        env
    }

    pub fn image_pull_secrets(&self) -> Vec<String> {
        let mut secrets: Vec<String> = self.image_pull_secrets.iter().flatten().cloned().collect();
        if let Some(redir) = &self.tcp_redir {
            secrets.extend(redir.image_pull_secrets.iter().flatten().cloned());
        }
        secrets
    }

    pub fn volumes(&self) -> &[VolumeConfig] {
        self.volumes.as_deref().unwrap_or_default()
    }

    pub fn sidecars(&self) -> Vec<Container> {
        if !self.redir_enabled() {
            return Vec::new();
        }
        vec![Container {
            name: "redir".to_string(),
            image: Some(self.redir_image().to_string()),
            image_pull_policy: Some(
                self.tcp_redir
                    .as_ref()
                    .and_then(|r| r.image_pull_policy.clone())
                    .unwrap_or_else(|| "IfNotPresent".to_string()),
            ),
            ports: vec![self.adb_container_port()],
            env: self.env_vars(),
            args: vec![
                format!("-target=127.0.0.1:{}", self.adb_port()),
                "-host=$(POD_IP)".to_string(),
            ],
            ..Container::default()
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DeviceConfigSpec {
        DeviceConfigSpec {
            docker_image: Some("emu:11".to_string()),
            adb_port: Some(5557),
            kvm_enabled: Some(true),
            tcp_redir: Some(TcpRedirConfig {
                enabled: Some(true),
                image: Some("redir:1".to_string()),
                ..TcpRedirConfig::default()
            }),
            ..DeviceConfigSpec::default()
        }
    }

    #[test]
    fn inline_fields_win() {
        let merged = base().merge(DeviceConfigSpec {
            docker_image: Some("emu:12".to_string()),
            ..DeviceConfigSpec::default()
        });
        assert_eq!(merged.docker_image.as_deref(), Some("emu:12"));
        assert_eq!(merged.adb_port(), 5557);
        assert!(merged.kvm_enabled());
    }

    #[test]
    fn redirect_block_merges_field_by_field() {
        let merged = base().merge(DeviceConfigSpec {
            tcp_redir: Some(TcpRedirConfig {
                image_pull_policy: Some("Always".to_string()),
                ..TcpRedirConfig::default()
            }),
            ..DeviceConfigSpec::default()
        });
        let redir = merged.tcp_redir.as_ref().unwrap();
        assert_eq!(redir.enabled, Some(true));
        assert_eq!(redir.image.as_deref(), Some("redir:1"));
        assert_eq!(redir.image_pull_policy.as_deref(), Some("Always"));
    }

    #[test]
    fn adb_port_defaults() {
        assert_eq!(DeviceConfigSpec::default().adb_port(), DEFAULT_ADB_PORT);
        let zero = DeviceConfigSpec {
            adb_port: Some(0),
            ..DeviceConfigSpec::default()
        };
        assert_eq!(zero.adb_port(), DEFAULT_ADB_PORT);
    }

    #[test]
    fn redirect_moves_adb_port_to_sidecar() {
        let spec = base();
        assert!(spec.container_ports().is_empty());
        let sidecars = spec.sidecars();
        assert_eq!(sidecars.len(), 1);
        assert_eq!(sidecars[0].ports[0].name.as_deref(), Some("adb"));
        assert_eq!(sidecars[0].args[0], "-target=127.0.0.1:5557");

        let plain = DeviceConfigSpec::default();
        assert_eq!(plain.container_ports(), vec![ContainerPort::named("adb", 5555)]);
        assert!(plain.sidecars().is_empty());
    }

    #[test]
    fn checksum_tracks_merged_fields() {
        let a = base().merge(DeviceConfigSpec::default());
        let b = base().merge(DeviceConfigSpec::default());
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());

        let c = base().merge(DeviceConfigSpec {
            args: Some(vec!["-no-window".to_string()]),
            ..DeviceConfigSpec::default()
        });
        assert_ne!(a.checksum().unwrap(), c.checksum().unwrap());
    }
}
