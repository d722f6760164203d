use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{DeviceConfigSpec, ObjectMeta, FARM_LABEL, GROUP_LABEL};

const DEFAULT_NAMESPACE: &str = "default";
const INDEX_FIELD: &str = ".Index";
const DEFAULT_DATABASE_REPLICAS: u32 = 1;

/// Desired-state root of a device fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Farm {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: FarmSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmSpec {
    #[serde(default)]
    pub device_groups: Vec<DeviceGroup>,
    /// Default rollout policy for groups that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    /// Farm-UI provider settings. Devices are not bound when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// Image of the one-shot job that binds a device to its provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_image: Option<String>,
    /// Image of the per-group provider deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_image: Option<String>,
    /// Image of the database the providers register devices in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_replicas: Option<u32>,
}

impl ProviderConfig {
    pub fn database_replicas(&self) -> u32 {
        self.database_replicas
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_DATABASE_REPLICAS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulators: Option<EmulatorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_usb: Option<HostUsbConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmulatorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub count: u32,
    /// Hostname of each member; `{{ .Index }}` expands to its ordinal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_config: Option<DeviceConfigSpec>,
}

/// Physical devices attached to a node. Declared for completeness; the
/// engine only manages emulated groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostUsbConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub max_devices: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    #[default]
    OrderedReady,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyPolicy {
    #[serde(default)]
    pub policy_kind: PolicyKind,
    #[serde(default)]
    pub concurrency: u32,
}

impl ConcurrencyPolicy {
    pub fn ordered(concurrency: u32) -> Self {
        Self {
            policy_kind: PolicyKind::OrderedReady,
            concurrency,
        }
    }

    /// Effective width; an unset concurrency means one at a time.
    pub fn concurrency(&self) -> u32 {
        self.concurrency.max(1)
    }
}

impl Farm {
    pub fn groups(&self) -> &[DeviceGroup] {
        &self.spec.device_groups
    }

    pub fn group(&self, name: &str) -> Option<&DeviceGroup> {
        self.groups().iter().find(|g| g.name == name)
    }

    /// Group-level policy first, then the farm default.
    pub fn concurrency_policy(&self, group: &str) -> Option<&ConcurrencyPolicy> {
        self.group(group)
            .and_then(|g| g.emulators.as_ref())
            .and_then(|e| e.concurrency_policy.as_ref())
            .or(self.spec.concurrency_policy.as_ref())
    }

    /// Selector matching every device of this farm.
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(FARM_LABEL.to_string(), self.metadata.name.clone())])
    }

    /// Desired member count of every emulated group.
    pub fn desired_counts(&self) -> BTreeMap<&str, u32> {
        self.groups()
            .iter()
            .filter(|g| g.is_emulated())
            .map(|g| (g.name.as_str(), g.count()))
            .collect()
    }

    pub fn provider_namespace(&self) -> &str {
        self.spec
            .provider
            .as_ref()
            .and_then(|p| p.namespace.as_deref())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Prefix of every provider-side object name. Defaults to the farm name.
    pub fn provider_prefix(&self) -> &str {
        self.spec
            .provider
            .as_ref()
            .and_then(|p| p.name_prefix.as_deref())
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.metadata.name)
    }

    /// Name of the deployment and service of the provider serving `group`.
    pub fn provider_name(&self, group: &str) -> String {
        format!("{}-provider-{group}", self.provider_prefix())
    }

    pub fn database_name(&self) -> String {
        format!("{}-db", self.provider_prefix())
    }

    /// Command endpoint of the provider serving `group`, when binding is enabled.
    pub fn provider_endpoint(&self, group: &str) -> Option<String> {
        self.spec.provider.as_ref()?;
        Some(format!(
            "{}.{}.svc",
            self.provider_name(group),
            self.provider_namespace()
        ))
    }

    /// Labels stamped on every device of `group`.
    pub fn device_labels(&self, group: &DeviceGroup) -> BTreeMap<String, String> {
        BTreeMap::from([
            (FARM_LABEL.to_string(), self.metadata.name.clone()),
            (GROUP_LABEL.to_string(), group.name.clone()),
        ])
    }
}

impl DeviceGroup {
    pub fn is_emulated(&self) -> bool {
        self.emulators.is_some() && self.host_usb.is_none()
    }

    pub fn namespace(&self) -> &str {
        self.emulators
            .as_ref()
            .and_then(|e| e.namespace.as_deref())
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn count(&self) -> u32 {
        self.emulators.as_ref().map_or(0, |e| e.count)
    }

    /// Subdomain of the group's headless service. Defaults to the group name.
    pub fn subdomain(&self) -> &str {
        self.emulators
            .as_ref()
            .and_then(|e| e.subdomain.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }

    pub fn config_ref(&self) -> Option<&str> {
        self.emulators.as_ref().and_then(|e| e.config_ref.as_deref())
    }

    pub fn inline_config(&self) -> Option<&DeviceConfigSpec> {
        self.emulators.as_ref().and_then(|e| e.device_config.as_ref())
    }

    /// Expands the hostname template for the member at `index`. Actions are
    /// `{{ .Index }}` with any inner spacing; a template with any other
    /// action falls back to no hostname.
    pub fn hostname(&self, index: u32) -> Option<String> {
        let template = self
            .emulators
            .as_ref()
            .and_then(|e| e.hostname_template.as_deref())
            .filter(|t| !t.is_empty())?;
        let rendered = expand_index(template, index);
        if rendered.is_none() {
            warn!(group = %self.name, template, "unsupported hostname template, using default hostname");
        }
        rendered
    }
}

fn expand_index(template: &str, index: u32) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}")?;
        if after[..end].trim() != INDEX_FIELD {
            return None;
        }
        out.push_str(&index.to_string());
        rest = &after[end + 2..];
    }
    if rest.contains("}}") {
        return None;
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn group(name: &str, count: u32) -> DeviceGroup {
        DeviceGroup {
            name: name.to_string(),
            emulators: Some(EmulatorConfig {
                count,
                ..EmulatorConfig::default()
            }),
            host_usb: None,
        }
    }

    #[test]
    fn group_policy_overrides_farm_default() {
        let mut g1 = group("g1", 3);
        if let Some(e) = g1.emulators.as_mut() {
            e.concurrency_policy = Some(ConcurrencyPolicy::ordered(4));
        }
        let farm = Farm {
            metadata: ObjectMeta::new("", "lab"),
            spec: FarmSpec {
                device_groups: vec![g1, group("g2", 1)],
                concurrency_policy: Some(ConcurrencyPolicy::ordered(2)),
                provider: None,
            },
        };
        assert_eq!(farm.concurrency_policy("g1").map(|p| p.concurrency()), Some(4));
        assert_eq!(farm.concurrency_policy("g2").map(|p| p.concurrency()), Some(2));
    }

    #[test]
    fn zero_concurrency_means_one() {
        assert_eq!(ConcurrencyPolicy::ordered(0).concurrency(), 1);
    }

    #[test]
    fn usb_groups_are_not_counted() {
        let mut usb = group("usb", 2);
        usb.host_usb = Some(HostUsbConfig::default());
        let farm = Farm {
            metadata: ObjectMeta::new("", "lab"),
            spec: FarmSpec {
                device_groups: vec![group("g1", 5), usb],
                ..FarmSpec::default()
            },
        };
        let counts = farm.desired_counts();
        assert_eq!(counts.get("g1"), Some(&5));
        assert!(!counts.contains_key("usb"));
    }

    #[rstest]
    #[case("emu-{{ .Index }}", Some("emu-7"))]
    #[case("emu-{{.Index}}", Some("emu-7"))]
    #[case("{{  .Index }}-{{.Index}}", Some("7-7"))]
    #[case("static", Some("static"))]
    #[case("emu-{{ .Index", None)]
    #[case("emu-{{ .Serial }}", None)]
    #[case("emu-}}", None)]
    fn hostname_template_spellings(#[case] template: &str, #[case] expected: Option<&str>) {
        let mut g = group("g1", 1);
        if let Some(e) = g.emulators.as_mut() {
            e.hostname_template = Some(template.to_string());
        }
        assert_eq!(g.hostname(7).as_deref(), expected);
    }

    #[test]
    fn hostname_template_expands_index() {
        let mut g = group("g1", 1);
        if let Some(e) = g.emulators.as_mut() {
            e.hostname_template = Some("emu-{{ .Index }}".to_string());
        }
        assert_eq!(g.hostname(7).as_deref(), Some("emu-7"));

        if let Some(e) = g.emulators.as_mut() {
            e.hostname_template = Some("emu-{{ .Serial }}".to_string());
        }
        assert_eq!(g.hostname(7), None);
    }

    #[test]
    fn provider_endpoint_uses_prefix_and_namespace() {
        let farm = Farm {
            metadata: ObjectMeta::new("", "lab"),
            spec: FarmSpec {
                provider: Some(ProviderConfig {
                    namespace: Some("stf".to_string()),
                    ..ProviderConfig::default()
                }),
                ..FarmSpec::default()
            },
        };
        assert_eq!(
            farm.provider_endpoint("g1").as_deref(),
            Some("lab-provider-g1.stf.svc")
        );
        assert_eq!(Farm::default().provider_endpoint("g1"), None);
    }

    #[test]
    fn subdomain_defaults_to_group_name() {
        assert_eq!(group("g1", 1).subdomain(), "g1");
        assert_eq!(group("g1", 1).namespace(), "default");
    }
}
