use serde::{Deserialize, Serialize};

use super::{
    DeviceConfigSpec, ObjectMeta, ADB_CONNECTED_ANNOTATION, BOOT_COMPLETED_ANNOTATION,
    CONFIG_CHECKSUM_ANNOTATION, FARM_LABEL, GROUP_LABEL, PROVIDER_ANNOTATION,
    PROVIDER_SERIAL_ANNOTATION,
};

/// One fleet member. Progress through boot and binding is recorded in
/// annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeviceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<String>,
    /// Inline overrides layered over the referenced configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_config: Option<DeviceConfigSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

impl Device {
    /// Devices created by a farm carry its label.
    pub fn is_farmed(&self) -> bool {
        self.farm_name().is_some()
    }

    pub fn farm_name(&self) -> Option<&str> {
        self.metadata.label(FARM_LABEL).filter(|f| !f.is_empty())
    }

    pub fn group_name(&self) -> Option<&str> {
        self.metadata.label(GROUP_LABEL).filter(|g| !g.is_empty())
    }

    pub fn boot_completed(&self) -> bool {
        self.metadata.flag(BOOT_COMPLETED_ANNOTATION)
    }

    pub fn adb_connected(&self) -> bool {
        self.metadata.flag(ADB_CONNECTED_ANNOTATION)
    }

    pub fn config_checksum(&self) -> Option<&str> {
        self.metadata.annotation(CONFIG_CHECKSUM_ANNOTATION)
    }

    pub fn provider_endpoint(&self) -> Option<&str> {
        self.metadata.annotation(PROVIDER_ANNOTATION)
    }

    pub fn provider_serial(&self) -> Option<&str> {
        self.metadata.annotation(PROVIDER_SERIAL_ANNOTATION)
    }

    /// Flips the connected and boot-completed flags back to "false" where
    /// they are currently "true". Returns whether anything changed.
    pub fn reset_progress(&mut self) -> bool {
        let mut changed = false;
        for key in [ADB_CONNECTED_ANNOTATION, BOOT_COMPLETED_ANNOTATION] {
            if let Some(value) = self.metadata.annotations.get_mut(key) {
                if value == "true" {
                    *value = "false".to_string();
                    changed = true;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_only_touches_true_flags() {
        let mut device = Device::default();
        assert!(!device.reset_progress());

        device
            .metadata
            .annotations
            .insert(BOOT_COMPLETED_ANNOTATION.to_string(), "true".to_string());
        device
            .metadata
            .annotations
            .insert(ADB_CONNECTED_ANNOTATION.to_string(), "false".to_string());
        assert!(device.reset_progress());
        assert!(!device.boot_completed());
        assert_eq!(
            device.metadata.annotation(ADB_CONNECTED_ANNOTATION),
            Some("false")
        );
        assert!(!device.reset_progress());
    }

    #[test]
    fn unlabeled_device_is_not_farmed() {
        let mut device = Device::default();
        assert!(!device.is_farmed());
        device
            .metadata
            .labels
            .insert(FARM_LABEL.to_string(), "lab".to_string());
        assert_eq!(device.farm_name(), Some("lab"));
    }
}
