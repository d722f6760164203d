use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ObjectMeta;

/// Cluster-scoped, ordered list of actions to run on devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: JobTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplateSpec {
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    /// Run shell commands on the device.
    #[default]
    Command,
    /// Pause before the next action.
    Wait,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default)]
    pub activity: Activity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub run_as_root: bool,
    /// Shell commands; may reference `{{ .Name }}`, `{{ .Namespace }}` and `{{ .PodIP }}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default)]
    pub seconds: u64,
}

/// A scripted run of a [`JobTemplate`] against one device or a labelled set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceJob {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeviceJobSpec,
    #[serde(default)]
    pub status: DeviceJobStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_selector: BTreeMap<String, String>,
    pub job_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_creation: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceJobStatus {
    /// Per-device progress, keyed by device name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub job_status: BTreeMap<String, DeviceRunStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    #[default]
    Pending,
    Complete,
    Failed,
}

impl RunPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, RunPhase::Complete | RunPhase::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRunStatus {
    pub status: RunPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl DeviceRunStatus {
    pub fn new(status: RunPhase, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl DeviceJob {
    pub fn phase_of(&self, device: &str) -> RunPhase {
        self.status
            .job_status
            .get(device)
            .map(|s| s.status)
            .unwrap_or_default()
    }
}
