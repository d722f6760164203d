use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{DeviceControl, DeviceControlError, DeviceControlResult, Session};

/// Scripted state of a device behind [`FakeDeviceControl`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FakeDevice {
    #[default]
    Booted,
    Booting,
    Offline,
    Unreachable,
}

#[derive(Debug, Default)]
struct FakeState {
    devices: HashMap<String, FakeDevice>,
    failing_commands: Vec<String>,
    commands: Vec<(String, bool, String)>,
    connects: usize,
}

/// In-process [`DeviceControl`] with scripted devices. Addresses without a
/// script behave as [`FakeDevice::Booted`].
#[derive(Debug, Clone, Default)]
pub struct FakeDeviceControl {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDeviceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, address: &str, device: FakeDevice) {
        self.state
            .lock()
            .await
            .devices
            .insert(address.to_string(), device);
    }

    /// Commands containing `needle` fail with a command error.
    pub async fn fail_commands_containing(&self, needle: &str) {
        self.state
            .lock()
            .await
            .failing_commands
            .push(needle.to_string());
    }

    /// Every command run so far as `(address, root, command)`.
    pub async fn commands(&self) -> Vec<(String, bool, String)> {
        self.state.lock().await.commands.clone()
    }

    pub async fn connects(&self) -> usize {
        self.state.lock().await.connects
    }

    async fn device(&self, address: &str) -> FakeDevice {
        self.state
            .lock()
            .await
            .devices
            .get(address)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeviceControl for FakeDeviceControl {
    async fn connect(&self, address: &str) -> DeviceControlResult<Box<dyn Session>> {
        self.state.lock().await.connects += 1;
        if self.device(address).await == FakeDevice::Unreachable {
            return Err(DeviceControlError::Transport(format!(
                "failed to connect to {address}"
            )));
        }
        info!(address, "[FAKE] connected");
        Ok(Box::new(FakeSession {
            address: address.to_string(),
            control: self.clone(),
        }))
    }
}

struct FakeSession {
    address: String,
    control: FakeDeviceControl,
}

impl FakeSession {
    async fn check_online(&self) -> DeviceControlResult<()> {
        match self.control.device(&self.address).await {
            FakeDevice::Offline => Err(DeviceControlError::Offline(self.address.clone())),
            FakeDevice::Unreachable => Err(DeviceControlError::Transport(format!(
                "device '{}' not found",
                self.address
            ))),
            FakeDevice::Booted | FakeDevice::Booting => Ok(()),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn is_boot_completed(&mut self) -> DeviceControlResult<bool> {
        self.check_online().await?;
        Ok(self.control.device(&self.address).await == FakeDevice::Booted)
    }

    async fn run_command(&mut self, root: bool, command: &str) -> DeviceControlResult<String> {
        self.check_online().await?;
        let mut state = self.control.state.lock().await;
        state
            .commands
            .push((self.address.clone(), root, command.to_string()));
        if state.failing_commands.iter().any(|n| command.contains(n)) {
            return Err(DeviceControlError::Command(format!("{command}: exit 1")));
        }
        Ok(String::new())
    }

    async fn close(&mut self) {}
}
