//! Farm-UI registry. Entries are cosmetic; failures never block the engine.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
#[error("registry error: {0}")]
pub struct RegistryError(pub String);

#[async_trait]
pub trait Registry: Send + Sync {
    /// Removes the device known by `serial`.
    async fn deregister(&self, serial: &str) -> Result<(), RegistryError>;
}

/// Registry that only logs. Used when no farm UI is reachable.
#[derive(Debug, Default)]
pub struct LoggingRegistry;

#[async_trait]
impl Registry for LoggingRegistry {
    async fn deregister(&self, serial: &str) -> Result<(), RegistryError> {
        info!(serial, "deregistering device");
        Ok(())
    }
}

/// Registry that remembers what it was asked to remove.
#[derive(Debug, Default)]
pub struct RecordingRegistry {
    removed: Mutex<Vec<String>>,
    failing: bool,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose every call fails after being recorded.
    pub fn failing() -> Self {
        Self {
            removed: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub async fn removed(&self) -> Vec<String> {
        self.removed.lock().await.clone()
    }
}

#[async_trait]
impl Registry for RecordingRegistry {
    async fn deregister(&self, serial: &str) -> Result<(), RegistryError> {
        self.removed.lock().await.push(serial.to_string());
        if self.failing {
            return Err(RegistryError(format!("cannot remove {serial}")));
        }
        Ok(())
    }
}

/// Removes a device from the registry if it was ever bound. Failures are
/// logged and swallowed.
pub async fn deregister(registry: &dyn Registry, device: &crate::api::Device) {
    let Some(serial) = device.provider_serial() else {
        debug!(device = %device.metadata.name, "device was never bound, nothing to deregister");
        return;
    };
    if let Err(e) = registry.deregister(serial).await {
        warn!(serial, error = %e, "failed to deregister device, leaving a stale entry");
    }
}
