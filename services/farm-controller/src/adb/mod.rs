//! Device-control sessions over ADB.
//!
//! A [`Session`] is exclusive per device address and holds a lease on the
//! shared ADB server; both are released when the session is closed or
//! dropped.

mod command;
mod fake;
mod supervisor;

pub use command::{classify, shell_args, Adb, AdbDeviceControl, AdbServer};
pub use fake::{FakeDevice, FakeDeviceControl};
pub use supervisor::{
    AddressGuard, AddressLocks, AdbServerSupervisor, ServerControl, ServerLease,
};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceControlError {
    #[error("device {0} is offline")]
    Offline(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// The device answered but the command failed.
    #[error("command failed: {0}")]
    Command(String),
}

impl DeviceControlError {
    /// Connectivity problems that go away on their own.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeviceControlError::Command(_))
    }
}

pub type DeviceControlResult<T> = Result<T, DeviceControlError>;

/// Opens sessions to devices.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Connects to `address` (`host:port`), waiting for any session already
    /// open on the same address to finish.
    async fn connect(&self, address: &str) -> DeviceControlResult<Box<dyn Session>>;
}

#[async_trait]
pub trait Session: Send {
    fn address(&self) -> &str;

    async fn is_boot_completed(&mut self) -> DeviceControlResult<bool>;

    /// Runs a shell command, optionally as root, and returns its output.
    async fn run_command(&mut self, root: bool, command: &str) -> DeviceControlResult<String>;

    async fn close(&mut self);
}
