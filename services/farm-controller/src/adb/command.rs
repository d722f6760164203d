use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::supervisor::{
    AddressGuard, AddressLocks, AdbServerSupervisor, ServerControl, ServerLease,
};
use super::{DeviceControl, DeviceControlError, DeviceControlResult, Session};

/// Maps failed ADB output to an error kind.
pub fn classify(output: &str) -> DeviceControlError {
    let lower = output.to_ascii_lowercase();
    let message = output.trim().to_string();
    if lower.contains("offline") {
        DeviceControlError::Offline(message)
    } else if [
        "failed to connect",
        "cannot connect",
        "unable to connect",
        "connection refused",
        "no route to host",
        "not found",
        "no devices",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        DeviceControlError::Transport(message)
    } else {
        DeviceControlError::Command(message)
    }
}

/// Arguments for running `command` in a shell on `device`.
pub fn shell_args(device: &str, root: bool, command: &str) -> Vec<String> {
    let mut args = vec!["-s".to_string(), device.to_string(), "shell".to_string()];
    if root {
        args.push("su".to_string());
        args.push("root".to_string());
    }
    args.push(command.to_string());
    args
}

/// The `adb` executable.
#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
    timeout: Duration,
}

impl Adb {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub async fn run(&self, args: &[String]) -> DeviceControlResult<String> {
        debug!(args = ?args, "running adb");
        let child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| DeviceControlError::Timeout {
                what: format!("adb {}", args.join(" ")),
                after: self.timeout,
            })?
            .map_err(|e| DeviceControlError::Transport(format!("cannot run adb: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(&format!("{stdout}{stderr}")));
        }
        Ok(stdout)
    }
}

/// Server control through `adb start-server` / `adb kill-server`.
#[derive(Debug, Clone)]
pub struct AdbServer {
    adb: Adb,
}

impl AdbServer {
    pub fn new(adb: Adb) -> Self {
        Self { adb }
    }
}

#[async_trait]
impl ServerControl for AdbServer {
    async fn start(&self) -> DeviceControlResult<()> {
        self.adb.run(&["start-server".to_string()]).await.map(drop)
    }

    async fn stop(&self) -> DeviceControlResult<()> {
        self.adb.run(&["kill-server".to_string()]).await.map(drop)
    }
}

/// [`DeviceControl`] backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbDeviceControl {
    adb: Adb,
    supervisor: Arc<AdbServerSupervisor>,
    locks: Arc<AddressLocks>,
}

impl AdbDeviceControl {
    pub fn new(adb: Adb) -> Self {
        let supervisor = AdbServerSupervisor::new(Arc::new(AdbServer::new(adb.clone())));
        Self {
            adb,
            supervisor,
            locks: Arc::new(AddressLocks::new()),
        }
    }
}

#[async_trait]
impl DeviceControl for AdbDeviceControl {
    async fn connect(&self, address: &str) -> DeviceControlResult<Box<dyn Session>> {
        let guard = self.locks.lock(address).await;
        let lease = self.supervisor.acquire().await?;
        let out = self
            .adb
            .run(&["connect".to_string(), address.to_string()])
            .await?;
        // `adb connect` exits zero on most failures.
        if !out.contains("connected") || out.contains("failed") || out.contains("cannot") {
            lease.release().await;
            return Err(classify(&out));
        }
        Ok(Box::new(AdbSession {
            address: address.to_string(),
            adb: self.adb.clone(),
            lease: Some(lease),
            _guard: guard,
        }))
    }
}

struct AdbSession {
    address: String,
    adb: Adb,
    lease: Option<ServerLease>,
    _guard: AddressGuard,
}

#[async_trait]
impl Session for AdbSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn is_boot_completed(&mut self) -> DeviceControlResult<bool> {
        let out = self.run_command(false, "getprop sys.boot_completed").await?;
        Ok(out.trim() == "1")
    }

    async fn run_command(&mut self, root: bool, command: &str) -> DeviceControlResult<String> {
        self.adb
            .run(&shell_args(&self.address, root, command))
            .await
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .adb
            .run(&["disconnect".to_string(), self.address.clone()])
            .await
        {
            warn!(address = %self.address, error = %e, "adb disconnect failed");
        }
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}
