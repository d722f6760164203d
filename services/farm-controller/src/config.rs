//! Controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::controller::DispatcherConfig;
use crate::store::ControlPlane;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Period of the full resync of farms, devices and device jobs.
    pub resync_interval: Duration,

    /// Reconciles in flight per kind.
    pub max_concurrent_reconciles: usize,

    /// Backoff after the first fatal reconcile error of a key.
    pub error_backoff: Duration,

    /// Upper bound on the fatal-error backoff.
    pub max_error_backoff: Duration,

    /// Period of the device job TTL sweep.
    pub job_ttl_sweep_interval: Duration,

    /// Device-control executable.
    pub adb_path: PathBuf,

    /// Timeout for a single device-control command.
    pub adb_timeout: Duration,

    /// Objects to seed the in-memory control plane with.
    pub manifest: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            log_level: "info".to_string(),
            resync_interval: dispatcher.resync_interval,
            max_concurrent_reconciles: dispatcher.max_concurrent_reconciles,
            error_backoff: dispatcher.error_backoff,
            max_error_backoff: dispatcher.max_error_backoff,
            job_ttl_sweep_interval: Duration::from_secs(10),
            adb_path: PathBuf::from("adb"),
            adb_timeout: Duration::from_secs(10),
            manifest: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{name} must be a whole number of seconds, got {raw:?}")),
                None => Ok(default),
            }
        };

        let max_concurrent_reconciles = match lookup("DROIDFARM_MAX_CONCURRENT_RECONCILES") {
            Some(raw) => raw.trim().parse::<usize>().with_context(|| {
                format!("DROIDFARM_MAX_CONCURRENT_RECONCILES must be a number, got {raw:?}")
            })?,
            None => defaults.max_concurrent_reconciles,
        };
        if max_concurrent_reconciles == 0 {
            bail!("DROIDFARM_MAX_CONCURRENT_RECONCILES must be at least 1");
        }

        let config = Self {
            log_level: lookup("DROIDFARM_LOG_LEVEL").unwrap_or(defaults.log_level),
            resync_interval: secs("DROIDFARM_RESYNC_INTERVAL_SECS", defaults.resync_interval)?,
            max_concurrent_reconciles,
            error_backoff: secs("DROIDFARM_ERROR_BACKOFF_SECS", defaults.error_backoff)?,
            max_error_backoff: secs("DROIDFARM_MAX_ERROR_BACKOFF_SECS", defaults.max_error_backoff)?,
            job_ttl_sweep_interval: secs(
                "DROIDFARM_JOB_TTL_SWEEP_SECS",
                defaults.job_ttl_sweep_interval,
            )?,
            adb_path: lookup("DROIDFARM_ADB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.adb_path),
            adb_timeout: secs("DROIDFARM_ADB_TIMEOUT_SECS", defaults.adb_timeout)?,
            manifest: lookup("DROIDFARM_MANIFEST")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        };

        if config.resync_interval.is_zero() || config.job_ttl_sweep_interval.is_zero() {
            bail!("resync and TTL sweep intervals must be non-zero");
        }
        if config.error_backoff > config.max_error_backoff {
            bail!("DROIDFARM_ERROR_BACKOFF_SECS exceeds DROIDFARM_MAX_ERROR_BACKOFF_SECS");
        }
        Ok(config)
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            resync_interval: self.resync_interval,
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            error_backoff: self.error_backoff,
            max_error_backoff: self.max_error_backoff,
        }
    }
}

/// Reads a manifest: a JSON array of objects, each carrying its `kind`.
pub fn load_manifest(path: &Path) -> Result<Vec<(String, Value)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    parse_manifest(&raw).with_context(|| format!("invalid manifest {}", path.display()))
}

pub fn parse_manifest(raw: &str) -> Result<Vec<(String, Value)>> {
    let Value::Array(items) = serde_json::from_str(raw)? else {
        bail!("manifest must be a JSON array");
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let kind = item
                .get("kind")
                .and_then(Value::as_str)
                .with_context(|| format!("manifest entry {i} has no kind"))?
                .to_string();
            if item.pointer("/metadata/name").and_then(Value::as_str).is_none() {
                bail!("manifest entry {i} ({kind}) has no metadata.name");
            }
            Ok((kind, item))
        })
        .collect()
}

/// Creates every manifest object in `control_plane`. Returns how many were
/// created.
pub async fn seed(control_plane: &dyn ControlPlane, objects: Vec<(String, Value)>) -> Result<usize> {
    let mut created = 0;
    for (kind, object) in objects {
        control_plane
            .create(&kind, object)
            .await
            .with_context(|| format!("failed to seed {kind}"))?;
        created += 1;
    }
    Ok(created)
}
