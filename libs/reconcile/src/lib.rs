//! Reconciliation loop primitives.
//!
//! This library provides helpers for reconcilers that converge a fleet
//! toward its declared state. Key concepts:
//!
//! - **Requeue**: a non-fatal "try again after D" signal. It travels through
//!   the error channel so `?` carries it up unchanged to the dispatcher.
//! - **Creation spec**: the canonical serialization of a desired object,
//!   stamped onto the object itself. Equality of the stamps on the desired and
//!   the observed object is the only "no drift" signal.
//! - **Config checksum**: content hash of an effective device configuration,
//!   used as the rollout identity of a device.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A requeue is never surfaced as a failure
//! - Backoff is always finite; nothing busy-loops

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use droidfarm_id::NameError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Requeue after a short wait (pod creation, boot polling, recreate).
pub const SHORT_REQUEUE: Duration = Duration::from_secs(3);

/// Requeue after marking a device booted, forcing a fresh read before binding.
pub const BOOT_MARK_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue when the ordered rollout window is full.
pub const CONCURRENCY_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue after deleting a stale one-shot job.
pub const STALE_JOB_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue after losing an optimistic-concurrency race.
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Default full resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default base backoff after a fatal reconcile error.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Default cap on the fatal-error backoff.
pub const DEFAULT_MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// "Try again after `after`". Not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueSignal {
    pub message: String,
    pub after: Duration,
}

impl RequeueSignal {
    pub fn new(message: impl Into<String>, after: Duration) -> Self {
        Self {
            message: message.into(),
            after,
        }
    }
}

impl std::fmt::Display for RequeueSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (requeue after {:?})", self.message, self.after)
    }
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Voluntary yield; the dispatcher re-invokes after the signal's duration.
    #[error("{0}")]
    Requeue(RequeueSignal),

    /// Resource not found.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Conflict detected (concurrent modification).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unfixable configuration; retrying will not help until someone edits it.
    #[error("configuration error: {0}")]
    Config(String),

    /// A name with a malformed ordinal.
    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    /// Serialization of a desired or observed object failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Control-plane failure other than not-found.
    #[error("control plane error: {0}")]
    Backend(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Shorthand for a requeue.
    pub fn requeue(message: impl Into<String>, after: Duration) -> Self {
        Self::Requeue(RequeueSignal::new(message, after))
    }

    /// Returns true if this is a requeue rather than a failure.
    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::Requeue(_))
    }

    /// Returns the requeue delay, if this is a requeue.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Requeue(signal) => Some(signal.after),
            _ => None,
        }
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for reconcile operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Picks the earlier of two requeue signals, keeping the first on ties.
pub fn earliest(current: Option<RequeueSignal>, next: RequeueSignal) -> RequeueSignal {
    match current {
        Some(current) if current.after <= next.after => current,
        _ => next,
    }
}

/// Content checksum of an effective configuration.
///
/// Used to detect when a device's configuration has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigChecksum(String);

impl ConfigChecksum {
    /// Compute a checksum from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute a checksum of any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    /// Get the checksum string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ConfigChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Computes the creation spec of a desired object.
///
/// `annotations_path` names the JSON pointer of the object's annotation map;
/// the `key` entry is removed before serializing so the stamp never depends
/// on a previous stamp.
pub fn creation_spec<T: Serialize>(
    desired: &T,
    annotations_path: &str,
    key: &str,
) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(desired)?;
    if let Some(serde_json::Value::Object(annotations)) = value.pointer_mut(annotations_path) {
        annotations.remove(key);
    }
    Ok(canonical_json(&value))
}

/// Compares two creation-spec stamps. A missing stamp on either side is drift.
pub fn creation_specs_equal(desired: Option<&str>, observed: Option<&str>) -> bool {
    match (desired, observed) {
        (Some(d), Some(o)) => d == o,
        _ => false,
    }
}

/// Ordered-ready admission: may one more member start converging when
/// `pending` lower-indexed members are still converging?
pub fn admits(pending: u32, concurrency: u32) -> bool {
    pending < concurrency.max(1)
}

/// Exponential backoff for keys that keep failing fatally.
#[derive(Debug, Clone)]
pub struct FailureBackoff {
    /// Backoff after the first failure.
    base: Duration,

    /// Upper bound on any backoff.
    max: Duration,

    /// Failures older than this are forgotten.
    window: Duration,

    /// Tracked failures: key -> (count, last_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl FailureBackoff {
    /// Create a new backoff tracker.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            window: max.saturating_mul(2),
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn record_failure(&mut self, key: &str) -> Duration {
        let now = Instant::now();

        let (count, last) = self.failures.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(*last) > self.window {
            *count = 0;
        }
        *count = count.saturating_add(1);
        *last = now;

        let exp = (*count - 1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// Number of consecutive failures currently recorded for a key.
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.failures
            .retain(|_, (_, last)| now.duration_since(*last) <= window);
    }
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_BACKOFF, DEFAULT_MAX_ERROR_BACKOFF)
    }
}
