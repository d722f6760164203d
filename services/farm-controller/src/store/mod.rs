//! Control-plane abstraction.
//!
//! The engine never owns durable state; every object lives in a
//! [`ControlPlane`]. The trait works on untyped JSON so it stays object-safe,
//! and [`Client`] layers typed access over it for [`Resource`] types.

mod memory;

pub use memory::{MemoryControlPlane, WriteStats};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use droidfarm_id::ObjectKey;
use droidfarm_reconcile::ReconcileError;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::api::Resource;

/// Label selector; an object matches when it carries every pair.
pub type Selector = BTreeMap<String, String>;

/// Result type for control-plane operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Control-plane failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    /// The object changed since it was read.
    #[error("conflict writing {kind} {key}: {reason}")]
    Conflict {
        kind: String,
        key: ObjectKey,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("control plane unavailable: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ReconcileError::NotFound(err.to_string()),
            StoreError::Conflict { .. } => ReconcileError::Conflict(err.to_string()),
            StoreError::Serialization(e) => ReconcileError::Serialization(e),
            other => ReconcileError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

/// Notification of a write, delivered to every watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: String,
    pub key: ObjectKey,
    pub action: WatchAction,
    pub labels: BTreeMap<String, String>,
}

/// Object storage consumed by the engine.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<Value>;

    /// Stores a new object and returns it with server-assigned metadata.
    async fn create(&self, kind: &str, object: Value) -> StoreResult<Value>;

    /// Replaces an object. Fails with [`StoreError::Conflict`] unless the
    /// object's `resourceVersion` matches the stored one.
    async fn update(&self, kind: &str, object: Value) -> StoreResult<Value>;

    /// Deletes an object and, transitively, every object it owns.
    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()>;

    /// Deletes every object of `kind` in `namespace` matching `selector`.
    async fn delete_all(&self, kind: &str, namespace: &str, selector: &Selector)
        -> StoreResult<usize>;

    /// Lists objects of `kind`, optionally restricted to one namespace.
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<Value>>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Typed access to a [`ControlPlane`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<dyn ControlPlane>,
}

impl Client {
    pub fn new(inner: Arc<dyn ControlPlane>) -> Self {
        Self { inner }
    }

    pub async fn get<K: Resource>(&self, key: &ObjectKey) -> StoreResult<K> {
        let value = self.inner.get(K::KIND, key).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`get`](Self::get) but maps not-found to `None`.
    pub async fn get_opt<K: Resource>(&self, key: &ObjectKey) -> StoreResult<Option<K>> {
        match self.get(key).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create<K: Resource>(&self, object: &K) -> StoreResult<K> {
        let value = self.inner.create(K::KIND, serde_json::to_value(object)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn update<K: Resource>(&self, object: &K) -> StoreResult<K> {
        let value = self.inner.update(K::KIND, serde_json::to_value(object)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn delete<K: Resource>(&self, key: &ObjectKey) -> StoreResult<()> {
        self.inner.delete(K::KIND, key).await
    }

    pub async fn delete_all<K: Resource>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<usize> {
        self.inner.delete_all(K::KIND, namespace, selector).await
    }

    pub async fn list<K: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<K>> {
        self.inner
            .list(K::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watch()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// Whether `labels` satisfy every pair of `selector`.
pub fn matches(selector: &Selector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}
