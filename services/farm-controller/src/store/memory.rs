//! In-process control plane.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use droidfarm_id::ObjectKey;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{matches, ControlPlane, Selector, StoreError, StoreResult, WatchAction, WatchEvent};

type StoreKey = (String, ObjectKey);

const EVENT_CAPACITY: usize = 1024;

/// Writes issued against one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl WriteStats {
    pub fn total(&self) -> u64 {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<StoreKey, Value>,
    version: u64,
    writes: BTreeMap<String, WriteStats>,
    failing: BTreeSet<String>,
}

impl State {
    fn check(&self, kind: &str) -> StoreResult<()> {
        if self.failing.contains(kind) {
            return Err(StoreError::Backend(format!("{kind} storage is failing")));
        }
        Ok(())
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn stats(&mut self, kind: &str) -> &mut WriteStats {
        self.writes.entry(kind.to_string()).or_default()
    }

    fn remove_cascading(&mut self, id: StoreKey, removed: &mut Vec<(StoreKey, Value)>) {
        let Some(object) = self.objects.remove(&id) else {
            return;
        };
        let uid = meta_str(&object, "uid").map(str::to_string);
        removed.push((id, object));
        if let Some(uid) = uid {
            let children: Vec<StoreKey> = self
                .objects
                .iter()
                .filter(|(_, v)| owned_by(v, &uid))
                .map(|(k, _)| k.clone())
                .collect();
            for child in children {
                self.remove_cascading(child, removed);
            }
        }
    }
}

/// A [`ControlPlane`] held entirely in memory.
///
/// Assigns uids and resource versions, cascades deletes through owner
/// references and broadcasts every write to watchers. The `set_*` and
/// `mark_*` hooks stand in for the runtime (pod scheduling, job completion)
/// and are not counted as writes.
#[derive(Debug)]
pub struct MemoryControlPlane {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Writes issued for `kind` so far.
    pub async fn writes(&self, kind: &str) -> WriteStats {
        let state = self.state.lock().await;
        state.writes.get(kind).copied().unwrap_or_default()
    }

    pub async fn total_writes(&self) -> u64 {
        let state = self.state.lock().await;
        state.writes.values().map(WriteStats::total).sum()
    }

    pub async fn contains(&self, kind: &str, key: &ObjectKey) -> bool {
        let state = self.state.lock().await;
        state.objects.contains_key(&(kind.to_string(), key.clone()))
    }

    /// Makes every operation on `kind` fail with a backend error.
    pub async fn fail_kind(&self, kind: &str) {
        self.state.lock().await.failing.insert(kind.to_string());
    }

    pub async fn heal_kind(&self, kind: &str) {
        self.state.lock().await.failing.remove(kind);
    }

    /// Edits a stored object out of band, as the runtime would.
    pub async fn modify(
        &self,
        kind: &str,
        key: &ObjectKey,
        edit: impl FnOnce(&mut Value),
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        let id = (kind.to_string(), key.clone());
        let object = state.objects.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: kind.to_string(),
            key: key.clone(),
        })?;
        edit(object);
        set_meta(object, "resourceVersion", Value::String(version));
        let labels = labels_of(object);
        drop(state);
        self.emit(kind, key, WatchAction::Modified, labels);
        Ok(())
    }

    pub async fn set_pod_ip(&self, key: &ObjectKey, ip: &str) -> StoreResult<()> {
        self.modify("Pod", key, |pod| {
            pod["status"]["podIP"] = json!(ip);
        })
        .await
    }

    pub async fn set_job_succeeded(&self, key: &ObjectKey, succeeded: u32) -> StoreResult<()> {
        self.modify("Job", key, |job| {
            job["status"]["succeeded"] = json!(succeeded);
        })
        .await
    }

    pub async fn set_ready_replicas(
        &self,
        kind: &str,
        key: &ObjectKey,
        ready: u32,
    ) -> StoreResult<()> {
        self.modify(kind, key, |object| {
            object["status"]["readyReplicas"] = json!(ready);
        })
        .await
    }

    /// Stamps a deletion timestamp without removing the object.
    pub async fn mark_for_deletion(&self, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        self.modify(kind, key, |object| {
            set_meta(object, "deletionTimestamp", json!(Utc::now().to_rfc3339()));
        })
        .await
    }

    fn emit(
        &self,
        kind: &str,
        key: &ObjectKey,
        action: WatchAction,
        labels: BTreeMap<String, String>,
    ) {
        // No receivers is fine.
        let _ = self.events.send(WatchEvent {
            kind: kind.to_string(),
            key: key.clone(),
            action,
            labels,
        });
    }
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<Value> {
        let state = self.state.lock().await;
        state.check(kind)?;
        state
            .objects
            .get(&(kind.to_string(), key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })
    }

    async fn create(&self, kind: &str, mut object: Value) -> StoreResult<Value> {
        let key = object_key(kind, &object)?;
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let id = (kind.to_string(), key.clone());
        if state.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                key,
            });
        }

        let version = state.next_version();
        set_meta(&mut object, "uid", json!(Uuid::new_v4().to_string()));
        set_meta(&mut object, "resourceVersion", json!(version));
        set_meta(&mut object, "creationTimestamp", json!(Utc::now().to_rfc3339()));
        remove_meta(&mut object, "deletionTimestamp");

        state.objects.insert(id, object.clone());
        state.stats(kind).creates += 1;
        drop(state);

        debug!(kind, object = %key, "created");
        self.emit(kind, &key, WatchAction::Added, labels_of(&object));
        Ok(object)
    }

    async fn update(&self, kind: &str, mut object: Value) -> StoreResult<Value> {
        let key = object_key(kind, &object)?;
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let id = (kind.to_string(), key.clone());
        let Some(stored) = state.objects.get(&id) else {
            return Err(StoreError::NotFound {
                kind: kind.to_string(),
                key,
            });
        };

        let expected = meta_str(stored, "resourceVersion").map(str::to_string);
        let given = meta_str(&object, "resourceVersion").map(str::to_string);
        if given.is_none() || given != expected {
            return Err(StoreError::Conflict {
                kind: kind.to_string(),
                key,
                reason: format!(
                    "resourceVersion {} does not match stored {}",
                    given.as_deref().unwrap_or("<none>"),
                    expected.as_deref().unwrap_or("<none>")
                ),
            });
        }

        // Server-owned fields survive client writes.
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match stored.pointer(&format!("/metadata/{field}")).cloned() {
                Some(value) => set_meta(&mut object, field, value),
                None => remove_meta(&mut object, field),
            }
        }

        let version = state.next_version();
        set_meta(&mut object, "resourceVersion", json!(version));
        state.objects.insert(id, object.clone());
        state.stats(kind).updates += 1;
        drop(state);

        debug!(kind, object = %key, "updated");
        self.emit(kind, &key, WatchAction::Modified, labels_of(&object));
        Ok(object)
    }

    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let id = (kind.to_string(), key.clone());
        if !state.objects.contains_key(&id) {
            return Err(StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            });
        }
        let mut removed = Vec::new();
        state.remove_cascading(id, &mut removed);
        state.stats(kind).deletes += 1;
        drop(state);

        debug!(kind, object = %key, cascaded = removed.len() - 1, "deleted");
        for ((kind, key), object) in removed {
            self.emit(&kind, &key, WatchAction::Deleted, labels_of(&object));
        }
        Ok(())
    }

    async fn delete_all(
        &self,
        kind: &str,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let targets: Vec<StoreKey> = state
            .objects
            .iter()
            .filter(|((k, key), v)| {
                k == kind && key.namespace == namespace && matches(selector, &labels_of(v))
            })
            .map(|(id, _)| id.clone())
            .collect();
        let count = targets.len();

        let mut removed = Vec::new();
        for id in targets {
            state.remove_cascading(id, &mut removed);
        }
        state.stats(kind).deletes += count as u64;
        drop(state);

        for ((kind, key), object) in removed {
            self.emit(&kind, &key, WatchAction::Deleted, labels_of(&object));
        }
        Ok(count)
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> StoreResult<Vec<Value>> {
        let state = self.state.lock().await;
        state.check(kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, key), v)| {
                k == kind
                    && namespace.is_none_or(|ns| key.namespace == ns)
                    && matches(selector, &labels_of(v))
            })
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

fn object_key(kind: &str, object: &Value) -> StoreResult<ObjectKey> {
    let name = meta_str(object, "name").filter(|n| !n.is_empty()).ok_or_else(|| {
        StoreError::Backend(format!("{kind} object has no metadata.name"))
    })?;
    let namespace = meta_str(object, "namespace").unwrap_or_default();
    Ok(ObjectKey::new(namespace, name))
}

fn meta_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object.get("metadata")?.get(field)?.as_str()
}

fn set_meta(object: &mut Value, field: &str, value: Value) {
    object["metadata"][field] = value;
}

fn remove_meta(object: &mut Value, field: &str) {
    if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove(field);
    }
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn owned_by(object: &Value, uid: &str) -> bool {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(namespace: &str, name: &str) -> Value {
        json!({"metadata": {"name": name, "namespace": namespace, "labels": {"app": "emu"}}})
    }

    #[tokio::test]
    async fn create_assigns_server_metadata() {
        let plane = MemoryControlPlane::new();
        let created = plane.create("Pod", object("ns", "p")).await.unwrap();
        assert!(meta_str(&created, "uid").is_some());
        assert_eq!(meta_str(&created, "resourceVersion"), Some("1"));
        assert!(meta_str(&created, "creationTimestamp").is_some());
        assert_eq!(plane.writes("Pod").await.creates, 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let plane = MemoryControlPlane::new();
        plane.create("Pod", object("ns", "p")).await.unwrap();
        let err = plane.create("Pod", object("ns", "p")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let plane = MemoryControlPlane::new();
        let created = plane.create("Pod", object("ns", "p")).await.unwrap();
        let updated = plane.update("Pod", created.clone()).await.unwrap();
        assert_eq!(meta_str(&updated, "resourceVersion"), Some("2"));

        let err = plane.update("Pod", created).await.unwrap_err();
        assert!(err.is_conflict());

        let mut unversioned = object("ns", "p");
        unversioned["spec"] = json!({});
        assert!(plane.update("Pod", unversioned).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn delete_cascades_through_owners() {
        let plane = MemoryControlPlane::new();
        let parent = plane.create("Device", object("ns", "g1-0")).await.unwrap();
        let uid = meta_str(&parent, "uid").unwrap().to_string();

        let mut child = object("ns", "g1-0");
        child["metadata"]["ownerReferences"] = json!([{"kind": "Device", "name": "g1-0", "uid": uid}]);
        let child = plane.create("Pod", child).await.unwrap();
        let child_uid = meta_str(&child, "uid").unwrap().to_string();

        let mut grandchild = object("ns", "data-g1-0");
        grandchild["metadata"]["ownerReferences"] = json!([{"kind": "Pod", "name": "g1-0", "uid": child_uid}]);
        plane.create("PersistentVolumeClaim", grandchild).await.unwrap();

        let mut events = plane.watch();
        plane.delete("Device", &ObjectKey::new("ns", "g1-0")).await.unwrap();

        assert!(!plane.contains("Pod", &ObjectKey::new("ns", "g1-0")).await);
        assert!(
            !plane
                .contains("PersistentVolumeClaim", &ObjectKey::new("ns", "data-g1-0"))
                .await
        );
        assert_eq!(plane.writes("Pod").await.deletes, 0);

        let mut deleted = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.action, WatchAction::Deleted);
            deleted.push(event.kind);
        }
        assert_eq!(deleted, vec!["Device", "Pod", "PersistentVolumeClaim"]);
    }

    #[tokio::test]
    async fn delete_all_honours_namespace_and_selector() {
        let plane = MemoryControlPlane::new();
        plane.create("Pod", object("ns", "a")).await.unwrap();
        plane.create("Pod", object("other", "b")).await.unwrap();
        plane
            .create("Pod", json!({"metadata": {"name": "c", "namespace": "ns"}}))
            .await
            .unwrap();

        let selector = Selector::from([("app".to_string(), "emu".to_string())]);
        let removed = plane.delete_all("Pod", "ns", &selector).await.unwrap();
        assert_eq!(removed, 1);
        assert!(plane.contains("Pod", &ObjectKey::new("other", "b")).await);
        assert!(plane.contains("Pod", &ObjectKey::new("ns", "c")).await);
    }

    #[tokio::test]
    async fn hooks_do_not_count_as_writes() {
        let plane = MemoryControlPlane::new();
        plane.create("Pod", object("ns", "p")).await.unwrap();
        plane
            .set_pod_ip(&ObjectKey::new("ns", "p"), "10.0.0.4")
            .await
            .unwrap();
        let pod = plane.get("Pod", &ObjectKey::new("ns", "p")).await.unwrap();
        assert_eq!(pod["status"]["podIP"], "10.0.0.4");
        assert_eq!(plane.writes("Pod").await.total(), 1);
    }

    #[tokio::test]
    async fn failing_kind_reports_backend_error() {
        let plane = MemoryControlPlane::new();
        plane.fail_kind("Device").await;
        let err = plane
            .list("Device", None, &Selector::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        plane.heal_kind("Device").await;
        assert!(plane.list("Device", None, &Selector::new()).await.unwrap().is_empty());
    }
}
