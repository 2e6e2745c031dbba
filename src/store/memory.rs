//! An executable model of the API server's object store.
//!
//! Objects are kept as their JSON bodies keyed by kind and namespace/name.
//! The model assigns uids and resource versions, enforces optimistic
//! concurrency on update, rejects objects carrying more than one controller
//! owner reference, and runs owner-reference cascading deletion the way the
//! garbage collector would. Faults can be queued per operation so that
//! conflict and transport failures can be exercised deterministically.

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::*;

use super::{ObjectKey, Store, StoreError, StoreObject};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Get,
    Create,
    Update,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification published to subscribers after every successful write.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub event_type: StoreEventType,
    pub kind: String,
    pub key: ObjectKey,
    pub metadata: metav1::ObjectMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct StoredKey {
    kind: String,
    key: ObjectKey,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<StoredKey, Value>,
    resource_version_counter: u64,
    uid_counter: u64,
    writes: usize,
    faults: HashMap<(FaultPoint, String), VecDeque<StoreError>>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn metadata_of(value: &Value) -> Result<metav1::ObjectMeta, StoreError> {
    match value.get("metadata") {
        Some(meta) => serde_json::from_value(meta.clone())
            .map_err(|e| StoreError::Invalid(format!("malformed metadata: {}", e))),
        None => Ok(metav1::ObjectMeta::default()),
    }
}

fn set_metadata(value: &mut Value, meta: &metav1::ObjectMeta) -> Result<(), StoreError> {
    let meta = serde_json::to_value(meta)
        .map_err(|e| StoreError::Invalid(format!("unserializable metadata: {}", e)))?;
    match value.as_object_mut() {
        Some(obj) => {
            obj.insert("metadata".to_string(), meta);
            Ok(())
        }
        None => Err(StoreError::Invalid("object is not a JSON map".to_string())),
    }
}

fn to_body<K: StoreObject>(obj: &K) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid(format!("unserializable object: {}", e)))
}

fn from_body<K: StoreObject>(value: &Value) -> Result<K, StoreError> {
    serde_json::from_value(value.clone())
        .map_err(|e| StoreError::Invalid(format!("stored object does not decode: {}", e)))
}

fn metadata_validity_check(meta: &metav1::ObjectMeta) -> Result<(), StoreError> {
    let controllers = meta
        .owner_references
        .iter()
        .flatten()
        .filter(|oref| oref.controller == Some(true))
        .count();
    if controllers > 1 {
        return Err(StoreError::Invalid(
            "only one reference can have Controller set to true".to_string(),
        ));
    }
    Ok(())
}

fn object_key(meta: &metav1::ObjectMeta) -> Result<ObjectKey, StoreError> {
    let name = meta
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| StoreError::Invalid("name is required".to_string()))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| StoreError::Invalid("namespace is required".to_string()))?;
    Ok(ObjectKey::new(namespace, name))
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryStore {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store state lock poisoned".to_string()))
    }

    /// Receives an event for every subsequent successful write or deletion.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Makes the next `point` operation on `kind` fail with `error`. Faults
    /// queued for the same operation fire in order.
    pub fn inject_fault(&self, point: FaultPoint, kind: &str, error: StoreError) {
        if let Ok(mut state) = self.state() {
            state
                .faults
                .entry((point, kind.to_string()))
                .or_default()
                .push_back(error);
        }
    }

    /// Number of successful create and update calls served so far.
    pub fn writes(&self) -> usize {
        self.state().map(|s| s.writes).unwrap_or(0)
    }

    fn publish(&self, event_type: StoreEventType, kind: &str, key: ObjectKey, metadata: metav1::ObjectMeta) {
        // No subscribers is fine.
        let _ = self.events.send(StoreEvent {
            event_type,
            kind: kind.to_string(),
            key,
            metadata,
        });
    }

    fn take_fault(state: &mut State, point: FaultPoint, kind: &str) -> Result<(), StoreError> {
        match state
            .faults
            .get_mut(&(point, kind.to_string()))
            .and_then(|queue| queue.pop_front())
        {
            Some(err) => {
                debug!("Injected {:?} fault for {}: {}", point, kind, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn handle_get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let kind = K::kind(&()).to_string();
        let mut state = self.state()?;
        Self::take_fault(&mut state, FaultPoint::Get, &kind)?;
        let stored_key = StoredKey {
            kind,
            key: ObjectKey::new(namespace, name),
        };
        match state.objects.get(&stored_key) {
            Some(value) => from_body(value),
            None => Err(StoreError::NotFound),
        }
    }

    fn handle_create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let kind = K::kind(&()).to_string();
        let (created, key, meta) = {
            let mut state = self.state()?;
            Self::take_fault(&mut state, FaultPoint::Create, &kind)?;
            let mut value = to_body(obj)?;
            let mut meta = metadata_of(&value)?;
            let key = object_key(&meta)?;
            let stored_key = StoredKey {
                kind: kind.clone(),
                key: key.clone(),
            };
            if state.objects.contains_key(&stored_key) {
                return Err(StoreError::AlreadyExists);
            }
            metadata_validity_check(&meta)?;

            state.uid_counter += 1;
            state.resource_version_counter += 1;
            meta.uid = Some(format!("uid-{}", state.uid_counter));
            meta.resource_version = Some(state.resource_version_counter.to_string());
            meta.generation = Some(1);
            meta.deletion_timestamp = None;
            set_metadata(&mut value, &meta)?;

            let created = from_body::<K>(&value)?;
            state.objects.insert(stored_key, value);
            state.writes += 1;
            (created, key, meta)
        };
        self.publish(StoreEventType::Added, &kind, key, meta);
        Ok(created)
    }

    fn handle_update<K: StoreObject>(&self, obj: &K, expected_version: &str) -> Result<K, StoreError> {
        let kind = K::kind(&()).to_string();
        let (updated, key, meta) = {
            let mut state = self.state()?;
            Self::take_fault(&mut state, FaultPoint::Update, &kind)?;
            let mut value = to_body(obj)?;
            let mut meta = metadata_of(&value)?;
            let key = object_key(&meta)?;
            let stored_key = StoredKey {
                kind: kind.clone(),
                key: key.clone(),
            };
            let old_value = state
                .objects
                .get(&stored_key)
                .cloned()
                .ok_or(StoreError::NotFound)?;
            let old_meta = metadata_of(&old_value)?;
            if old_meta.resource_version.as_deref() != Some(expected_version) {
                return Err(StoreError::Conflict);
            }
            metadata_validity_check(&meta)?;

            // Store-assigned fields cannot be changed by a client.
            meta.uid = old_meta.uid.clone();
            meta.resource_version = old_meta.resource_version.clone();
            meta.generation = old_meta.generation;
            set_metadata(&mut value, &meta)?;
            if value == old_value {
                // A no-op update does not produce a new version.
                state.writes += 1;
                return from_body(&value);
            }

            state.resource_version_counter += 1;
            meta.resource_version = Some(state.resource_version_counter.to_string());
            if value.get("spec") != old_value.get("spec") {
                meta.generation = Some(old_meta.generation.unwrap_or(0) + 1);
            }
            set_metadata(&mut value, &meta)?;

            let updated = from_body::<K>(&value)?;
            state.objects.insert(stored_key, value);
            state.writes += 1;
            (updated, key, meta)
        };
        self.publish(StoreEventType::Modified, &kind, key, meta);
        Ok(updated)
    }

    fn handle_list<K: StoreObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        let kind = K::kind(&()).to_string();
        let mut state = self.state()?;
        Self::take_fault(&mut state, FaultPoint::List, &kind)?;
        state
            .objects
            .iter()
            .filter(|(stored_key, _)| stored_key.kind == kind && stored_key.key.namespace == namespace)
            .map(|(_, value)| from_body(value))
            .collect()
    }

    /// Deletes an object and, transitively, every object whose owner
    /// references point at a deleted object's uid.
    pub fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let kind = K::kind(&()).to_string();
        let deleted = {
            let mut state = self.state()?;
            let root = StoredKey {
                kind,
                key: ObjectKey::new(namespace, name),
            };
            if !state.objects.contains_key(&root) {
                return Err(StoreError::NotFound);
            }
            let mut deleted = Vec::new();
            let mut pending = vec![root];
            while let Some(stored_key) = pending.pop() {
                let Some(value) = state.objects.remove(&stored_key) else {
                    continue;
                };
                let meta = metadata_of(&value)?;
                if let Some(uid) = meta.uid.as_deref() {
                    for (dependent_key, dependent) in state.objects.iter() {
                        let dependent_meta = metadata_of(dependent)?;
                        let owned = dependent_meta
                            .owner_references
                            .iter()
                            .flatten()
                            .any(|oref| oref.uid == uid);
                        if owned {
                            pending.push(dependent_key.clone());
                        }
                    }
                }
                deleted.push((stored_key, meta));
            }
            deleted
        };
        for (stored_key, meta) in deleted {
            info!("Deleted {} {}", stored_key.kind, stored_key.key);
            self.publish(StoreEventType::Deleted, &stored_key.kind, stored_key.key, meta);
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.handle_get(namespace, name)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        self.handle_create(obj)
    }

    async fn update<K: StoreObject>(&self, obj: &K, expected_version: &str) -> Result<K, StoreError> {
        self.handle_update(obj, expected_version)
    }

    async fn list<K: StoreObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        self.handle_list(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn make_configmap(name: &str, data: &str) -> ConfigMap {
        ConfigMap {
            metadata: metav1::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), data.to_string())])),
            ..Default::default()
        }
    }

    fn owner_ref(uid: &str, controller: bool) -> metav1::OwnerReference {
        metav1::OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: format!("owner-{}", uid),
            uid: uid.to_string(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    #[tokio::test]
    async fn create_assigns_uid_and_version() {
        let store = MemoryStore::new();
        let created = store.create(&make_configmap("a", "1")).await.unwrap();
        assert_eq!(created.metadata.uid.as_deref(), Some("uid-1"));
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let err = store.create(&make_configmap("a", "1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get::<ConfigMap>("default", "missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn update_requires_latest_version() {
        let store = MemoryStore::new();
        let created = store.create(&make_configmap("a", "1")).await.unwrap();
        let rv = created.metadata.resource_version.clone().unwrap();

        let updated = store.update(&make_configmap("a", "2"), &rv).await.unwrap();
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);
        assert_eq!(updated.metadata.uid, created.metadata.uid);

        let err = store.update(&make_configmap("a", "3"), &rv).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        let current = store.get::<ConfigMap>("default", "a").await.unwrap();
        assert_eq!(current.data.unwrap()["k"], "2");
    }

    #[tokio::test]
    async fn noop_update_keeps_version() {
        let store = MemoryStore::new();
        let created = store.create(&make_configmap("a", "1")).await.unwrap();
        let rv = created.metadata.resource_version.clone().unwrap();
        let same = store.update(&created, &rv).await.unwrap();
        assert_eq!(same.metadata.resource_version.as_deref(), Some(rv.as_str()));
    }

    #[tokio::test]
    async fn rejects_second_controller_reference() {
        let store = MemoryStore::new();
        let mut cm = make_configmap("a", "1");
        cm.metadata.owner_references = Some(vec![owner_ref("x", true), owner_ref("y", true)]);
        let err = store.create(&cm).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        cm.metadata.owner_references = Some(vec![owner_ref("x", true), owner_ref("y", false)]);
        store.create(&cm).await.unwrap();
    }

    #[tokio::test]
    async fn delete_cascades_through_owner_references() {
        let store = MemoryStore::new();
        let parent = store.create(&make_configmap("parent", "1")).await.unwrap();
        let parent_uid = parent.metadata.uid.clone().unwrap();

        let mut child = make_configmap("child", "1");
        child.metadata.owner_references = Some(vec![owner_ref(&parent_uid, true)]);
        let child = store.create(&child).await.unwrap();

        let mut grandchild = make_configmap("grandchild", "1");
        grandchild.metadata.owner_references =
            Some(vec![owner_ref(child.metadata.uid.as_deref().unwrap(), true)]);
        store.create(&grandchild).await.unwrap();
        store.create(&make_configmap("unrelated", "1")).await.unwrap();

        store.delete::<ConfigMap>("default", "parent").unwrap();
        let left: Vec<ConfigMap> = store.list("default").await.unwrap();
        let names: Vec<_> = left.iter().filter_map(|cm| cm.metadata.name.clone()).collect();
        assert_eq!(names, vec!["unrelated".to_string()]);
    }

    #[tokio::test]
    async fn injected_faults_fire_once_in_order() {
        let store = MemoryStore::new();
        store.inject_fault(FaultPoint::Get, "ConfigMap", StoreError::Unavailable("down".to_string()));
        store.inject_fault(FaultPoint::Get, "ConfigMap", StoreError::Conflict);

        let first = store.get::<ConfigMap>("default", "a").await.unwrap_err();
        assert!(matches!(first, StoreError::Unavailable(_)));
        let second = store.get::<ConfigMap>("default", "a").await.unwrap_err();
        assert!(matches!(second, StoreError::Conflict));
        let third = store.get::<ConfigMap>("default", "a").await.unwrap_err();
        assert!(matches!(third, StoreError::NotFound));
    }

    #[tokio::test]
    async fn subscribers_see_writes() {
        let store = MemoryStore::new();
        let mut events = store.subscribe();
        let created = store.create(&make_configmap("a", "1")).await.unwrap();
        store
            .update(&make_configmap("a", "2"), created.metadata.resource_version.as_deref().unwrap())
            .await
            .unwrap();

        let added = events.recv().await.unwrap();
        assert_eq!(added.event_type, StoreEventType::Added);
        assert_eq!(added.kind, "ConfigMap");
        assert_eq!(added.key, ObjectKey::new("default", "a"));
        let modified = events.recv().await.unwrap();
        assert_eq!(modified.event_type, StoreEventType::Modified);
    }
}
