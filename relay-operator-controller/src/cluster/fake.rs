//! In-memory clusters for tests.
//!
//! [`FakeCluster`] keeps objects in a map and mimics the API server behaviours
//! the reconcilers depend on: resourceVersion conflicts, generation bumps on
//! spec changes, a status subresource, and finalizer-gated deletion. Every
//! mutating call is counted so tests can assert on write volume.

use async_trait::async_trait;
use chrono::Utc;
use kube::{
    core::{ApiResource, DynamicObject, Selector, SelectorExt},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cluster::{ClusterApi, ClusterConnector, DeleteOutcome, ObjectKey};
use crate::document::{merge_patch, same_spec};
use crate::error::{ControllerError, Result};

type StoreKey = (String, Option<String>, String);

fn store_key(resource: &ApiResource, key: &ObjectKey) -> StoreKey {
    (format!("{}/{}", resource.group, resource.plural), key.namespace.clone(), key.name.clone())
}

fn timestamp<T: DeserializeOwned>() -> Option<T> {
    serde_json::from_value(json!(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))).ok()
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<StoreKey, DynamicObject>,
    writes: usize,
    dry_runs: usize,
    next_version: u64,
    unreachable: bool,
    dry_run_rejection: Option<String>,
    racing: Option<String>,
}

impl FakeState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn stored(&self, key: &StoreKey) -> Result<&DynamicObject> {
        self.objects
            .get(key)
            .ok_or_else(|| ControllerError::NotFoundError(format!("{}/{}", key.0, key.2)))
    }

    /// Persist `updated` over the stored object, keeping server-owned metadata
    fn commit(&mut self, key: StoreKey, mut updated: DynamicObject) -> Result<DynamicObject> {
        let stored = self.stored(&key)?.clone();
        if !same_spec(&stored, &updated) {
            updated.metadata.generation = Some(stored.metadata.generation.unwrap_or(1) + 1);
        } else {
            updated.metadata.generation = stored.metadata.generation;
        }
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        updated.metadata.resource_version = Some(self.bump_version());
        if updated.types.is_none() {
            updated.types = stored.types.clone();
        }
        self.writes += 1;

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if released {
            self.objects.remove(&key);
        } else {
            self.objects.insert(key, updated.clone());
        }
        Ok(updated)
    }
}

fn check_version(stored: &DynamicObject, requested: Option<&str>) -> Result<()> {
    match requested {
        Some(rv) if Some(rv) != stored.metadata.resource_version.as_deref() => Err(ControllerError::ConflictError(
            format!("resourceVersion {} is stale", rv),
        )),
        _ => Ok(()),
    }
}

pub struct FakeCluster {
    name: String,
    version: String,
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "v1.30.0".to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake cluster state poisoned")
    }

    fn check_reachable(&self, state: &FakeState) -> Result<()> {
        if state.unreachable {
            Err(ControllerError::unreachable(&self.name, "connection refused"))
        } else {
            Ok(())
        }
    }

    /// Insert an object as-is, status included, without counting a write
    pub fn seed(&self, resource: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
        let mut state = self.state();
        let key = ObjectKey { namespace: obj.metadata.namespace.clone(), name: obj.metadata.name.clone().unwrap_or_default() };
        obj.metadata.resource_version = Some(state.bump_version());
        obj.metadata.generation.get_or_insert(1);
        obj.metadata.uid.get_or_insert_with(|| format!("uid-{}", key));
        if obj.metadata.creation_timestamp.is_none() {
            obj.metadata.creation_timestamp = timestamp();
        }
        if obj.types.is_none() {
            obj.types = Some(kube::core::TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            });
        }
        state.objects.insert(store_key(resource, &key), obj.clone());
        obj
    }

    pub fn seed_typed<K>(&self, obj: &K) -> DynamicObject
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let value = serde_json::to_value(obj).expect("typed object serializes");
        let dynamic: DynamicObject = serde_json::from_value(value).expect("typed object is a valid document");
        self.seed(&ApiResource::erase::<K>(&()), dynamic)
    }

    pub fn object(&self, resource: &ApiResource, key: &ObjectKey) -> Option<DynamicObject> {
        self.state().objects.get(&store_key(resource, key)).cloned()
    }

    pub fn typed<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = ObjectKey { namespace: namespace.map(str::to_string), name: name.to_string() };
        let obj = self.object(&ApiResource::erase::<K>(&()), &key)?;
        serde_json::from_value(serde_json::to_value(obj).ok()?).ok()
    }

    pub fn count(&self, resource: &ApiResource) -> usize {
        let prefix = format!("{}/{}", resource.group, resource.plural);
        self.state().objects.keys().filter(|k| k.0 == prefix).count()
    }

    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn dry_runs(&self) -> usize {
        self.state().dry_runs
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn reject_dry_runs(&self, message: Option<&str>) {
        self.state().dry_run_rejection = message.map(str::to_string);
    }

    /// Follow every read of `resource` with a write from another client, so
    /// the copy handed out is already stale
    pub fn race_writes(&self, resource: Option<&ApiResource>) {
        self.state().racing = resource.map(|r| format!("{}/{}", r.group, r.plural));
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let mut state = self.state();
        self.check_reachable(&state)?;
        let store = store_key(resource, key);
        let found = state.objects.get(&store).cloned();
        if found.is_some() && state.racing.as_ref() == Some(&store.0) {
            let version = state.bump_version();
            if let Some(stored) = state.objects.get_mut(&store) {
                stored.metadata.resource_version = Some(version);
            }
        }
        Ok(found)
    }

    async fn list(&self, resource: &ApiResource, namespace: Option<&str>, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let state = self.state();
        self.check_reachable(&state)?;
        let prefix = format!("{}/{}", resource.group, resource.plural);
        let empty = BTreeMap::new();
        Ok(state
            .objects
            .iter()
            .filter(|((id, ns, _), _)| *id == prefix && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, obj)| selector.matches(obj.metadata.labels.as_ref().unwrap_or(&empty)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state();
        self.check_reachable(&state)?;
        let key = ObjectKey::of(obj).ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))?;
        let store = store_key(resource, &key);
        if state.objects.contains_key(&store) {
            return Err(ControllerError::ConflictError(format!("{} already exists", key)));
        }

        let mut created = obj.clone();
        if let Value::Object(data) = &mut created.data {
            data.remove("status");
        }
        created.metadata.resource_version = Some(state.bump_version());
        created.metadata.generation = Some(1);
        created.metadata.uid = Some(format!("uid-{}-{}", key, state.next_version));
        created.metadata.creation_timestamp = timestamp();
        created.metadata.deletion_timestamp = None;
        state.writes += 1;
        state.objects.insert(store, created.clone());
        Ok(created)
    }

    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state();
        self.check_reachable(&state)?;
        let key = ObjectKey::of(obj).ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))?;
        let store = store_key(resource, &key);
        let stored = state.stored(&store)?.clone();
        check_version(&stored, obj.metadata.resource_version.as_deref())?;

        // Status is owned by the status subresource
        let mut updated = obj.clone();
        if let Value::Object(data) = &mut updated.data {
            data.remove("status");
            if let Some(status) = stored.data.get("status") {
                data.insert("status".to_string(), status.clone());
            }
        }
        state.commit(store, updated)
    }

    async fn patch(&self, resource: &ApiResource, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.state();
        self.check_reachable(&state)?;
        let store = store_key(resource, key);
        let stored = state.stored(&store)?.clone();
        check_version(&stored, patch.pointer("/metadata/resourceVersion").and_then(Value::as_str))?;

        let mut doc = serde_json::to_value(&stored)?;
        let mut patch = patch.clone();
        if let Value::Object(map) = &mut patch {
            map.remove("status");
        }
        merge_patch(&mut doc, &patch);
        let updated: DynamicObject = serde_json::from_value(doc)?;
        state.commit(store, updated)
    }

    async fn patch_status(&self, resource: &ApiResource, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.state();
        self.check_reachable(&state)?;
        let store = store_key(resource, key);
        let stored = state.stored(&store)?.clone();
        check_version(&stored, patch.pointer("/metadata/resourceVersion").and_then(Value::as_str))?;

        let mut updated = stored.clone();
        if let (Some(status_patch), Value::Object(data)) = (patch.get("status"), &mut updated.data) {
            let status = data.entry("status".to_string()).or_insert(Value::Null);
            merge_patch(status, status_patch);
        }
        state.commit(store, updated)
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DeleteOutcome> {
        let mut state = self.state();
        self.check_reachable(&state)?;
        let store = store_key(resource, key);
        let Some(stored) = state.objects.get(&store).cloned() else {
            return Ok(DeleteOutcome::NotFound);
        };
        if stored.metadata.deletion_timestamp.is_some() {
            return Ok(DeleteOutcome::Deleting);
        }

        state.writes += 1;
        if stored.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            let mut deleting = stored;
            deleting.metadata.deletion_timestamp = timestamp();
            deleting.metadata.resource_version = Some(state.bump_version());
            state.objects.insert(store, deleting);
            Ok(DeleteOutcome::Deleting)
        } else {
            state.objects.remove(&store);
            Ok(DeleteOutcome::Deleted)
        }
    }

    async fn dry_run_create(&self, _resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state();
        self.check_reachable(&state)?;
        state.dry_runs += 1;
        match &state.dry_run_rejection {
            Some(message) => Err(ControllerError::UnknownError(message.clone())),
            None => Ok(obj.clone()),
        }
    }

    async fn dry_run_replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.dry_run_create(resource, obj).await
    }

    async fn server_version(&self) -> Result<String> {
        let state = self.state();
        self.check_reachable(&state)?;
        Ok(self.version.clone())
    }
}

/// Connector resolving service cluster names to registered fakes
#[derive(Default)]
pub struct FakeConnector {
    clusters: Mutex<HashMap<String, Arc<FakeCluster>>>,
}

impl FakeConnector {
    pub fn with_cluster(self, cluster: Arc<FakeCluster>) -> Self {
        self.insert(cluster);
        self
    }

    pub fn insert(&self, cluster: Arc<FakeCluster>) {
        self.clusters
            .lock()
            .expect("fake connector poisoned")
            .insert(cluster.name().to_string(), cluster);
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, _namespace: &str, service_cluster: &str) -> Result<Arc<dyn ClusterApi>> {
        let cluster = self
            .clusters
            .lock()
            .expect("fake connector poisoned")
            .get(service_cluster)
            .cloned();
        match cluster {
            Some(cluster) => Ok(cluster),
            None => Err(ControllerError::unreachable(service_cluster, "no route to cluster")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_maps() -> ApiResource {
        ApiResource::erase::<ConfigMap>(&())
    }

    fn config_map(name: &str, data: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": data,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let cluster = FakeCluster::new("test");
        let created = cluster.create(&config_maps(), &config_map("a", json!({"k": "1"}))).await.unwrap();

        let mut first = created.clone();
        first.data["data"]["k"] = json!("2");
        cluster.replace(&config_maps(), &first).await.unwrap();

        let mut second = created;
        second.data["data"]["k"] = json!("3");
        let err = cluster.replace(&config_maps(), &second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_cleared() {
        let cluster = FakeCluster::new("test");
        let mut obj = config_map("a", json!({}));
        obj.metadata.finalizers = Some(vec!["example.io/hold".to_string()]);
        cluster.create(&config_maps(), &obj).await.unwrap();
        let key = ObjectKey::namespaced("default", "a");

        assert_eq!(cluster.delete(&config_maps(), &key).await.unwrap(), DeleteOutcome::Deleting);
        assert!(cluster.object(&config_maps(), &key).unwrap().metadata.deletion_timestamp.is_some());

        cluster
            .patch(&config_maps(), &key, &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(cluster.object(&config_maps(), &key).is_none());
        assert_eq!(cluster.delete(&config_maps(), &key).await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_every_call() {
        let cluster = FakeCluster::new("eu-west-1");
        cluster.set_unreachable(true);

        let err = cluster.server_version().await.unwrap_err();
        assert!(matches!(err, ControllerError::RemoteUnreachableError { ref cluster, .. } if cluster == "eu-west-1"));
    }
}
