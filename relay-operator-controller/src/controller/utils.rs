use kube::{
    api::ObjectMeta,
    core::{ApiResource, DynamicObject, Selector},
    runtime::controller::Action,
    Client, Resource, ResourceExt,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use relay_operator_common::telemetry::{error, info, warn};

use crate::cluster::{ClusterApi, DeleteOutcome, ObjectKey};
use crate::controller::context::Context;
use crate::crd::NamespacedCustomResource;
use crate::document::merge_diff;
use crate::error::{ControllerError, Result};

pub static FIELD_MANAGER: &str = "operator.relay.io";


/// Create a new kube client by inferring the kubeconfig from the environment
/// or the default service account
///
/// # Returns
/// A Result containing the kube Client or an error
pub async fn create_k8s_client() -> Result<Client> {
    Client::try_default().await.map_err(ControllerError::from)
}

/// Error policy to log the error and requeue the object with a per-object
/// exponential backoff. Conflicts are retried after the base delay without
/// growing the backoff.
///
/// # Arguments
/// * `object`: The object that caused the error
/// * `error`: The error that occurred
/// * `ctx`: The context of the controller
///
/// # Returns
/// An Action to requeue the object
pub fn error_policy<T>(object: Arc<T>, error: &ControllerError, ctx: Arc<Context>) -> Action
where
    T: ResourceExt,
{
    let config = &ctx.config().controller;
    let base = Duration::from_secs(config.backoff_base_secs);
    if error.is_conflict() {
        warn!(event = "Conflict", name = %object.name_any(), error = %error);
        return Action::requeue(base);
    }

    let delay = ctx.backoff.next_delay(
        &backoff_key(object.as_ref()),
        base,
        Duration::from_secs(config.backoff_max_secs),
    );
    error!(
        event = "Error",
        name = %object.name_any(),
        namespace = %object.namespace().unwrap_or_default(),
        error = %error,
        retry_in_secs = delay.as_secs(),
    );
    Action::requeue(delay)
}

/// Forget the failure history of `object` after a successful reconcile
pub fn reset_backoff<T: ResourceExt>(object: &T, ctx: &Context) {
    ctx.backoff.reset(&backoff_key(object));
}

fn backoff_key<T: ResourceExt>(object: &T) -> String {
    object
        .uid()
        .unwrap_or_else(|| format!("{}/{}", object.namespace().unwrap_or_default(), object.name_any()))
}

/// Non-error requeue for a dependency that is not ready yet
pub fn waiting(ctx: &Context, kind: &str, name: &str, reason: &str) -> Action {
    info!(event = "Waiting", kind = kind, name = name, reason = reason);
    Action::requeue(ctx.state.requeue_after())
}

pub fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey> {
    Ok(ObjectKey {
        namespace: obj.meta().namespace.clone(),
        name: obj
            .meta()
            .name
            .clone()
            .ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))?,
    })
}

pub fn resource_of<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub async fn get_typed<K>(cluster: &dyn ClusterApi, namespace: Option<&str>, name: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let key = ObjectKey { namespace: namespace.map(str::to_string), name: name.to_string() };
    cluster
        .get(&resource_of::<K>(), &key)
        .await?
        .map(from_dynamic)
        .transpose()
}

pub async fn list_typed<K>(cluster: &dyn ClusterApi, namespace: Option<&str>, selector: &Selector) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    cluster
        .list(&resource_of::<K>(), namespace, selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

pub async fn create_typed<K>(cluster: &dyn ClusterApi, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    from_dynamic(cluster.create(&resource_of::<K>(), &to_dynamic(obj)?).await?)
}

pub async fn replace_typed<K>(cluster: &dyn ClusterApi, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    from_dynamic(cluster.replace(&resource_of::<K>(), &to_dynamic(obj)?).await?)
}

pub async fn delete_typed<K>(cluster: &dyn ClusterApi, namespace: Option<&str>, name: &str) -> Result<DeleteOutcome>
where
    K: Resource<DynamicType = ()>,
{
    let key = ObjectKey { namespace: namespace.map(str::to_string), name: name.to_string() };
    cluster.delete(&resource_of::<K>(), &key).await
}

fn finalizer_patch(meta: &ObjectMeta, finalizers: Vec<String>) -> Value {
    json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
            "finalizers": finalizers,
        }
    })
}

fn meta_key(meta: &ObjectMeta) -> Result<ObjectKey> {
    Ok(ObjectKey {
        namespace: meta.namespace.clone(),
        name: meta.name.clone().ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))?,
    })
}

/// Append `finalizer` if missing. Returns the updated object when a write was issued.
pub async fn add_finalizer(cluster: &dyn ClusterApi, resource: &ApiResource, meta: &ObjectMeta, finalizer: &str) -> Result<Option<DynamicObject>> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(None);
    }
    finalizers.push(finalizer.to_string());
    let updated = cluster.patch(resource, &meta_key(meta)?, &finalizer_patch(meta, finalizers)).await?;
    Ok(Some(updated))
}

/// Remove `finalizer` if present. Returns whether a write was issued.
pub async fn remove_finalizer(cluster: &dyn ClusterApi, resource: &ApiResource, meta: &ObjectMeta, finalizer: &str) -> Result<bool> {
    let finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != finalizer).collect();
    cluster.patch(resource, &meta_key(meta)?, &finalizer_patch(meta, remaining)).await?;
    Ok(true)
}

/// Remove `finalizer` from the stored copy of `obj`, which may have moved on
/// since `obj` was read
pub async fn release_finalizer<K>(cluster: &dyn ClusterApi, obj: &K, finalizer: &str) -> Result<bool>
where
    K: Resource<DynamicType = ()>,
{
    let resource = resource_of::<K>();
    match cluster.get(&resource, &key_of(obj)?).await? {
        Some(current) => remove_finalizer(cluster, &resource, &current.metadata, finalizer).await,
        None => Ok(false),
    }
}

/// Typed form of [`add_finalizer`], returning the object as it is stored afterwards
pub async fn with_finalizer<K>(cluster: &dyn ClusterApi, obj: K, finalizer: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match add_finalizer(cluster, &resource_of::<K>(), obj.meta(), finalizer).await? {
        Some(updated) => from_dynamic(updated),
        None => Ok(obj),
    }
}

/// Write `status` through the status subresource when it differs from the
/// object's current status. Returns whether a write was issued.
pub async fn update_status<K>(cluster: &dyn ClusterApi, obj: &K, status: &K::Status) -> Result<bool>
where
    K: NamespacedCustomResource,
    K::Status: Serialize + PartialEq,
{
    if obj.status() == Some(status) {
        return Ok(false);
    }
    let current = match obj.status() {
        Some(current) => serde_json::to_value(current)?,
        None => Value::Null,
    };
    let patch = json!({
        "metadata": { "resourceVersion": obj.meta().resource_version },
        "status": merge_diff(&current, &serde_json::to_value(status)?),
    });
    cluster.patch_status(&resource_of::<K>(), &key_of(obj)?, &patch).await?;
    Ok(true)
}

/// Native owner reference from `owner`, marked as the controller
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference> {
    owner.controller_owner_ref(&())
}
