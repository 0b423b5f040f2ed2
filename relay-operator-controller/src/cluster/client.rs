use async_trait::async_trait;
use either::Either;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, Selector},
    Client,
};
use serde_json::Value;

use crate::cluster::{ClusterApi, DeleteOutcome, ObjectKey};
use crate::controller::utils::FIELD_MANAGER;
use crate::error::{ControllerError, Result};

/// [`ClusterApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeCluster {
    name: String,
    client: Client,
}

impl KubeCluster {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self { name: name.into(), client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn map_error(&self, err: kube::Error) -> ControllerError {
        classify_error(&self.name, err)
    }

    fn post_params(dry_run: bool) -> PostParams {
        PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Sort kube errors from `cluster` into the controller's taxonomy. Transport
/// and authentication failures count as the cluster being unreachable.
fn classify_error(cluster: &str, err: kube::Error) -> ControllerError {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 => ControllerError::ConflictError(err.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => ControllerError::NotFoundError(err.to_string()),
        kube::Error::HyperError(_)
        | kube::Error::Service(_)
        | kube::Error::ReadEvents(_)
        | kube::Error::TlsRequired
        | kube::Error::Auth(_) => ControllerError::unreachable(cluster, err),
        _ => ControllerError::KubeError(err),
    }
}

fn name_of(obj: &DynamicObject) -> Result<&str> {
    obj.metadata
        .name
        .as_deref()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        self.api(resource, key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn list(&self, resource: &ApiResource, namespace: Option<&str>, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels_from(selector);
        self.api(resource, namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| self.map_error(e))
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(resource, obj.metadata.namespace.as_deref())
            .create(&Self::post_params(false), obj)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(resource, obj.metadata.namespace.as_deref())
            .replace(name_of(obj)?, &Self::post_params(false), obj)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn patch(&self, resource: &ApiResource, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        self.api(resource, key.namespace.as_deref())
            .patch(&key.name, &Self::patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn patch_status(&self, resource: &ApiResource, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        self.api(resource, key.namespace.as_deref())
            .patch_status(&key.name, &Self::patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DeleteOutcome> {
        match self
            .api(resource, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(Either::Left(_)) => Ok(DeleteOutcome::Deleting),
            Ok(Either::Right(_)) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(self.map_error(e)),
        }
    }

    async fn dry_run_create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(resource, obj.metadata.namespace.as_deref())
            .create(&Self::post_params(true), obj)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn dry_run_replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(resource, obj.metadata.namespace.as_deref())
            .replace(name_of(obj)?, &Self::post_params(true), obj)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn server_version(&self) -> Result<String> {
        self.client
            .apiserver_version()
            .await
            .map(|info| info.git_version)
            .map_err(|e| self.map_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_unreachable() {
        let refused = kube::Error::Service(Box::new(std::io::Error::other("connection refused")));

        let err = classify_error("eu-west-1", refused);
        assert!(matches!(err, ControllerError::RemoteUnreachableError { ref cluster, .. } if cluster == "eu-west-1"));
        assert!(matches!(
            classify_error("eu-west-1", kube::Error::TlsRequired),
            ControllerError::RemoteUnreachableError { .. }
        ));
    }

    #[test]
    fn decoding_failures_are_not_unreachable() {
        let decode = serde_json::from_str::<Value>("{").unwrap_err();

        let err = classify_error("eu-west-1", kube::Error::SerdeError(decode));
        assert!(matches!(err, ControllerError::KubeError(kube::Error::SerdeError(_))));
        assert_eq!(err.reason(), "Error");
    }
}
