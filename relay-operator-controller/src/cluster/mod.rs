//! Access to the management and service clusters.
//!
//! Every reconciler talks to clusters through [`ClusterApi`], a dynamically
//! typed get/list/create/replace/patch/delete capability over one named
//! cluster, and resolves service clusters through a [`ClusterConnector`].

pub mod client;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod fake;

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, Selector};
use serde_json::Value;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use crate::error::Result;

/// Namespace (absent for cluster scoped kinds) and name of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn of(obj: &DynamicObject) -> Option<Self> {
        Some(Self {
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
        })
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Result of asking a cluster to delete an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object still exists, held by finalizers or cascading deletion
    Deleting,
    /// The object was removed by this call
    Deleted,
    /// There was nothing to delete
    NotFound,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Name of the cluster, used in logs and errors
    fn name(&self) -> &str;

    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects matching `selector`, across all namespaces when `namespace` is None
    async fn list(&self, resource: &ApiResource, namespace: Option<&str>, selector: &Selector) -> Result<Vec<DynamicObject>>;

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace the object. The object's resourceVersion, when set, must match the stored one.
    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to the object
    async fn patch(&self, resource: &ApiResource, key: &ObjectKey, patch: &Value) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to the status subresource
    async fn patch_status(&self, resource: &ApiResource, key: &ObjectKey, patch: &Value) -> Result<DynamicObject>;

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DeleteOutcome>;

    /// Validate a create without persisting it
    async fn dry_run_create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Validate a replace without persisting it
    async fn dry_run_replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Version string reported by the API server
    async fn server_version(&self) -> Result<String>;
}

/// Resolves a ServiceCluster registered in `namespace` to a cluster handle
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, namespace: &str, service_cluster: &str) -> Result<Arc<dyn ClusterApi>>;
}
