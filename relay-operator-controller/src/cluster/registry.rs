use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    config::{Config, KubeConfigOptions, Kubeconfig},
    Client,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use relay_operator_common::telemetry::{debug, info};

use crate::cluster::{client::KubeCluster, ClusterApi, ClusterConnector};
use crate::crd::v1alpha1::service_cluster::ServiceCluster;
use crate::error::{ControllerError, Result};

struct CachedClient {
    secret_version: Option<String>,
    client: Client,
}

/// Builds and caches clients for registered ServiceClusters.
///
/// Clients are keyed by (namespace, cluster) and rebuilt whenever the
/// kubeconfig secret's resourceVersion changes. A ServiceCluster without a
/// kubeconfig secret resolves to the management client.
pub struct ClusterRegistry {
    management: Client,
    secret_key: String,
    cache: Mutex<HashMap<(String, String), CachedClient>>,
}

impl ClusterRegistry {
    pub fn new(management: Client, secret_key: impl Into<String>) -> Self {
        Self {
            management,
            secret_key: secret_key.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn management_client(&self) -> Client {
        self.management.clone()
    }

    /// Client for the ServiceCluster `cluster` registered in `namespace`
    pub async fn client_for(&self, namespace: &str, cluster: &str) -> Result<Client> {
        let clusters: Api<ServiceCluster> = Api::namespaced(self.management.clone(), namespace);
        let service_cluster = clusters
            .get_opt(cluster)
            .await?
            .ok_or_else(|| ControllerError::NotFoundError(format!("ServiceCluster {}/{}", namespace, cluster)))?;

        let Some(secret_ref) = service_cluster.spec.kubeconfig_secret else {
            debug!(event = "SameClusterMode", cluster = cluster, namespace = namespace);
            return Ok(self.management.clone());
        };

        let secrets: Api<Secret> = Api::namespaced(self.management.clone(), namespace);
        let secret = secrets
            .get_opt(&secret_ref.name)
            .await?
            .ok_or_else(|| ControllerError::NotFoundError(format!("Secret {}/{}", namespace, secret_ref.name)))?;
        let secret_version = secret.metadata.resource_version.clone();

        let key = (namespace.to_string(), cluster.to_string());
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&key) {
            if cached.secret_version == secret_version {
                return Ok(cached.client.clone());
            }
        }

        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&self.secret_key))
            .ok_or_else(|| ControllerError::KubeconfigError(format!(
                "secret {}/{} has no `{}` key", namespace, secret_ref.name, self.secret_key
            )))?;
        let yaml = String::from_utf8(raw.0.clone())
            .map_err(|e| ControllerError::KubeconfigError(e.to_string()))?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| ControllerError::KubeconfigError(e.to_string()))?;
        let client = client_from_kubeconfig(kubeconfig).await?;

        info!(event = "ClusterClientBuilt", cluster = cluster, namespace = namespace);
        cache.insert(key, CachedClient { secret_version, client: client.clone() });
        Ok(client)
    }
}

#[async_trait]
impl ClusterConnector for ClusterRegistry {
    async fn connect(&self, namespace: &str, service_cluster: &str) -> Result<Arc<dyn ClusterApi>> {
        let client = self.client_for(namespace, service_cluster).await?;
        Ok(Arc::new(KubeCluster::new(service_cluster, client)))
    }
}

/// Resolves every service cluster to one fixed client, for a standalone mirror
/// process started with its own kubeconfig
pub struct StaticConnector {
    name: String,
    client: Client,
}

impl StaticConnector {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self { name: name.into(), client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self, _namespace: &str, _service_cluster: &str) -> Result<Arc<dyn ClusterApi>> {
        Ok(Arc::new(KubeCluster::new(self.name.clone(), self.client.clone())))
    }
}

pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ControllerError::KubeconfigError(e.to_string()))?;
    Client::try_from(config).map_err(ControllerError::from)
}

pub async fn client_from_kubeconfig_file(path: impl AsRef<Path>) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| ControllerError::KubeconfigError(e.to_string()))?;
    client_from_kubeconfig(kubeconfig).await
}
