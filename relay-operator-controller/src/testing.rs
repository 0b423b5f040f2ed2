//! Fixtures wiring reconcilers to in-memory clusters.

use kube::{
    api::ObjectMeta,
    core::{DynamicObject, TypeMeta},
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use relay_operator_common::config::AppConfig;
use relay_operator_common::state::State;

use crate::cluster::fake::{FakeCluster, FakeConnector};
use crate::controller::context::Context;
use crate::controller::namespace_mapping::{ensure_mapping, NamespaceMappingController};
use crate::controller::object_mirror::MirrorTarget;
use crate::crd::v1alpha1::common::{CRDReference, ObjectReference, WebhookStrategy};
use crate::crd::v1alpha1::namespace_mapping::NamespaceMapping;
use crate::crd::v1alpha1::service_cluster::{ServiceCluster, ServiceClusterSpec};

pub const PROVIDER_NAMESPACE: &str = "tenant-a";
pub const SERVICE_CLUSTER: &str = "eu-west-1";

pub struct TestEnv {
    pub management: Arc<FakeCluster>,
    pub service: Arc<FakeCluster>,
    pub connector: Arc<FakeConnector>,
    pub ctx: Arc<Context>,
}

impl TestEnv {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.controller.provider_namespace = PROVIDER_NAMESPACE.to_string();
        Self::with_config(config)
    }

    pub fn with_config(config: AppConfig) -> Self {
        let management = Arc::new(FakeCluster::new("management"));
        let service = Arc::new(FakeCluster::new(SERVICE_CLUSTER));
        let connector = Arc::new(FakeConnector::default().with_cluster(service.clone()));
        let ctx = Arc::new(
            Context::new(management.clone(), connector.clone())
                .with_state(Arc::new(State::new(config))),
        );
        Self { management, service, connector, ctx }
    }

    /// Seed a ServiceCluster resource in the provider namespace, in same-cluster mode
    pub fn register_service_cluster(&self, name: &str, labels: &[(&str, &str)]) -> ServiceCluster {
        self.seed_service_cluster(name, labels, None)
    }

    /// Seed a ServiceCluster reached through a kubeconfig secret
    pub fn register_remote_service_cluster(&self, name: &str) -> ServiceCluster {
        self.seed_service_cluster(name, &[], Some(ObjectReference::new(format!("{}-kubeconfig", name))))
    }

    fn seed_service_cluster(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        kubeconfig_secret: Option<ObjectReference>,
    ) -> ServiceCluster {
        let cluster = ServiceCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(PROVIDER_NAMESPACE.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: ServiceClusterSpec {
                metadata: Default::default(),
                kubeconfig_secret,
            },
            status: None,
        };
        self.management.seed_typed(&cluster);
        self.management
            .typed(Some(PROVIDER_NAMESPACE), name)
            .expect("seeded service cluster")
    }

    /// Create and reconcile the NamespaceMapping for `management_namespace`,
    /// returning the service namespace it resolved to
    pub async fn reconcile_mapping(&self, management_namespace: &str) -> String {
        let mapping = ensure_mapping(self.management.as_ref(), PROVIDER_NAMESPACE, management_namespace, SERVICE_CLUSTER)
            .await
            .expect("mapping ensured");
        let name = mapping.metadata.name.clone().unwrap_or_default();
        NamespaceMappingController::reconcile(Arc::new(mapping), self.ctx.clone())
            .await
            .expect("mapping reconciled");

        let mapping: NamespaceMapping = self
            .management
            .typed(Some(PROVIDER_NAMESPACE), &name)
            .expect("mapping exists");
        mapping
            .status
            .and_then(|s| s.service_namespace)
            .map(|ns| ns.name)
            .expect("service namespace recorded")
    }

    /// Register the default service cluster when missing and bring a mapping
    /// for `management_namespace` to Ready
    pub async fn ready_mapping(&self, management_namespace: &str) -> String {
        if self
            .management
            .typed::<ServiceCluster>(Some(PROVIDER_NAMESPACE), SERVICE_CLUSTER)
            .is_none()
        {
            self.register_service_cluster(SERVICE_CLUSTER, &[]);
        }
        self.reconcile_mapping(management_namespace).await
    }

    pub fn writes(&self) -> (usize, usize) {
        (self.management.writes(), self.service.writes())
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

fn redis(group: &str) -> CRDReference {
    CRDReference {
        group: group.to_string(),
        version: "v1alpha1".to_string(),
        kind: "Redis".to_string(),
        plural: "redises".to_string(),
    }
}

/// Redis in the discovered group mirrored to Redis in `cache.example.io`
pub fn mirror_target() -> MirrorTarget {
    MirrorTarget::new(
        &redis("eu-west-1.tenant-a"),
        &redis("cache.example.io"),
        SERVICE_CLUSTER,
        PROVIDER_NAMESPACE,
        WebhookStrategy::None,
    )
}

/// A source object of [`mirror_target`] with `body` as its top-level keys
pub fn source_object(namespace: &str, name: &str, body: Value) -> DynamicObject {
    let source = mirror_target().source;
    DynamicObject {
        types: Some(TypeMeta {
            api_version: source.api_version.clone(),
            kind: source.kind.clone(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: body,
    }
}
