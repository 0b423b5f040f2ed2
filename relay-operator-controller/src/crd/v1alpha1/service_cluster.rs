use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionedStatus, Phase};
use crate::crd::v1alpha1::common::ObjectReference;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "ServiceCluster",
    group = "relay.io",
    version = "v1alpha1",
    status = "ServiceClusterStatus",
    doc = "ServiceCluster registers a cluster that mirrored objects and discovered schemas live in.",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Display Name", "type":"string", "jsonPath":".spec.metadata.displayName"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "description":"Kubernetes version of the cluster", "jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"Current phase of the resource", "jsonPath":".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClusterSpec {
    #[serde(default)]
    /// Human facing description of the cluster
    pub metadata: ServiceClusterMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Secret in the same namespace holding a kubeconfig for the cluster.
    /// When unset the management cluster itself is used.
    pub kubeconfig_secret: Option<ObjectReference>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClusterMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Version reported by the cluster's API server on the last successful probe
    pub kubernetes_version: Option<String>,
}

impl ConditionedStatus for ServiceClusterStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
    fn phase_mut(&mut self) -> &mut Phase { &mut self.phase }
    fn observed_generation(&self) -> Option<i64> { self.observed_generation }
}
