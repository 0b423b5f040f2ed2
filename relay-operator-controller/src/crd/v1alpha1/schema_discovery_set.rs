use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionedStatus, Phase};
use crate::crd::v1alpha1::common::{ObjectReference, WebhookStrategy};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "SchemaDiscoverySet",
    group = "relay.io",
    version = "v1alpha1",
    status = "SchemaDiscoverySetStatus",
    doc = "SchemaDiscoverySet discovers the same CustomResourceDefinition in every matching ServiceCluster.",
    derive = "PartialEq",
    printcolumn = r#"{"name":"CRD", "type":"string", "jsonPath":".spec.crd.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"Current phase of the resource", "jsonPath":".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiscoverySetSpec {
    /// Name of the CustomResourceDefinition in each service cluster
    pub crd: ObjectReference,
    /// Selects the ServiceClusters in this namespace to discover from
    pub service_cluster_selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind_override: Option<String>,
    #[serde(default)]
    pub webhook_strategy: WebhookStrategy,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiscoverySetStatus {
    #[serde(default, rename = "managementClusterCRDs")]
    /// Local clones registered by the children of this set
    pub management_cluster_crds: Vec<ManagementClusterCRD>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagementClusterCRD {
    pub name: String,
    pub service_cluster: ObjectReference,
}

impl ConditionedStatus for SchemaDiscoverySetStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
    fn phase_mut(&mut self) -> &mut Phase { &mut self.phase }
    fn observed_generation(&self) -> Option<i64> { self.observed_generation }
}
