use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionedStatus, Phase};
use crate::crd::v1alpha1::common::ObjectReference;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "NamespaceMapping",
    group = "relay.io",
    version = "v1alpha1",
    status = "NamespaceMappingStatus",
    doc = "NamespaceMapping pairs a management namespace with a namespace in a service cluster.",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Service Cluster", "type":"string", "jsonPath":".spec.serviceCluster.name"}"#,
    printcolumn = r#"{"name":"Management Namespace", "type":"string", "jsonPath":".spec.managementNamespace.name"}"#,
    printcolumn = r#"{"name":"Service Namespace", "type":"string", "jsonPath":".status.serviceNamespace.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"Current phase of the resource", "jsonPath":".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMappingSpec {
    /// ServiceCluster the namespace is created in
    pub service_cluster: ObjectReference,
    /// Namespace in the management cluster whose objects are mirrored
    pub management_namespace: ObjectReference,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMappingStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Namespace created in the service cluster
    pub service_namespace: Option<ObjectReference>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ConditionedStatus for NamespaceMappingStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
    fn phase_mut(&mut self) -> &mut Phase { &mut self.phase }
    fn observed_generation(&self) -> Option<i64> { self.observed_generation }
}
