use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionedStatus, Phase};
use crate::crd::preserve_unknown_fields;
use crate::crd::v1alpha1::common::{ObjectReference, WebhookStrategy};

pub const DISCOVERED: &str = "Discovered";
pub const ESTABLISHED: &str = "Established";
pub const CONTROLLER_READY: &str = "ControllerReady";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "SchemaDiscovery",
    group = "relay.io",
    version = "v1alpha1",
    status = "SchemaDiscoveryStatus",
    plural = "schemadiscoveries",
    doc = "SchemaDiscovery clones a CustomResourceDefinition from a service cluster into the management cluster.",
    derive = "PartialEq",
    printcolumn = r#"{"name":"CRD", "type":"string", "jsonPath":".spec.crd.name"}"#,
    printcolumn = r#"{"name":"Service Cluster", "type":"string", "jsonPath":".spec.serviceCluster.name"}"#,
    printcolumn = r#"{"name":"Local CRD", "type":"string", "jsonPath":".status.localCRD.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"Current phase of the resource", "jsonPath":".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiscoverySpec {
    /// Name of the CustomResourceDefinition in the service cluster
    pub crd: ObjectReference,
    /// ServiceCluster to discover the CustomResourceDefinition in
    pub service_cluster: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Kind to register the clone under instead of the remote kind
    pub kind_override: Option<String>,
    #[serde(default)]
    pub webhook_strategy: WebhookStrategy,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiscoveryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    /// Last copy of the remote CustomResourceDefinition
    pub cloned_schema: Option<CustomResourceDefinition>,
    #[serde(default, rename = "localCRD", skip_serializing_if = "Option::is_none")]
    /// CustomResourceDefinition registered in the management cluster
    pub local_crd: Option<ObjectReference>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ConditionedStatus for SchemaDiscoveryStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
    fn phase_mut(&mut self) -> &mut Phase { &mut self.phase }
    fn observed_generation(&self) -> Option<i64> { self.observed_generation }
}
