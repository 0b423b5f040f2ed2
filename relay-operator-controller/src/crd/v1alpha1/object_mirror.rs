use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionedStatus, Phase};
use crate::crd::v1alpha1::common::{CRDReference, ObjectReference, WebhookStrategy};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "ObjectMirror",
    group = "relay.io",
    version = "v1alpha1",
    status = "ObjectMirrorStatus",
    doc = "ObjectMirror runs a mirror loop between a management cluster kind and a service cluster kind.",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Management Kind", "type":"string", "jsonPath":".spec.managementCRD.kind"}"#,
    printcolumn = r#"{"name":"Service Kind", "type":"string", "jsonPath":".spec.serviceCRD.kind"}"#,
    printcolumn = r#"{"name":"Service Cluster", "type":"string", "jsonPath":".spec.serviceCluster.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"Current phase of the resource", "jsonPath":".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMirrorSpec {
    #[serde(rename = "managementCRD")]
    /// Source kind in the management cluster
    pub management_crd: CRDReference,
    #[serde(rename = "serviceCRD")]
    /// Destination kind in the service cluster
    pub service_crd: CRDReference,
    pub service_cluster: ObjectReference,
    #[serde(default)]
    pub webhook_strategy: WebhookStrategy,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMirrorStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ConditionedStatus for ObjectMirrorStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
    fn phase_mut(&mut self) -> &mut Phase { &mut self.phase }
    fn observed_generation(&self) -> Option<i64> { self.observed_generation }
}
