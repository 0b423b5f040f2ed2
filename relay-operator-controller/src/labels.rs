//! Index labels shared between the reconcilers.

/// ServiceCluster an object belongs to
pub const SERVICE_CLUSTER_LABEL: &str = "relay.io/service-cluster";
/// Namespace a cloned CRD was discovered from
pub const ORIGIN_NAMESPACE_LABEL: &str = "relay.io/origin-namespace";
/// Management namespace a NamespaceMapping covers
pub const MANAGEMENT_NAMESPACE_LABEL: &str = "relay.io/management-namespace";
/// SchemaDiscoverySet a SchemaDiscovery was created for
pub const DISCOVERY_CONTROLLED_BY_LABEL: &str = "schemadiscoveries.relay.io/controlled-by";
