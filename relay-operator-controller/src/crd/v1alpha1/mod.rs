pub mod common;
pub mod namespace_mapping;
pub mod object_mirror;
pub mod schema_discovery;
pub mod schema_discovery_set;
pub mod service_cluster;
