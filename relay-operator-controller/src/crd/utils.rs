use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use kube::core::crd::merge_crds;

use crate::crd::v1alpha1::{
    namespace_mapping::NamespaceMapping,
    object_mirror::ObjectMirror,
    schema_discovery::SchemaDiscovery,
    schema_discovery_set::SchemaDiscoverySet,
    service_cluster::ServiceCluster,
};
use crate::error::{ControllerError, Result};

/// All CRDs served by the operator, one per kind with every version merged
pub fn crds() -> Result<Vec<CustomResourceDefinition>> {
    [
        vec![ServiceCluster::crd()],
        vec![NamespaceMapping::crd()],
        vec![SchemaDiscovery::crd()],
        vec![SchemaDiscoverySet::crd()],
        vec![ObjectMirror::crd()],
    ]
    .into_iter()
    .map(|versions| {
        merge_crds(versions, "v1alpha1").map_err(|e| ControllerError::UnknownError(e.to_string()))
    })
    .collect()
}

/// Render the CRDs as a multi-document YAML stream
pub fn render_crds() -> Result<String> {
    let mut out = String::new();
    for crd in crds()? {
        out.push_str("---\n");
        out.push_str(
            &serde_norway::to_string(&crd).map_err(|e| ControllerError::UnknownError(e.to_string()))?,
        );
    }
    Ok(out)
}

/// Generate the CRDs for the operator
pub fn generate_crds() -> Result<()> {
    print!("{}", render_crds()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_rendered_namespaced() {
        let crds = crds().unwrap();
        let names: Vec<_> = crds.iter().filter_map(|c| c.metadata.name.clone()).collect();

        assert_eq!(names, vec![
            "serviceclusters.relay.io",
            "namespacemappings.relay.io",
            "schemadiscoveries.relay.io",
            "schemadiscoverysets.relay.io",
            "objectmirrors.relay.io",
        ]);
        assert!(crds.iter().all(|c| c.spec.scope == "Namespaced"));
    }

    #[test]
    fn rendered_stream_has_one_document_per_kind() {
        let yaml = render_crds().unwrap();

        assert_eq!(yaml.matches("---\n").count(), 5);
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields: true"));
    }
}
