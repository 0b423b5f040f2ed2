use kube::core::{
    admission::{AdmissionRequest, Operation},
    DynamicObject, GroupVersionKind, ResourceExt, Selector,
};

use relay_operator_common::telemetry::debug;
use relay_operator_controller::cluster::ObjectKey;
use relay_operator_controller::controller::context::Context;
use relay_operator_controller::controller::namespace_mapping::{ensure_mapping, ready_status};
use relay_operator_controller::controller::object_mirror::{build_destination, MirrorTarget};
use relay_operator_controller::controller::utils::list_typed;
use relay_operator_controller::crd::v1alpha1::common::WebhookStrategy;
use relay_operator_controller::crd::v1alpha1::object_mirror::ObjectMirror;
use relay_operator_controller::document::overlay;

use crate::admission::error::{AdmissionError, AdmissionResult};

/// Split a discovered group into its service cluster and provider namespace.
/// Namespaces cannot contain dots, so the last segment is the namespace.
pub fn parse_group(group: &str) -> AdmissionResult<(&str, &str)> {
    match group.rsplit_once('.') {
        Some((cluster, namespace)) if !cluster.is_empty() && !namespace.is_empty() => Ok((cluster, namespace)),
        _ => Err(AdmissionError::InvalidGroup(group.to_string())),
    }
}

async fn find_mirror(
    ctx: &Context,
    provider_namespace: &str,
    service_cluster: &str,
    gvk: &GroupVersionKind,
) -> AdmissionResult<ObjectMirror> {
    list_typed::<ObjectMirror>(ctx.management.as_ref(), Some(provider_namespace), &Selector::default())
        .await?
        .into_iter()
        .find(|mirror| {
            mirror.spec.service_cluster.name == service_cluster
                && mirror.spec.management_crd.group == gvk.group
                && mirror.spec.management_crd.kind == gvk.kind
        })
        .ok_or_else(|| AdmissionError::NotMirrored(provider_namespace.to_string(), format!("{}.{}", gvk.kind, gvk.group)))
}

/// Check a write to a mirrored object before it is admitted.
///
/// The object's namespace must be set up in the service cluster, which is
/// requested here if it was not already. With the `ServiceCluster` strategy the
/// resulting destination write is dry-run against the service cluster. Whether
/// that is a create or an update follows from the destination existing, not
/// from the request operation, so finalizer updates on a fresh object pass.
pub async fn validate_mirrored_object(request: &AdmissionRequest<DynamicObject>, ctx: &Context) -> AdmissionResult<()> {
    if request.operation == Operation::Delete {
        return Ok(());
    }
    let Some(object) = request.object.as_ref() else {
        return Ok(());
    };
    if object.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    let (service_cluster, provider_namespace) = parse_group(&request.kind.group)?;
    let mirror = find_mirror(ctx, provider_namespace, service_cluster, &request.kind).await?;
    let target = MirrorTarget::from_spec(&mirror.spec, provider_namespace);

    let namespace = request
        .namespace
        .clone()
        .or_else(|| object.namespace())
        .ok_or(AdmissionError::MissingField(".metadata.namespace"))?;
    let mapping = ensure_mapping(ctx.management.as_ref(), provider_namespace, &namespace, service_cluster).await?;
    let service_namespace = ready_status(&mapping)
        .and_then(|status| status.service_namespace.as_ref())
        .map(|ns| ns.name.clone())
        .ok_or_else(|| AdmissionError::MappingNotReady(namespace.clone(), service_cluster.to_string()))?;

    if target.webhook_strategy == WebhookStrategy::None {
        return Ok(());
    }

    let service = ctx.connector.connect(provider_namespace, service_cluster).await?;
    let mut source = object.clone();
    source.metadata.namespace = Some(namespace.clone());
    let desired = build_destination(&source, &target, &service_namespace);
    let key = ObjectKey::namespaced(&service_namespace, object.name_any());

    let dry_run = match service.get(&target.destination, &key).await? {
        Some(current) => {
            debug!(event = "DryRunUpdate", kind = target.destination.kind.as_str(), name = %key);
            service.dry_run_replace(&target.destination, &overlay(&current, &desired)).await
        }
        None => {
            debug!(event = "DryRunCreate", kind = target.destination.kind.as_str(), name = %key);
            service.dry_run_create(&target.destination, &desired).await
        }
    };
    dry_run
        .map(|_| ())
        .map_err(|e| AdmissionError::Rejected(service_cluster.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::admission::AdmissionReview;
    use relay_operator_controller::controller::utils::resource_of;
    use relay_operator_controller::crd::v1alpha1::common::{CRDReference, ObjectReference};
    use relay_operator_controller::crd::v1alpha1::namespace_mapping::NamespaceMapping;
    use relay_operator_controller::crd::v1alpha1::object_mirror::ObjectMirrorSpec;
    use relay_operator_controller::testing::{mirror_target, TestEnv, PROVIDER_NAMESPACE, SERVICE_CLUSTER};
    use rstest::rstest;
    use serde_json::json;

    fn seed_mirror(env: &TestEnv, strategy: WebhookStrategy) {
        let target = mirror_target();
        let reference = |resource: &kube::core::ApiResource| CRDReference {
            group: resource.group.clone(),
            version: resource.version.clone(),
            kind: resource.kind.clone(),
            plural: resource.plural.clone(),
        };
        let mut mirror = ObjectMirror::new(
            "redis.eu-west-1",
            ObjectMirrorSpec {
                management_crd: reference(&target.source),
                service_crd: reference(&target.destination),
                service_cluster: ObjectReference::new(SERVICE_CLUSTER),
                webhook_strategy: strategy,
            },
        );
        mirror.metadata.namespace = Some(PROVIDER_NAMESPACE.to_string());
        env.management.seed_typed(&mirror);
    }

    fn request(operation: &str, group: &str) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": group, "version": "v1alpha1", "kind": "Redis"},
                "resource": {"group": group, "version": "v1alpha1", "resource": "redises"},
                "name": "cache",
                "namespace": "team-a",
                "operation": operation,
                "userInfo": {"username": "tenant"},
                "object": {
                    "apiVersion": format!("{}/v1alpha1", group),
                    "kind": "Redis",
                    "metadata": {"name": "cache", "namespace": "team-a"},
                    "spec": {"size": 5},
                },
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[rstest]
    #[case::cluster_and_namespace("eu-west-1.tenant-a", Some(("eu-west-1", "tenant-a")))]
    #[case::dotted_cluster("prod.eu.tenant-a", Some(("prod.eu", "tenant-a")))]
    #[case::no_dot("tenant-a", None)]
    #[case::trailing_dot("eu-west-1.", None)]
    fn groups_split_on_the_last_dot(#[case] group: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(parse_group(group).ok(), expected);
    }

    #[tokio::test]
    async fn deletes_are_always_admitted() {
        let env = TestEnv::new();

        validate_mirrored_object(&request("DELETE", "eu-west-1.tenant-a"), &env.ctx)
            .await
            .unwrap();
        assert_eq!(env.writes(), (0, 0));
    }

    #[tokio::test]
    async fn unknown_kinds_are_denied() {
        let env = TestEnv::new();
        seed_mirror(&env, WebhookStrategy::None);

        let result = validate_mirrored_object(&request("CREATE", "us-east-1.tenant-a"), &env.ctx).await;

        assert!(matches!(result, Err(AdmissionError::NotMirrored(..))));
    }

    #[tokio::test]
    async fn denied_until_the_namespace_is_set_up() {
        let env = TestEnv::new();
        seed_mirror(&env, WebhookStrategy::None);
        let create = request("CREATE", "eu-west-1.tenant-a");

        let result = validate_mirrored_object(&create, &env.ctx).await;
        assert!(matches!(result, Err(AdmissionError::MappingNotReady(..))));
        // The mapping was requested on the first attempt
        assert_eq!(env.management.count(&resource_of::<NamespaceMapping>()), 1);

        env.ready_mapping("team-a").await;
        validate_mirrored_object(&create, &env.ctx).await.unwrap();
        assert_eq!(env.service.dry_runs(), 0);
    }

    #[tokio::test]
    async fn service_cluster_strategy_dry_runs_the_destination() {
        let env = TestEnv::new();
        seed_mirror(&env, WebhookStrategy::ServiceCluster);
        env.ready_mapping("team-a").await;
        let before = env.writes();

        validate_mirrored_object(&request("CREATE", "eu-west-1.tenant-a"), &env.ctx)
            .await
            .unwrap();
        assert_eq!(env.service.dry_runs(), 1);

        env.service.reject_dry_runs(Some("spec.size: must be at most 3"));
        let result = validate_mirrored_object(&request("UPDATE", "eu-west-1.tenant-a"), &env.ctx).await;

        match result {
            Err(AdmissionError::Rejected(cluster, message)) => {
                assert_eq!(cluster, SERVICE_CLUSTER);
                assert!(message.contains("must be at most 3"));
            }
            other => panic!("expected a rejection, got {:?}", other),
        }
        assert_eq!(env.writes(), before);
    }

    #[tokio::test]
    async fn existing_destination_is_dry_run_as_an_update() {
        let env = TestEnv::new();
        seed_mirror(&env, WebhookStrategy::ServiceCluster);
        let service_namespace = env.ready_mapping("team-a").await;
        let target = mirror_target();
        let mut existing = DynamicObject::new("cache", &target.destination).within(&service_namespace);
        existing.data = json!({"spec": {"size": 1}, "status": {"ready": true}});
        env.service.seed(&target.destination, existing);

        validate_mirrored_object(&request("CREATE", "eu-west-1.tenant-a"), &env.ctx)
            .await
            .unwrap();

        assert_eq!(env.service.dry_runs(), 1);
        let stored = env
            .service
            .object(&target.destination, &ObjectKey::namespaced(&service_namespace, "cache"))
            .unwrap();
        assert_eq!(stored.data["spec"], json!({"size": 1}));
        assert_eq!(stored.data["status"], json!({"ready": true}));
    }
}
