use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    core::{Expression, Selector},
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    Client, Resource,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use relay_operator_common::telemetry::info;

use crate::cluster::{ClusterApi, DeleteOutcome};
use crate::condition::{Condition, ConditionStatus, ConditionedStatus, TERMINATING_REASON};
use crate::controller::context::Context;
use crate::controller::utils::{
    create_typed, delete_typed, get_typed, list_typed, release_finalizer, replace_typed, reset_backoff,
    update_status, waiting, with_finalizer,
};
use crate::crd::v1alpha1::common::ObjectReference;
use crate::crd::v1alpha1::namespace_mapping::{NamespaceMapping, NamespaceMappingSpec, NamespaceMappingStatus};
use crate::crd::v1alpha1::service_cluster::ServiceCluster;
use crate::error::{ControllerError, Result};
use crate::labels::{MANAGEMENT_NAMESPACE_LABEL, SERVICE_CLUSTER_LABEL};
use crate::ownership::{is_owned_by, owner_of, set_owner, Owner};

pub static FINALIZER: &str = "namespacemappings.finalizers.relay.io";

pub const SETUP_COMPLETE_REASON: &str = "SetupComplete";
pub const CREATING_NAMESPACE_REASON: &str = "CreatingNamespace";
pub const SERVICE_CLUSTER_NOT_FOUND_REASON: &str = "ServiceClusterNotFound";
pub const NAMESPACE_TERMINATING_REASON: &str = "NamespaceTerminating";

pub struct NamespaceMappingController;

impl NamespaceMappingController {
    /// Create a new controller for the NamespaceMapping resource
    ///
    /// # Arguments
    /// * `client` - Client for the management cluster
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// The controller for the NamespaceMapping resource
    pub fn create_controller(client: Client, ctx: &Context) -> Controller<NamespaceMapping> {
        let config = &ctx.config().controller;
        let api = Api::<NamespaceMapping>::namespaced(client, &config.provider_namespace);

        Controller::new(api, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(config.concurrency))
    }

    /// Reconcile the NamespaceMapping resource
    ///
    /// # Arguments
    /// * `mapping` - The NamespaceMapping resource to reconcile
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// An action to take after reconciling the NamespaceMapping resource
    pub async fn reconcile(mapping: Arc<NamespaceMapping>, ctx: Arc<Context>) -> Result<Action> {
        let action = if mapping.meta().deletion_timestamp.is_some() {
            cleanup_mapping(&mapping, &ctx).await?
        } else {
            reconcile_mapping(mapping.as_ref().clone(), &ctx).await?
        };

        reset_backoff(mapping.as_ref(), &ctx);
        Ok(action)
    }
}

/// Name of the NamespaceMapping for a management namespace and service cluster
pub fn mapping_name(management_namespace: &str, service_cluster: &str) -> String {
    format!("{}.{}", management_namespace, service_cluster)
}

/// Name of the namespace objects from `management_namespace` land in. In
/// same-cluster mode the cluster name is appended so the source and
/// destination namespaces never coincide.
pub fn service_namespace_name(management_namespace: &str, service_cluster: &str, same_cluster: bool) -> String {
    if same_cluster {
        format!("{}-{}", management_namespace, service_cluster)
    } else {
        management_namespace.to_string()
    }
}

fn mapping_owner(mapping: &NamespaceMapping) -> Owner {
    Owner::new(
        mapping.name_any(),
        mapping.namespace().unwrap_or_default(),
        NamespaceMapping::group(&()),
        NamespaceMapping::kind(&()),
    )
}

fn selector(service_cluster: &str, management_namespace: Option<&str>) -> Selector {
    let mut expressions = vec![Expression::Equal(SERVICE_CLUSTER_LABEL.to_string(), service_cluster.to_string())];
    if let Some(namespace) = management_namespace {
        expressions.push(Expression::Equal(MANAGEMENT_NAMESPACE_LABEL.to_string(), namespace.to_string()));
    }
    Selector::from_iter(expressions)
}

/// The NamespaceMapping for `management_namespace` in `service_cluster`, if any
pub async fn find_mapping(
    management: &dyn ClusterApi,
    provider_namespace: &str,
    management_namespace: &str,
    service_cluster: &str,
) -> Result<Option<NamespaceMapping>> {
    let mut found = list_typed::<NamespaceMapping>(
        management,
        Some(provider_namespace),
        &selector(service_cluster, Some(management_namespace)),
    )
    .await?;

    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        n => Err(ControllerError::InvariantViolationError(format!(
            "found {} NamespaceMappings for namespace {} in ServiceCluster {}",
            n, management_namespace, service_cluster
        ))),
    }
}

/// Find the NamespaceMapping for `management_namespace` in `service_cluster`,
/// creating it when absent.
///
/// # Arguments
/// * `management` - The management cluster
/// * `provider_namespace` - Namespace holding the mappings
/// * `management_namespace` - Namespace whose objects are mirrored
/// * `service_cluster` - Name of the ServiceCluster
///
/// # Returns
/// The single mapping for the pair, or an InvariantViolation when several exist
pub async fn ensure_mapping(
    management: &dyn ClusterApi,
    provider_namespace: &str,
    management_namespace: &str,
    service_cluster: &str,
) -> Result<NamespaceMapping> {
    if let Some(mapping) = find_mapping(management, provider_namespace, management_namespace, service_cluster).await? {
        return Ok(mapping);
    }

    let mapping = NamespaceMapping {
        metadata: ObjectMeta {
            name: Some(mapping_name(management_namespace, service_cluster)),
            namespace: Some(provider_namespace.to_string()),
            labels: Some(BTreeMap::from([
                (SERVICE_CLUSTER_LABEL.to_string(), service_cluster.to_string()),
                (MANAGEMENT_NAMESPACE_LABEL.to_string(), management_namespace.to_string()),
            ])),
            ..Default::default()
        },
        spec: NamespaceMappingSpec {
            service_cluster: ObjectReference::new(service_cluster),
            management_namespace: ObjectReference::new(management_namespace),
        },
        status: None,
    };
    info!(
        event = "CreatingNamespaceMapping",
        name = %mapping.name_any(),
        namespace = provider_namespace,
    );
    create_typed(management, &mapping).await
}

/// Reverse lookup: the mapping whose service namespace is `service_namespace`
pub async fn find_by_service_namespace(
    management: &dyn ClusterApi,
    provider_namespace: &str,
    service_cluster: &str,
    service_namespace: &str,
) -> Result<Option<NamespaceMapping>> {
    let mut found: Vec<NamespaceMapping> =
        list_typed::<NamespaceMapping>(management, Some(provider_namespace), &selector(service_cluster, None))
            .await?
            .into_iter()
            .filter(|m| {
                m.status
                    .as_ref()
                    .and_then(|s| s.service_namespace.as_ref())
                    .is_some_and(|ns| ns.name == service_namespace)
            })
            .collect();

    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        n => Err(ControllerError::InvariantViolationError(format!(
            "found {} NamespaceMappings for service namespace {} in ServiceCluster {}",
            n, service_namespace, service_cluster
        ))),
    }
}

enum NamespaceState {
    Ready,
    Terminating,
}

/// Claim the namespace `name` in `service` for `owner`
async fn ensure_namespace(service: &dyn ClusterApi, owner: &Owner, name: &str) -> Result<NamespaceState> {
    match get_typed::<Namespace>(service, None, name).await? {
        None => {
            let mut namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            set_owner(&mut namespace.metadata, owner);
            info!(event = "CreatingNamespace", name = name, cluster = service.name());
            create_typed(service, &namespace).await?;
            Ok(NamespaceState::Ready)
        }
        Some(namespace) if namespace.metadata.deletion_timestamp.is_some() => Ok(NamespaceState::Terminating),
        Some(namespace) if is_owned_by(&namespace.metadata, owner) => Ok(NamespaceState::Ready),
        Some(namespace) => {
            if let Some((owner_name, owner_namespace, _)) = owner_of(&namespace.metadata) {
                return Err(ControllerError::OwnershipError(format!(
                    "namespace {} in {} is owned by {}/{}",
                    name,
                    service.name(),
                    owner_namespace,
                    owner_name
                )));
            }

            let mut adopted = namespace;
            set_owner(&mut adopted.metadata, owner);
            info!(event = "AdoptingNamespace", name = name, cluster = service.name());
            replace_typed(service, &adopted).await?;
            Ok(NamespaceState::Ready)
        }
    }
}

async fn reconcile_mapping(mapping: NamespaceMapping, ctx: &Context) -> Result<Action> {
    let namespace = mapping
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let management = ctx.management.as_ref();
    let mapping = with_finalizer(management, mapping, FINALIZER).await?;

    let mut status = mapping.status.clone().unwrap_or_default();
    status.observed_generation = mapping.meta().generation;
    let cluster_name = mapping.spec.service_cluster.name.clone();

    let Some(cluster) = get_typed::<ServiceCluster>(management, Some(&namespace), &cluster_name).await? else {
        status.set_condition(Condition::ready(
            ConditionStatus::False,
            SERVICE_CLUSTER_NOT_FOUND_REASON,
            format!("ServiceCluster {} does not exist", cluster_name),
        ));
        update_status(management, &mapping, &status).await?;
        return Ok(waiting(ctx, "NamespaceMapping", &mapping.name_any(), SERVICE_CLUSTER_NOT_FOUND_REASON));
    };

    let service_namespace = service_namespace_name(
        &mapping.spec.management_namespace.name,
        &cluster_name,
        cluster.spec.kubeconfig_secret.is_none(),
    );

    let outcome = async {
        let service = ctx.connector.connect(&namespace, &cluster_name).await?;
        ensure_namespace(service.as_ref(), &mapping_owner(&mapping), &service_namespace).await
    }
    .await;

    match outcome {
        Ok(NamespaceState::Ready) => {
            status.service_namespace = Some(ObjectReference::new(&service_namespace));
            status.set_condition(Condition::ready(
                ConditionStatus::True,
                SETUP_COMPLETE_REASON,
                format!("namespace {} is ready in {}", service_namespace, cluster_name),
            ));
            if update_status(management, &mapping, &status).await? {
                info!(event = "Reconciled", kind = "NamespaceMapping", name = %mapping.name_any());
            }
            Ok(Action::requeue(ctx.state.resync_after()))
        }
        Ok(NamespaceState::Terminating) => {
            status.set_condition(Condition::ready(
                ConditionStatus::False,
                NAMESPACE_TERMINATING_REASON,
                format!("namespace {} is still terminating in {}", service_namespace, cluster_name),
            ));
            update_status(management, &mapping, &status).await?;
            Ok(waiting(ctx, "NamespaceMapping", &mapping.name_any(), NAMESPACE_TERMINATING_REASON))
        }
        Err(error) => {
            let reason = match error {
                ControllerError::RemoteUnreachableError { .. } => error.reason(),
                _ => CREATING_NAMESPACE_REASON,
            };
            status.set_condition(Condition::ready(ConditionStatus::False, reason, error.to_string()));
            update_status(management, &mapping, &status).await?;
            Err(error)
        }
    }
}

async fn cleanup_mapping(mapping: &NamespaceMapping, ctx: &Context) -> Result<Action> {
    let namespace = mapping
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let management = ctx.management.as_ref();
    let cluster_name = &mapping.spec.service_cluster.name;

    let mut status = mapping.status.clone().unwrap_or_default();
    status.set_condition(Condition::ready(
        ConditionStatus::False,
        TERMINATING_REASON,
        "removing the service namespace",
    ));
    update_status(management, mapping, &status).await?;

    let Some(service_namespace) = status.service_namespace.as_ref().map(|ns| ns.name.clone()) else {
        // The namespace was never set up
        release(management, mapping).await?;
        return Ok(Action::await_change());
    };

    let service = ctx.connector.connect(&namespace, cluster_name).await?;
    let gone = match get_typed::<Namespace>(service.as_ref(), None, &service_namespace).await? {
        None => true,
        Some(ns) if !is_owned_by(&ns.metadata, &mapping_owner(mapping)) => true,
        Some(_) => {
            info!(event = "DeletingNamespace", name = %service_namespace, cluster = service.name());
            delete_typed::<Namespace>(service.as_ref(), None, &service_namespace).await? == DeleteOutcome::NotFound
        }
    };

    if !gone {
        return Ok(waiting(ctx, "NamespaceMapping", &mapping.name_any(), "NamespaceDeletionPending"));
    }

    release(management, mapping).await?;
    Ok(Action::await_change())
}

async fn release(management: &dyn ClusterApi, mapping: &NamespaceMapping) -> Result<()> {
    release_finalizer(management, mapping, FINALIZER).await?;
    info!(event = "Reconciled", kind = "NamespaceMapping", name = %mapping.name_any(), deleted = true);
    Ok(())
}

/// Status of `mapping` when it is ready for its current generation
pub fn ready_status(mapping: &NamespaceMapping) -> Option<&NamespaceMappingStatus> {
    let status = mapping.status.as_ref()?;
    crate::condition::is_ready(Some(status), mapping.meta().generation).then_some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Phase, READY};
    use crate::controller::utils::resource_of;
    use crate::testing::{TestEnv, PROVIDER_NAMESPACE, SERVICE_CLUSTER};

    async fn reconcile(env: &TestEnv, name: &str) -> Result<Action> {
        let mapping: NamespaceMapping = env
            .management
            .typed(Some(PROVIDER_NAMESPACE), name)
            .expect("mapping exists");
        NamespaceMappingController::reconcile(Arc::new(mapping), env.ctx.clone()).await
    }

    fn service_namespace(env: &TestEnv, name: &str) -> Option<Namespace> {
        env.service.typed(None, name)
    }

    #[tokio::test]
    async fn ensure_mapping_creates_once_and_then_returns_it() {
        let env = TestEnv::new();
        let management = env.management.as_ref();

        let created = ensure_mapping(management, PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();
        let found = ensure_mapping(management, PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();

        assert_eq!(created.name_any(), "team-a.eu-west-1");
        assert_eq!(found.meta().uid, created.meta().uid);
        assert_eq!(env.management.count(&resource_of::<NamespaceMapping>()), 1);
    }

    #[tokio::test]
    async fn duplicate_mappings_are_an_invariant_violation() {
        let env = TestEnv::new();
        let management = env.management.as_ref();
        let first = ensure_mapping(management, PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();
        let mut second = first.clone();
        second.metadata.name = Some("copy".to_string());
        second.metadata.resource_version = None;
        env.management.seed_typed(&second);

        let err = ensure_mapping(management, PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvariantViolationError(_)));
    }

    #[tokio::test]
    async fn mapping_lifecycle_creates_and_removes_the_service_namespace() {
        let env = TestEnv::new();
        env.register_service_cluster(SERVICE_CLUSTER, &[]);
        ensure_mapping(env.management.as_ref(), PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();
        let name = mapping_name("team-a", SERVICE_CLUSTER);

        reconcile(&env, &name).await.unwrap();

        let mapping: NamespaceMapping = env.management.typed(Some(PROVIDER_NAMESPACE), &name).unwrap();
        let status = mapping.status.clone().unwrap();
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.condition(READY).unwrap().reason, SETUP_COMPLETE_REASON);
        // Same-cluster mode suffixes the cluster name
        assert_eq!(status.service_namespace, Some(ObjectReference::new("team-a-eu-west-1")));
        assert!(ready_status(&mapping).is_some());

        let created = service_namespace(&env, "team-a-eu-west-1").expect("namespace created");
        assert!(is_owned_by(&created.metadata, &mapping_owner(&mapping)));

        // Hold the namespace open so the mapping has to wait for it
        let mut held = created;
        held.metadata.finalizers = Some(vec!["kubernetes".to_string()]);
        replace_typed(env.service.as_ref(), &held).await.unwrap();

        delete_typed::<NamespaceMapping>(env.management.as_ref(), Some(PROVIDER_NAMESPACE), &name)
            .await
            .unwrap();
        reconcile(&env, &name).await.unwrap();

        let mapping: NamespaceMapping = env.management.typed(Some(PROVIDER_NAMESPACE), &name).unwrap();
        assert_eq!(mapping.status.unwrap().phase, Phase::Terminating);
        assert!(service_namespace(&env, "team-a-eu-west-1").unwrap().metadata.deletion_timestamp.is_some());

        let mut terminating = service_namespace(&env, "team-a-eu-west-1").unwrap();
        terminating.metadata.finalizers = None;
        replace_typed(env.service.as_ref(), &terminating).await.unwrap();
        assert!(service_namespace(&env, "team-a-eu-west-1").is_none());

        reconcile(&env, &name).await.unwrap();
        assert!(env.management.typed::<NamespaceMapping>(Some(PROVIDER_NAMESPACE), &name).is_none());
    }

    #[tokio::test]
    async fn existing_unowned_namespace_is_adopted() {
        let env = TestEnv::new();
        env.register_service_cluster(SERVICE_CLUSTER, &[]);
        env.service.seed_typed(&Namespace {
            metadata: ObjectMeta {
                name: Some("team-a-eu-west-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        ensure_mapping(env.management.as_ref(), PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();

        reconcile(&env, "team-a.eu-west-1").await.unwrap();

        let namespace = service_namespace(&env, "team-a-eu-west-1").unwrap();
        assert_eq!(owner_of(&namespace.metadata).map(|o| o.0), Some("team-a.eu-west-1".to_string()));
    }

    #[tokio::test]
    async fn namespace_owned_elsewhere_fails_the_mapping() {
        let env = TestEnv::new();
        env.register_service_cluster(SERVICE_CLUSTER, &[]);
        let mut foreign = Namespace {
            metadata: ObjectMeta {
                name: Some("team-a-eu-west-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        set_owner(&mut foreign.metadata, &Owner::new("other", "tenant-b", "relay.io", "NamespaceMapping"));
        env.service.seed_typed(&foreign);
        ensure_mapping(env.management.as_ref(), PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();

        let err = reconcile(&env, "team-a.eu-west-1").await.unwrap_err();
        assert!(matches!(err, ControllerError::OwnershipError(_)));
        assert!(!err.is_conflict());

        let mapping: NamespaceMapping = env.management.typed(Some(PROVIDER_NAMESPACE), "team-a.eu-west-1").unwrap();
        let ready = mapping.status.unwrap().condition(READY).cloned().unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, CREATING_NAMESPACE_REASON);
    }

    #[tokio::test]
    async fn unreachable_service_cluster_is_reported_and_returned() {
        let env = TestEnv::new();
        env.register_service_cluster(SERVICE_CLUSTER, &[]);
        ensure_mapping(env.management.as_ref(), PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();
        env.service.set_unreachable(true);

        let err = reconcile(&env, "team-a.eu-west-1").await.unwrap_err();
        assert!(matches!(err, ControllerError::RemoteUnreachableError { .. }));

        let mapping: NamespaceMapping = env.management.typed(Some(PROVIDER_NAMESPACE), "team-a.eu-west-1").unwrap();
        let ready = mapping.status.unwrap().condition(READY).cloned().unwrap();
        assert_eq!(ready.reason, "ServiceClusterUnreachable");
        assert!(ready.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn missing_service_cluster_waits_without_error() {
        let env = TestEnv::new();
        ensure_mapping(env.management.as_ref(), PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();

        let action = reconcile(&env, "team-a.eu-west-1").await.unwrap();

        assert_eq!(action, Action::requeue(env.ctx.state.requeue_after()));
        assert_eq!(env.service.writes(), 0);
    }

    #[tokio::test]
    async fn reverse_lookup_finds_mapping_by_service_namespace() {
        let env = TestEnv::new();
        env.register_service_cluster(SERVICE_CLUSTER, &[]);
        ensure_mapping(env.management.as_ref(), PROVIDER_NAMESPACE, "team-a", SERVICE_CLUSTER).await.unwrap();
        reconcile(&env, "team-a.eu-west-1").await.unwrap();

        let found = find_by_service_namespace(env.management.as_ref(), PROVIDER_NAMESPACE, SERVICE_CLUSTER, "team-a-eu-west-1")
            .await
            .unwrap();
        let missing = find_by_service_namespace(env.management.as_ref(), PROVIDER_NAMESPACE, SERVICE_CLUSTER, "team-b")
            .await
            .unwrap();

        assert_eq!(found.map(|m| m.spec.management_namespace.name), Some("team-a".to_string()));
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn remote_cluster_namespace_keeps_the_management_name() {
        let env = TestEnv::new();
        env.register_remote_service_cluster(SERVICE_CLUSTER);
        ensure_mapping(env.management.as_ref(), PROVIDER_NAMESPACE, "tenant-a", SERVICE_CLUSTER).await.unwrap();

        reconcile(&env, "tenant-a.eu-west-1").await.unwrap();
        assert!(service_namespace(&env, "tenant-a").is_some());

        delete_typed::<NamespaceMapping>(env.management.as_ref(), Some(PROVIDER_NAMESPACE), "tenant-a.eu-west-1")
            .await
            .unwrap();

        // The namespace is deleted first, the finalizer only goes once it is gone
        reconcile(&env, "tenant-a.eu-west-1").await.unwrap();
        assert!(service_namespace(&env, "tenant-a").is_none());
        let mapping: NamespaceMapping = env.management.typed(Some(PROVIDER_NAMESPACE), "tenant-a.eu-west-1").unwrap();
        assert_eq!(mapping.finalizers(), &[FINALIZER.to_string()]);

        reconcile(&env, "tenant-a.eu-west-1").await.unwrap();
        assert!(env.management.typed::<NamespaceMapping>(Some(PROVIDER_NAMESPACE), "tenant-a.eu-west-1").is_none());
    }
}
