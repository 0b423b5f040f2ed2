//! Mirrors objects of one management cluster kind into one service cluster kind.
//!
//! Spec-equivalent keys flow from the source object to its destination, and the
//! destination's `status` flows back. Each source moves through
//! [`MirrorState`]; "not yet" states requeue without an error.

use futures::StreamExt;
use kube::{
    api::{Api, ResourceExt},
    core::{ApiResource, DynamicObject, GroupVersionKind, Selector},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Client,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use relay_operator_common::config::MirrorConfig;
use relay_operator_common::telemetry::{debug, info, warn};

use crate::cluster::{ClusterApi, DeleteOutcome, ObjectKey};
use crate::controller::adoption::adoption_watcher;
use crate::controller::context::Context;
use crate::controller::namespace_mapping::{ensure_mapping, find_mapping, ready_status};
use crate::controller::utils::{add_finalizer, error_policy, remove_finalizer, reset_backoff, waiting};
use crate::crd::v1alpha1::common::{CRDReference, WebhookStrategy};
use crate::crd::v1alpha1::object_mirror::ObjectMirrorSpec;
use crate::document::{merge_diff, overlay, spec_keys, status};
use crate::error::{ControllerError, Result};
use crate::ownership::{owner_of, set_owner, Owner};

pub static FINALIZER: &str = "mirror.finalizers.relay.io";

/// Where a source object is in its mirror lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorState {
    /// The source does not exist
    Absent,
    /// The NamespaceMapping for the source namespace is not ready
    WaitingForMapping,
    /// Destination and source are in sync
    Active,
    /// The source is being deleted and its destination still exists
    DeletingChildPending,
    /// The destination is gone and the source finalizer was removed
    Removed,
}

/// One management kind mirrored to one service kind
#[derive(Clone, Debug, PartialEq)]
pub struct MirrorTarget {
    pub source: ApiResource,
    pub destination: ApiResource,
    pub service_cluster: String,
    pub provider_namespace: String,
    pub webhook_strategy: WebhookStrategy,
}

fn api_resource(crd: &CRDReference) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(&crd.group, &crd.version, &crd.kind), &crd.plural)
}

impl MirrorTarget {
    pub fn new(
        management: &CRDReference,
        service: &CRDReference,
        service_cluster: impl Into<String>,
        provider_namespace: impl Into<String>,
        webhook_strategy: WebhookStrategy,
    ) -> Self {
        Self {
            source: api_resource(management),
            destination: api_resource(service),
            service_cluster: service_cluster.into(),
            provider_namespace: provider_namespace.into(),
            webhook_strategy,
        }
    }

    /// Target described by an ObjectMirror living in `provider_namespace`
    pub fn from_spec(spec: &ObjectMirrorSpec, provider_namespace: &str) -> Self {
        Self::new(
            &spec.management_crd,
            &spec.service_crd,
            &spec.service_cluster.name,
            provider_namespace,
            spec.webhook_strategy,
        )
    }

    /// Target for a standalone mirror process
    pub fn from_config(config: &MirrorConfig) -> Result<Self> {
        let reference = |kind: &relay_operator_common::config::ResourceKindConfig| CRDReference {
            group: kind.group.clone(),
            version: kind.version.clone(),
            kind: kind.kind.clone(),
            plural: kind.plural.clone(),
        };
        let webhook_strategy = config
            .webhook_strategy
            .parse::<WebhookStrategy>()
            .map_err(ControllerError::UnknownError)?;

        Ok(Self::new(
            &reference(&config.management),
            &reference(&config.service),
            &config.service_cluster,
            &config.provider_namespace,
            webhook_strategy,
        ))
    }

    /// The synthetic owner a destination of `source` carries
    pub fn owner_of_source(&self, name: &str, namespace: &str) -> Owner {
        Owner::new(name, namespace, &self.source.group, &self.source.kind)
    }

    /// Key of the source object owning `destination`, if it is one of ours
    pub fn source_key_of(&self, destination: &DynamicObject) -> Option<ObjectKey> {
        let (name, namespace, type_label) = owner_of(&destination.metadata)?;
        let owner = self.owner_of_source(&name, &namespace);
        (owner.type_label() == type_label).then(|| ObjectKey::namespaced(namespace, name))
    }
}

/// Desired destination for `source`: its spec-equivalent keys under the
/// destination kind, in `namespace`, stamped with the owner labels
pub fn build_destination(source: &DynamicObject, target: &MirrorTarget, namespace: &str) -> DynamicObject {
    let name = source.name_any();
    let mut desired = DynamicObject::new(&name, &target.destination).within(namespace);
    desired.data = Value::Object(spec_keys(source));
    set_owner(
        &mut desired.metadata,
        &target.owner_of_source(&name, &source.namespace().unwrap_or_default()),
    );
    desired
}

/// Status to write back onto `source`: the destination's status, with
/// `observedGeneration` advanced to the source generation once the destination
/// has caught up with its own generation. Until then the previous value stays.
pub fn reflected_status(source: &DynamicObject, destination: &DynamicObject) -> Value {
    let mut reflected = match status(destination) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    let caught_up = match reflected.get("observedGeneration").and_then(Value::as_i64) {
        None => true,
        Some(observed) => Some(observed) == destination.metadata.generation,
    };
    let observed = if caught_up {
        source.metadata.generation.map(Value::from)
    } else {
        status(source).and_then(|s| s.get("observedGeneration")).cloned()
    };

    match observed {
        Some(generation) => reflected.insert("observedGeneration".to_string(), generation),
        None => reflected.remove("observedGeneration"),
    };
    Value::Object(reflected)
}

/// Drive the source named by `key` one step through its lifecycle
///
/// # Arguments
/// * `key` - Namespace and name of the source object
/// * `target` - The kinds and service cluster being mirrored
/// * `ctx` - The controller context
///
/// # Returns
/// The state the source ended in and when to look at it again
pub async fn reconcile_source(key: &ObjectKey, target: &MirrorTarget, ctx: &Context) -> Result<(MirrorState, Action)> {
    let management = ctx.management.as_ref();

    let Some(source) = management.get(&target.source, key).await? else {
        return Ok((MirrorState::Absent, Action::await_change()));
    };
    let namespace = key
        .namespace
        .clone()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let service = ctx.connector.connect(&target.provider_namespace, &target.service_cluster).await?;

    if source.metadata.deletion_timestamp.is_some() {
        return delete_destination(&source, &namespace, target, service.as_ref(), ctx).await;
    }

    let source = add_finalizer(management, &target.source, &source.metadata, FINALIZER)
        .await?
        .unwrap_or(source);

    let mapping = ensure_mapping(management, &target.provider_namespace, &namespace, &target.service_cluster).await?;
    let Some(service_namespace) = ready_status(&mapping)
        .and_then(|s| s.service_namespace.as_ref())
        .map(|ns| ns.name.clone())
    else {
        let action = waiting(ctx, &target.source.kind, &key.to_string(), "NamespaceMappingNotReady");
        return Ok((MirrorState::WaitingForMapping, action));
    };

    let desired = build_destination(&source, target, &service_namespace);
    let destination_key = ObjectKey::namespaced(&service_namespace, source.name_any());
    let destination = match service.get(&target.destination, &destination_key).await? {
        None => {
            info!(
                event = "CreatingDestination",
                kind = target.destination.kind.as_str(),
                name = %destination_key,
                cluster = service.name(),
            );
            service.create(&target.destination, &desired).await?
        }
        Some(current) => {
            let mut updated = overlay(&current, &desired);
            let relabeled = set_owner(
                &mut updated.metadata,
                &target.owner_of_source(&source.name_any(), &namespace),
            );
            if relabeled || spec_keys(&updated) != spec_keys(&current) {
                info!(
                    event = "ApplyingDestination",
                    kind = target.destination.kind.as_str(),
                    name = %destination_key,
                    cluster = service.name(),
                );
                service.replace(&target.destination, &updated).await?
            } else {
                current
            }
        }
    };

    let reflected = reflected_status(&source, &destination);
    if status(&source) != Some(&reflected) {
        let current = status(&source).cloned().unwrap_or(Value::Null);
        let patch = json!({
            "metadata": { "resourceVersion": source.metadata.resource_version },
            "status": merge_diff(&current, &reflected),
        });
        debug!(event = "UpdatingSourceStatus", kind = target.source.kind.as_str(), name = %key);
        management.patch_status(&target.source, key, &patch).await?;
    }

    Ok((MirrorState::Active, Action::requeue(ctx.state.resync_after())))
}

async fn delete_destination(
    source: &DynamicObject,
    namespace: &str,
    target: &MirrorTarget,
    service: &dyn ClusterApi,
    ctx: &Context,
) -> Result<(MirrorState, Action)> {
    let management = ctx.management.as_ref();
    let mapping = find_mapping(management, &target.provider_namespace, namespace, &target.service_cluster).await?;
    let service_namespace = mapping
        .and_then(|m| m.status)
        .and_then(|s| s.service_namespace)
        .map(|ns| ns.name);

    let outcome = match service_namespace {
        Some(service_namespace) => {
            let destination_key = ObjectKey::namespaced(service_namespace, source.name_any());
            info!(
                event = "DeletingDestination",
                kind = target.destination.kind.as_str(),
                name = %destination_key,
                cluster = service.name(),
            );
            service.delete(&target.destination, &destination_key).await?
        }
        // Without a service namespace nothing was ever mirrored
        None => DeleteOutcome::NotFound,
    };

    if outcome != DeleteOutcome::NotFound {
        let action = waiting(ctx, &target.source.kind, &source.name_any(), "DestinationDeletionPending");
        return Ok((MirrorState::DeletingChildPending, action));
    }

    remove_finalizer(management, &target.source, &source.metadata, FINALIZER).await?;
    info!(
        event = "Reconciled",
        kind = target.source.kind.as_str(),
        name = %source.name_any(),
        deleted = true,
    );
    Ok((MirrorState::Removed, Action::await_change()))
}

/// Source objects of `target` still holding the mirror finalizer. Only a
/// running loop for `target` can release them.
pub async fn pending_sources(management: &dyn ClusterApi, target: &MirrorTarget) -> Result<Vec<DynamicObject>> {
    let sources = match management.list(&target.source, None, &Selector::default()).await {
        Ok(sources) => sources,
        // The kind is no longer served, so no instance is left
        Err(ControllerError::NotFoundError(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(sources
        .into_iter()
        .filter(|source| source.finalizers().iter().any(|f| f == FINALIZER))
        .collect())
}

/// Everything a running mirror loop reconciles with
pub struct MirrorLoop {
    pub target: MirrorTarget,
    pub ctx: Arc<Context>,
}

async fn reconcile(source: Arc<DynamicObject>, mirror: Arc<MirrorLoop>) -> Result<Action> {
    let key = ObjectKey::of(&source).ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))?;
    let (state, action) = reconcile_source(&key, &mirror.target, &mirror.ctx).await?;
    debug!(event = "Reconciled", kind = mirror.target.source.kind.as_str(), name = %key, state = ?state);

    reset_backoff(source.as_ref(), &mirror.ctx);
    Ok(action)
}

fn mirror_error_policy(source: Arc<DynamicObject>, error: &ControllerError, mirror: Arc<MirrorLoop>) -> Action {
    error_policy(source, error, mirror.ctx.clone())
}

/// Run the mirror loop for `target` until `token` is cancelled.
///
/// Sources are watched in the management cluster, destinations in the service
/// cluster. A destination event is routed to its owning source through the
/// owner labels, and destinations without them are offered for adoption.
pub async fn run_mirror_loop(
    management: Client,
    service: Client,
    target: MirrorTarget,
    ctx: Arc<Context>,
    token: CancellationToken,
) {
    let sources = Api::<DynamicObject>::all_with(management, &target.source);
    let destinations = Api::<DynamicObject>::all_with(service, &target.destination);
    let concurrency = ctx.config().controller.concurrency;

    let mapper_target = target.clone();
    let controller = Controller::new_with(sources, watcher::Config::default(), target.source.clone())
        .watches_with(
            destinations.clone(),
            target.destination.clone(),
            watcher::Config::default(),
            move |destination| {
                mapper_target.source_key_of(&destination).map(|key| {
                    ObjectRef::new_with(&key.name, mapper_target.source.clone())
                        .within(key.namespace.as_deref().unwrap_or_default())
                })
            },
        )
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(
            reconcile,
            mirror_error_policy,
            Arc::new(MirrorLoop { target: target.clone(), ctx: ctx.clone() }),
        )
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(event = "ReconcileError", error = %e);
            }
        });

    let adoption = adoption_watcher(destinations, target.clone(), ctx.clone());

    info!(
        event = "ControllerStarted",
        kind = target.source.kind.as_str(),
        destination = target.destination.kind.as_str(),
        cluster = target.service_cluster.as_str(),
    );
    tokio::select! {
        _ = controller => {},
        _ = adoption => {},
        _ = token.cancelled() => {},
    }
    info!(event = "Stopped", kind = target.source.kind.as_str(), cluster = target.service_cluster.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mirror_target, source_object, TestEnv};

    fn source_key() -> ObjectKey {
        ObjectKey::namespaced("team-a", "cache")
    }

    fn destination_key(env_namespace: &str) -> ObjectKey {
        ObjectKey::namespaced(env_namespace, "cache")
    }

    async fn step(env: &TestEnv) -> MirrorState {
        reconcile_source(&source_key(), &mirror_target(), &env.ctx).await.unwrap().0
    }

    #[tokio::test]
    async fn missing_source_is_absent() {
        let env = TestEnv::new();
        assert_eq!(step(&env).await, MirrorState::Absent);
        assert_eq!(env.writes(), (0, 0));
    }

    #[tokio::test]
    async fn waits_for_mapping_then_resumes() {
        let env = TestEnv::new();
        env.register_service_cluster(crate::testing::SERVICE_CLUSTER, &[]);
        let target = mirror_target();
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));

        let (state, action) = reconcile_source(&source_key(), &target, &env.ctx).await.unwrap();
        assert_eq!(state, MirrorState::WaitingForMapping);
        assert_eq!(action, Action::requeue(env.ctx.state.requeue_after()));
        assert_eq!(env.service.writes(), 0);

        let service_namespace = env.reconcile_mapping("team-a").await;
        assert_eq!(step(&env).await, MirrorState::Active);

        let destination = env.service.object(&target.destination, &destination_key(&service_namespace)).unwrap();
        assert_eq!(destination.data["spec"], json!({"size": 1}));
        assert_eq!(target.source_key_of(&destination), Some(source_key()));
    }

    #[tokio::test]
    async fn converged_pair_issues_no_writes() {
        let env = TestEnv::new();
        let target = mirror_target();
        let service_namespace = env.ready_mapping("team-a").await;
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));

        assert_eq!(step(&env).await, MirrorState::Active);
        assert!(env.service.object(&target.destination, &destination_key(&service_namespace)).is_some());

        let before = env.writes();
        assert_eq!(step(&env).await, MirrorState::Active);
        assert_eq!(env.writes(), before);
    }

    #[tokio::test]
    async fn spec_changes_flow_to_destination_keeping_its_metadata() {
        let env = TestEnv::new();
        let target = mirror_target();
        let service_namespace = env.ready_mapping("team-a").await;
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));
        step(&env).await;

        // Something in the service cluster annotates the destination
        let key = destination_key(&service_namespace);
        env.service
            .patch(&target.destination, &key, &json!({"metadata": {"annotations": {"team": "storage"}}}))
            .await
            .unwrap();
        env.management
            .patch(&target.source, &source_key(), &json!({"spec": {"size": 3}, "extra": {"tier": "gold"}}))
            .await
            .unwrap();

        step(&env).await;

        let destination = env.service.object(&target.destination, &key).unwrap();
        assert_eq!(destination.data["spec"], json!({"size": 3}));
        assert_eq!(destination.data["extra"], json!({"tier": "gold"}));
        assert_eq!(destination.annotations().get("team").map(String::as_str), Some("storage"));
    }

    #[tokio::test]
    async fn destination_status_flows_back_with_observed_generation() {
        let env = TestEnv::new();
        let target = mirror_target();
        let service_namespace = env.ready_mapping("team-a").await;
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));
        step(&env).await;

        let key = destination_key(&service_namespace);
        env.service
            .patch_status(&target.destination, &key, &json!({"status": {"observedGeneration": 1, "ready": true}}))
            .await
            .unwrap();
        step(&env).await;

        let source = env.management.object(&target.source, &source_key()).unwrap();
        assert_eq!(source.data["status"], json!({"observedGeneration": 1, "ready": true}));

        // The source moves to generation 2 while the destination still reports generation 1
        env.management
            .patch(&target.source, &source_key(), &json!({"spec": {"size": 2}}))
            .await
            .unwrap();
        step(&env).await;

        let source = env.management.object(&target.source, &source_key()).unwrap();
        assert_eq!(source.metadata.generation, Some(2));
        assert_eq!(source.data["status"]["observedGeneration"], json!(1));

        env.service
            .patch_status(&target.destination, &key, &json!({"status": {"observedGeneration": 2}}))
            .await
            .unwrap();
        step(&env).await;

        let source = env.management.object(&target.source, &source_key()).unwrap();
        assert_eq!(source.data["status"]["observedGeneration"], json!(2));
    }

    #[tokio::test]
    async fn deletion_waits_for_the_destination() {
        let env = TestEnv::new();
        let target = mirror_target();
        let service_namespace = env.ready_mapping("team-a").await;
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));
        step(&env).await;

        let key = destination_key(&service_namespace);
        env.service
            .patch(&target.destination, &key, &json!({"metadata": {"finalizers": ["cache.example.io/cleanup"]}}))
            .await
            .unwrap();
        env.management.delete(&target.source, &source_key()).await.unwrap();

        assert_eq!(step(&env).await, MirrorState::DeletingChildPending);
        let source = env.management.object(&target.source, &source_key()).unwrap();
        assert_eq!(source.finalizers(), &[FINALIZER.to_string()]);

        env.service
            .patch(&target.destination, &key, &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(env.service.object(&target.destination, &key).is_none());

        assert_eq!(step(&env).await, MirrorState::Removed);
        assert!(env.management.object(&target.source, &source_key()).is_none());
    }

    #[tokio::test]
    async fn stale_destination_write_is_retried_without_backoff() {
        let env = TestEnv::new();
        let target = mirror_target();
        let service_namespace = env.ready_mapping("team-a").await;
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));
        step(&env).await;
        env.management
            .patch(&target.source, &source_key(), &json!({"spec": {"size": 2}}))
            .await
            .unwrap();

        env.service.race_writes(Some(&target.destination));
        let err = reconcile_source(&source_key(), &target, &env.ctx).await.unwrap_err();
        assert!(err.is_conflict());

        let source = Arc::new(env.management.object(&target.source, &source_key()).unwrap());
        let base = Action::requeue(std::time::Duration::from_secs(1));
        assert_eq!(error_policy(source.clone(), &err, env.ctx.clone()), base);
        assert_eq!(error_policy(source, &err, env.ctx.clone()), base);

        env.service.race_writes(None);
        assert_eq!(step(&env).await, MirrorState::Active);
        let destination = env.service.object(&target.destination, &destination_key(&service_namespace)).unwrap();
        assert_eq!(destination.data["spec"], json!({"size": 2}));
    }

    #[tokio::test]
    async fn stale_source_status_write_is_a_conflict() {
        let env = TestEnv::new();
        let target = mirror_target();
        let service_namespace = env.ready_mapping("team-a").await;
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));
        step(&env).await;
        env.service
            .patch_status(
                &target.destination,
                &destination_key(&service_namespace),
                &json!({"status": {"ready": true}}),
            )
            .await
            .unwrap();

        env.management.race_writes(Some(&target.source));
        let err = reconcile_source(&source_key(), &target, &env.ctx).await.unwrap_err();
        assert!(matches!(err, ControllerError::ConflictError(_)));
        let source = env.management.object(&target.source, &source_key()).unwrap();
        assert_eq!(source.data["status"].get("ready"), None);

        env.management.race_writes(None);
        assert_eq!(step(&env).await, MirrorState::Active);
        let source = env.management.object(&target.source, &source_key()).unwrap();
        assert_eq!(source.data["status"]["ready"], json!(true));
    }

    #[tokio::test]
    async fn unreachable_service_cluster_is_an_error() {
        let env = TestEnv::new();
        let target = mirror_target();
        env.ready_mapping("team-a").await;
        env.management.seed(&target.source, source_object("team-a", "cache", json!({"spec": {"size": 1}})));
        env.service.set_unreachable(true);

        let err = reconcile_source(&source_key(), &target, &env.ctx).await.unwrap_err();
        assert!(matches!(err, ControllerError::RemoteUnreachableError { .. }));
    }

    #[test]
    fn foreign_owner_labels_do_not_route_to_a_source() {
        let target = mirror_target();
        let mut destination = DynamicObject::new("cache", &target.destination).within("team-a");
        set_owner(&mut destination.metadata, &Owner::new("cache", "team-a", "other.io", "Redis"));

        assert_eq!(target.source_key_of(&destination), None);
    }
}
