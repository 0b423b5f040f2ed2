use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    core::{Expression, Selector},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Client, Resource,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use relay_operator_common::telemetry::info;

use crate::condition::{is_ready, Condition, ConditionStatus, ConditionedStatus, TERMINATING_REASON};
use crate::controller::context::Context;
use crate::controller::utils::{
    controller_owner_ref, from_dynamic, list_typed, release_finalizer, reset_backoff, resource_of, to_dynamic,
    update_status, waiting, with_finalizer,
};
use crate::crd::v1alpha1::common::ObjectReference;
use crate::crd::v1alpha1::schema_discovery::{SchemaDiscovery, SchemaDiscoverySpec};
use crate::crd::v1alpha1::schema_discovery_set::{ManagementClusterCRD, SchemaDiscoverySet, SchemaDiscoverySetStatus};
use crate::crd::v1alpha1::service_cluster::ServiceCluster;
use crate::error::{ControllerError, Result};
use crate::gc::sync_children;
use crate::labels::DISCOVERY_CONTROLLED_BY_LABEL;

pub static FINALIZER: &str = "schemadiscoverysets.finalizers.relay.io";

pub const COMPONENTS_READY_REASON: &str = "ComponentsReady";
pub const COMPONENTS_UNREADY_REASON: &str = "ComponentsUnready";

pub struct SchemaDiscoverySetController;

impl SchemaDiscoverySetController {
    /// Create a new controller for the SchemaDiscoverySet resource
    ///
    /// Any change to a ServiceCluster enqueues every set in its namespace,
    /// since the set's selector decides whether the cluster matches.
    ///
    /// # Arguments
    /// * `client` - Client for the management cluster
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// The controller for the SchemaDiscoverySet resource
    pub fn create_controller(client: Client, ctx: &Context) -> Controller<SchemaDiscoverySet> {
        let config = &ctx.config().controller;
        let sets = Api::<SchemaDiscoverySet>::namespaced(client.clone(), &config.provider_namespace);
        let discoveries = Api::<SchemaDiscovery>::namespaced(client.clone(), &config.provider_namespace);
        let clusters = Api::<ServiceCluster>::namespaced(client, &config.provider_namespace);

        let controller = Controller::new(sets, watcher::Config::default());
        let store = controller.store();

        controller
            .owns(discoveries, watcher::Config::default())
            .watches(clusters, watcher::Config::default(), move |cluster| {
                let namespace = cluster.namespace();
                store
                    .state()
                    .into_iter()
                    .filter(|set| set.namespace() == namespace)
                    .map(|set| ObjectRef::from_obj(set.as_ref()))
                    .collect::<Vec<_>>()
            })
            .with_config(controller::Config::default().concurrency(config.concurrency))
    }

    /// Reconcile the SchemaDiscoverySet resource
    ///
    /// # Arguments
    /// * `set` - The SchemaDiscoverySet resource to reconcile
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// An action to take after reconciling the SchemaDiscoverySet resource
    pub async fn reconcile(set: Arc<SchemaDiscoverySet>, ctx: Arc<Context>) -> Result<Action> {
        let action = if set.meta().deletion_timestamp.is_some() {
            cleanup_set(&set, &ctx).await?
        } else {
            reconcile_set(set.as_ref().clone(), &ctx).await?
        };

        reset_backoff(set.as_ref(), &ctx);
        Ok(action)
    }
}

fn children_selector(set: &SchemaDiscoverySet) -> Selector {
    Selector::from_iter([Expression::Equal(DISCOVERY_CONTROLLED_BY_LABEL.to_string(), set.name_any())])
}

/// Name of the child discovering for `service_cluster`
pub fn child_name(set: &SchemaDiscoverySet, service_cluster: &str) -> String {
    format!("{}.{}", set.name_any(), service_cluster)
}

/// Child SchemaDiscovery of `set` for `service_cluster`
pub fn build_child(set: &SchemaDiscoverySet, service_cluster: &str) -> Result<SchemaDiscovery> {
    let owner_ref = controller_owner_ref(set).ok_or(ControllerError::MissingObjectKeyError(".metadata.uid"))?;

    Ok(SchemaDiscovery {
        metadata: ObjectMeta {
            name: Some(child_name(set, service_cluster)),
            namespace: set.namespace(),
            labels: Some(BTreeMap::from([(DISCOVERY_CONTROLLED_BY_LABEL.to_string(), set.name_any())])),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: SchemaDiscoverySpec {
            crd: set.spec.crd.clone(),
            service_cluster: ObjectReference::new(service_cluster),
            kind_override: set.spec.kind_override.clone(),
            webhook_strategy: set.spec.webhook_strategy,
        },
        status: None,
    })
}

/// Fold the children's readiness into the set's status
fn aggregate(status: &mut SchemaDiscoverySetStatus, children: &[SchemaDiscovery]) -> bool {
    let mut unready: Vec<String> = children
        .iter()
        .filter(|child| !is_ready(child.status.as_ref(), child.meta().generation))
        .map(|child| child.name_any())
        .collect();
    unready.sort();

    status.management_cluster_crds = children
        .iter()
        .filter_map(|child| {
            let local_crd = child.status.as_ref()?.local_crd.as_ref()?;
            Some(ManagementClusterCRD {
                name: local_crd.name.clone(),
                service_cluster: child.spec.service_cluster.clone(),
            })
        })
        .collect();
    status.management_cluster_crds.sort_by(|a, b| a.name.cmp(&b.name));

    if unready.is_empty() {
        status.set_condition(Condition::ready(
            ConditionStatus::True,
            COMPONENTS_READY_REASON,
            "All SchemaDiscoveries are ready",
        ));
        true
    } else {
        status.set_condition(Condition::ready(
            ConditionStatus::False,
            COMPONENTS_UNREADY_REASON,
            format!("Some SchemaDiscoveries are unready [{}]", unready.join(", ")),
        ));
        false
    }
}

async fn reconcile_set(set: SchemaDiscoverySet, ctx: &Context) -> Result<Action> {
    let namespace = set
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let management = ctx.management.as_ref();
    let set = with_finalizer(management, set, FINALIZER).await?;

    let cluster_selector = Selector::try_from(set.spec.service_cluster_selector.clone())
        .map_err(|e| ControllerError::UnknownError(format!("invalid serviceClusterSelector: {}", e)))?;
    let mut clusters: Vec<String> = list_typed::<ServiceCluster>(management, Some(&namespace), &cluster_selector)
        .await?
        .iter()
        .map(|cluster| cluster.name_any())
        .collect();
    clusters.sort();

    let desired = clusters
        .iter()
        .map(|cluster| to_dynamic(&build_child(&set, cluster)?))
        .collect::<Result<Vec<_>>>()?;
    let children = sync_children(
        management,
        &resource_of::<SchemaDiscovery>(),
        &namespace,
        &children_selector(&set),
        desired,
    )
    .await?
    .into_iter()
    .map(from_dynamic)
    .collect::<Result<Vec<SchemaDiscovery>>>()?;

    let mut status = set.status.clone().unwrap_or_default();
    status.observed_generation = set.meta().generation;
    let ready = aggregate(&mut status, &children);

    if update_status(management, &set, &status).await? {
        info!(
            event = "Reconciled",
            kind = "SchemaDiscoverySet",
            name = %set.name_any(),
            children = children.len(),
            phase = %status.phase,
        );
    }

    if ready {
        Ok(Action::requeue(ctx.state.resync_after()))
    } else {
        Ok(waiting(ctx, "SchemaDiscoverySet", &set.name_any(), COMPONENTS_UNREADY_REASON))
    }
}

async fn cleanup_set(set: &SchemaDiscoverySet, ctx: &Context) -> Result<Action> {
    let namespace = set
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let management = ctx.management.as_ref();

    let mut status = set.status.clone().unwrap_or_default();
    status.set_condition(Condition::ready(
        ConditionStatus::False,
        TERMINATING_REASON,
        "The set is being deleted",
    ));
    update_status(management, set, &status).await?;

    // An empty desired set deletes every child
    let resource = resource_of::<SchemaDiscovery>();
    let selector = children_selector(set);
    sync_children(management, &resource, &namespace, &selector, Vec::new()).await?;
    if !management.list(&resource, Some(&namespace), &selector).await?.is_empty() {
        return Ok(waiting(ctx, "SchemaDiscoverySet", &set.name_any(), "ChildDeletionPending"));
    }

    release_finalizer(management, set, FINALIZER).await?;
    info!(event = "Reconciled", kind = "SchemaDiscoverySet", name = %set.name_any(), deleted = true);
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Phase, READY};
    use crate::controller::utils::delete_typed;
    use crate::crd::v1alpha1::common::WebhookStrategy;
    use crate::crd::v1alpha1::schema_discovery::SchemaDiscoveryStatus;
    use crate::crd::v1alpha1::schema_discovery_set::SchemaDiscoverySetSpec;
    use crate::testing::{TestEnv, PROVIDER_NAMESPACE};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn set() -> SchemaDiscoverySet {
        let mut set = SchemaDiscoverySet::new(
            "redis",
            SchemaDiscoverySetSpec {
                crd: ObjectReference::new("redises.cache.example.io"),
                service_cluster_selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([("tier".to_string(), "prod".to_string())])),
                    ..Default::default()
                },
                kind_override: None,
                webhook_strategy: WebhookStrategy::None,
            },
        );
        set.metadata.namespace = Some(PROVIDER_NAMESPACE.to_string());
        set
    }

    async fn reconcile(env: &TestEnv) -> Result<Action> {
        let set: SchemaDiscoverySet = env.management.typed(Some(PROVIDER_NAMESPACE), "redis").expect("set exists");
        SchemaDiscoverySetController::reconcile(Arc::new(set), env.ctx.clone()).await
    }

    fn child(env: &TestEnv, cluster: &str) -> Option<SchemaDiscovery> {
        env.management.typed(Some(PROVIDER_NAMESPACE), &format!("redis.{}", cluster))
    }

    fn set_status(env: &TestEnv) -> SchemaDiscoverySetStatus {
        env.management
            .typed::<SchemaDiscoverySet>(Some(PROVIDER_NAMESPACE), "redis")
            .and_then(|s| s.status)
            .unwrap_or_default()
    }

    async fn mark_ready(env: &TestEnv, cluster: &str) {
        let child = child(env, cluster).unwrap();
        let mut status = SchemaDiscoveryStatus {
            local_crd: Some(ObjectReference::new(format!("redises.{}.tenant-a", cluster))),
            observed_generation: child.meta().generation,
            ..Default::default()
        };
        status.set_condition(Condition::ready(ConditionStatus::True, "ComponentsReady", "ready"));
        update_status(env.management.as_ref(), &child, &status).await.unwrap();
    }

    #[tokio::test]
    async fn fans_out_and_collects_only_dropped_clusters() {
        let env = TestEnv::new();
        env.register_service_cluster("eu-west-1", &[("tier", "prod")]);
        env.register_service_cluster("us-east-1", &[("tier", "prod")]);
        env.register_service_cluster("lab", &[("tier", "dev")]);
        env.management.seed_typed(&set());

        reconcile(&env).await.unwrap();

        let eu = child(&env, "eu-west-1").expect("child for eu-west-1");
        assert!(child(&env, "us-east-1").is_some());
        assert!(child(&env, "lab").is_none());
        assert_eq!(eu.spec.service_cluster.name, "eu-west-1");
        assert_eq!(eu.labels().get(DISCOVERY_CONTROLLED_BY_LABEL).map(String::as_str), Some("redis"));
        assert_eq!(eu.owner_references()[0].kind, "SchemaDiscoverySet");

        // us-east-1 leaves the match set
        env.register_service_cluster("us-east-1", &[("tier", "dev")]);
        reconcile(&env).await.unwrap();

        assert!(child(&env, "us-east-1").is_none());
        let untouched = child(&env, "eu-west-1").unwrap();
        assert_eq!(untouched.meta().resource_version, eu.meta().resource_version);
    }

    #[tokio::test]
    async fn readiness_is_the_conjunction_of_children() {
        let env = TestEnv::new();
        env.register_service_cluster("eu-west-1", &[("tier", "prod")]);
        env.register_service_cluster("us-east-1", &[("tier", "prod")]);
        env.management.seed_typed(&set());
        reconcile(&env).await.unwrap();

        mark_ready(&env, "eu-west-1").await;
        reconcile(&env).await.unwrap();

        let status = set_status(&env);
        let ready = status.condition(READY).unwrap();
        assert_eq!(ready.reason, COMPONENTS_UNREADY_REASON);
        assert_eq!(ready.message, "Some SchemaDiscoveries are unready [redis.us-east-1]");
        assert_eq!(
            status.management_cluster_crds,
            vec![ManagementClusterCRD {
                name: "redises.eu-west-1.tenant-a".to_string(),
                service_cluster: ObjectReference::new("eu-west-1"),
            }]
        );

        mark_ready(&env, "us-east-1").await;
        reconcile(&env).await.unwrap();
        let status = set_status(&env);
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.condition(READY).unwrap().reason, COMPONENTS_READY_REASON);

        let before = env.writes();
        reconcile(&env).await.unwrap();
        assert_eq!(env.writes(), before);
    }

    #[tokio::test]
    async fn deletion_waits_for_children() {
        let env = TestEnv::new();
        env.register_service_cluster("eu-west-1", &[("tier", "prod")]);
        env.management.seed_typed(&set());
        reconcile(&env).await.unwrap();

        // The child's own finalizer holds it
        let mut held = child(&env, "eu-west-1").unwrap();
        held.metadata.finalizers = Some(vec!["schemadiscoveries.finalizers.relay.io".to_string()]);
        crate::controller::utils::replace_typed(env.management.as_ref(), &held).await.unwrap();

        delete_typed::<SchemaDiscoverySet>(env.management.as_ref(), Some(PROVIDER_NAMESPACE), "redis")
            .await
            .unwrap();
        reconcile(&env).await.unwrap();
        assert_eq!(set_status(&env).phase, Phase::Terminating);
        assert!(child(&env, "eu-west-1").unwrap().meta().deletion_timestamp.is_some());

        let mut released = child(&env, "eu-west-1").unwrap();
        released.metadata.finalizers = None;
        crate::controller::utils::replace_typed(env.management.as_ref(), &released).await.unwrap();

        reconcile(&env).await.unwrap();
        assert!(env.management.typed::<SchemaDiscoverySet>(Some(PROVIDER_NAMESPACE), "redis").is_none());
    }
}
