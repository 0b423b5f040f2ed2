use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionSpec,
};
use kube::{
    api::{Api, ObjectMeta, ResourceExt},
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

use crate::cluster::{ClusterApi, DeleteOutcome, ObjectKey};
use crate::condition::{is_ready, Condition, ConditionStatus, ConditionedStatus, TERMINATING_REASON};
use crate::controller::context::Context;
use crate::controller::object_mirror::{pending_sources, MirrorTarget};
use crate::controller::utils::{
    controller_owner_ref, create_typed, delete_typed, get_typed, release_finalizer, replace_typed, reset_backoff,
    update_status, waiting, with_finalizer,
};
use crate::crd::v1alpha1::common::{CRDReference, ObjectReference};
use crate::crd::v1alpha1::object_mirror::{ObjectMirror, ObjectMirrorSpec};
use crate::crd::v1alpha1::schema_discovery::{
    SchemaDiscovery, SchemaDiscoveryStatus, CONTROLLER_READY, DISCOVERED, ESTABLISHED,
};
use crate::error::{ControllerError, Result};
use crate::labels::{ORIGIN_NAMESPACE_LABEL, SERVICE_CLUSTER_LABEL};
use crate::ownership::{is_owned_by, owner_of, remove_owner, set_owner, Owner};

pub static FINALIZER: &str = "schemadiscoveries.finalizers.relay.io";

pub const ALREADY_IN_USE_REASON: &str = "AlreadyInUse";
pub const COMPONENTS_READY_REASON: &str = "ComponentsReady";
pub const CRD_NOT_DISCOVERED_REASON: &str = "CRDNotDiscovered";
pub const CRD_NOT_ESTABLISHED_REASON: &str = "CRDNotEstablished";
pub const CONTROLLER_UNREADY_REASON: &str = "ControllerUnready";

pub struct SchemaDiscoveryController;

impl SchemaDiscoveryController {
    /// Create a new controller for the SchemaDiscovery resource
    ///
    /// Local clones are cluster scoped and cannot carry an owner reference to
    /// the discovery, so they are routed back through their owner labels.
    ///
    /// # Arguments
    /// * `client` - Client for the management cluster
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// The controller for the SchemaDiscovery resource
    pub fn create_controller(client: Client, ctx: &Context) -> Controller<SchemaDiscovery> {
        let config = &ctx.config().controller;
        let discoveries = Api::<SchemaDiscovery>::namespaced(client.clone(), &config.provider_namespace);
        let mirrors = Api::<ObjectMirror>::namespaced(client.clone(), &config.provider_namespace);
        let crds = Api::<CustomResourceDefinition>::all(client);
        let discovery_type = discovery_type_label();

        Controller::new(discoveries, watcher::Config::default())
            .owns(mirrors, watcher::Config::default())
            .watches(crds, watcher::Config::default(), move |crd| {
                owner_of(crd.meta())
                    .filter(|(_, _, type_label)| *type_label == discovery_type)
                    .map(|(name, namespace, _)| ObjectRef::new(&name).within(&namespace))
            })
            .with_config(controller::Config::default().concurrency(config.concurrency))
    }

    /// Reconcile the SchemaDiscovery resource
    ///
    /// # Arguments
    /// * `discovery` - The SchemaDiscovery resource to reconcile
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// An action to take after reconciling the SchemaDiscovery resource
    pub async fn reconcile(discovery: Arc<SchemaDiscovery>, ctx: Arc<Context>) -> Result<Action> {
        let action = if discovery.meta().deletion_timestamp.is_some() {
            cleanup_discovery(&discovery, &ctx).await?
        } else {
            reconcile_discovery(discovery.as_ref().clone(), &ctx).await?
        };

        reset_backoff(discovery.as_ref(), &ctx);
        Ok(action)
    }
}

fn discovery_owner(discovery: &SchemaDiscovery) -> Owner {
    Owner::new(
        discovery.name_any(),
        discovery.namespace().unwrap_or_default(),
        SchemaDiscovery::group(&()),
        SchemaDiscovery::kind(&()),
    )
}

fn discovery_type_label() -> String {
    Owner::new("", "", SchemaDiscovery::group(&()), SchemaDiscovery::kind(&())).type_label()
}

/// English plural of a lowercase kind
pub fn pluralize(word: &str) -> String {
    let consonant_y = word.ends_with('y')
        && !word[..word.len() - 1].ends_with(['a', 'e', 'i', 'o', 'u']);

    if consonant_y {
        format!("{}ies", &word[..word.len() - 1])
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|suffix| word.ends_with(suffix)) {
        format!("{}es", word)
    } else {
        format!("{}s", word)
    }
}

/// API group clones from `service_cluster` into `namespace` are registered under
pub fn clone_group(service_cluster: &str, namespace: &str) -> String {
    format!("{}.{}", service_cluster, namespace)
}

/// Local clone of `remote` for `discovery`: namespaced, under the discovery's
/// group, with the kind override applied to every name
pub fn build_clone(remote: &CustomResourceDefinition, discovery: &SchemaDiscovery) -> CustomResourceDefinition {
    let namespace = discovery.namespace().unwrap_or_default();
    let service_cluster = &discovery.spec.service_cluster.name;
    let group = clone_group(service_cluster, &namespace);

    let mut names = remote.spec.names.clone();
    if let Some(kind) = &discovery.spec.kind_override {
        let singular = kind.to_lowercase();
        names.plural = pluralize(&singular);
        names.singular = Some(singular);
        names.list_kind = Some(format!("{}List", kind));
        names.kind = kind.clone();
        names.short_names = None;
    }

    let mut metadata = ObjectMeta {
        name: Some(format!("{}.{}", names.plural, group)),
        labels: Some(BTreeMap::from([
            (ORIGIN_NAMESPACE_LABEL.to_string(), namespace.clone()),
            (SERVICE_CLUSTER_LABEL.to_string(), service_cluster.clone()),
        ])),
        ..Default::default()
    };
    set_owner(&mut metadata, &discovery_owner(discovery));

    CustomResourceDefinition {
        metadata,
        spec: CustomResourceDefinitionSpec {
            group,
            names,
            scope: "Namespaced".to_string(),
            versions: remote.spec.versions.clone(),
            conversion: None,
            preserve_unknown_fields: None,
        },
        status: None,
    }
}

fn same_schema(a: &CustomResourceDefinitionSpec, b: &CustomResourceDefinitionSpec) -> bool {
    a.group == b.group && a.names == b.names && a.scope == b.scope && a.versions == b.versions
}

/// Version objects are stored in, falling back to the first served version
pub fn storage_version(crd: &CustomResourceDefinition) -> Option<String> {
    let versions = &crd.spec.versions;
    versions
        .iter()
        .find(|v| v.storage)
        .or_else(|| versions.first())
        .map(|v| v.name.clone())
}

fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

/// ObjectMirror mirroring the clone's storage version to the remote kind
fn build_object_mirror(
    discovery: &SchemaDiscovery,
    clone: &CustomResourceDefinition,
    remote: &CustomResourceDefinition,
) -> Result<ObjectMirror> {
    let version = storage_version(clone)
        .ok_or_else(|| ControllerError::InvariantViolationError(format!("{} has no versions", clone.name_any())))?;
    let owner_ref = controller_owner_ref(discovery)
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.uid"))?;

    Ok(ObjectMirror {
        metadata: ObjectMeta {
            name: Some(discovery.name_any()),
            namespace: discovery.namespace(),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: ObjectMirrorSpec {
            management_crd: CRDReference {
                group: clone.spec.group.clone(),
                version: version.clone(),
                kind: clone.spec.names.kind.clone(),
                plural: clone.spec.names.plural.clone(),
            },
            service_crd: CRDReference {
                group: remote.spec.group.clone(),
                version,
                kind: remote.spec.names.kind.clone(),
                plural: remote.spec.names.plural.clone(),
            },
            service_cluster: discovery.spec.service_cluster.clone(),
            webhook_strategy: discovery.spec.webhook_strategy,
        },
        status: None,
    })
}

/// Recompute Ready from the component conditions
fn summarize(status: &mut SchemaDiscoveryStatus) -> bool {
    let (ready, reason, message) = if !status.is_condition_true(DISCOVERED) {
        (false, CRD_NOT_DISCOVERED_REASON, "The CRD has not been discovered")
    } else if !status.is_condition_true(ESTABLISHED) {
        (false, CRD_NOT_ESTABLISHED_REASON, "The CRD is not yet established")
    } else if !status.is_condition_true(CONTROLLER_READY) {
        (false, CONTROLLER_UNREADY_REASON, "The controller is unready")
    } else {
        (true, COMPONENTS_READY_REASON, "The CRD is established and the controller is ready")
    };
    status.set_condition(Condition::ready(ready.into(), reason, message));
    ready
}

async fn reconcile_discovery(discovery: SchemaDiscovery, ctx: &Context) -> Result<Action> {
    let management = ctx.management.as_ref();
    let discovery = with_finalizer(management, discovery, FINALIZER).await?;

    let mut status = discovery.status.clone().unwrap_or_default();
    status.observed_generation = discovery.meta().generation;

    match discover(&discovery, &mut status, ctx).await {
        Ok(action) => {
            if update_status(management, &discovery, &status).await? {
                info!(
                    event = "Reconciled",
                    kind = "SchemaDiscovery",
                    name = %discovery.name_any(),
                    phase = %status.phase,
                );
            }
            Ok(action)
        }
        Err(error) => {
            status.set_condition(Condition::ready(ConditionStatus::False, error.reason(), error.to_string()));
            update_status(management, &discovery, &status).await?;
            Err(error)
        }
    }
}

async fn discover(discovery: &SchemaDiscovery, status: &mut SchemaDiscoveryStatus, ctx: &Context) -> Result<Action> {
    let namespace = discovery
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let management = ctx.management.as_ref();
    let crd_name = &discovery.spec.crd.name;
    let service_cluster = &discovery.spec.service_cluster.name;
    let service = ctx.connector.connect(&namespace, service_cluster).await?;

    // Discovered
    let Some(remote) = get_typed::<CustomResourceDefinition>(service.as_ref(), None, crd_name).await? else {
        status.cloned_schema = None;
        status.set_condition(Condition::new(
            DISCOVERED,
            ConditionStatus::False,
            "NotFound",
            format!("CustomResourceDefinition {} was not found in {}", crd_name, service_cluster),
        ));
        summarize(status);
        return Ok(waiting(ctx, "SchemaDiscovery", &discovery.name_any(), CRD_NOT_DISCOVERED_REASON));
    };

    let owner = discovery_owner(discovery);
    let remote = match owner_of(&remote.metadata) {
        Some((name, owner_namespace, _)) if !is_owned_by(&remote.metadata, &owner) => {
            status.set_condition(Condition::ready(
                ConditionStatus::False,
                ALREADY_IN_USE_REASON,
                format!(
                    "CustomResourceDefinition {} is already discovered by {}/{}",
                    crd_name, owner_namespace, name
                ),
            ));
            return Ok(Action::await_change());
        }
        Some(_) => remote,
        None => {
            let mut claimed = remote;
            set_owner(&mut claimed.metadata, &owner);
            info!(event = "ClaimingCRD", name = %crd_name, cluster = service.name());
            replace_typed(service.as_ref(), &claimed).await?
        }
    };

    status.cloned_schema = Some(CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(crd_name.clone()),
            ..Default::default()
        },
        spec: remote.spec.clone(),
        status: None,
    });
    status.set_condition(Condition::new(
        DISCOVERED,
        ConditionStatus::True,
        "Found",
        format!("CustomResourceDefinition {} was found in {}", crd_name, service_cluster),
    ));

    // Established
    let desired = build_clone(&remote, discovery);
    let clone_name = desired.name_any();
    let clone = match get_typed::<CustomResourceDefinition>(management, None, &clone_name).await? {
        None => {
            info!(event = "CreatingCRD", name = %clone_name);
            create_typed(management, &desired).await?
        }
        Some(current) if !same_schema(&current.spec, &desired.spec) => {
            let mut updated = current;
            updated.spec = desired.spec;
            info!(event = "ApplyingCRD", name = %clone_name);
            replace_typed(management, &updated).await?
        }
        Some(current) => current,
    };
    status.local_crd = Some(ObjectReference::new(&clone_name));

    if !is_established(&clone) {
        status.set_condition(Condition::new(
            ESTABLISHED,
            ConditionStatus::False,
            "Establishing",
            "The CRD is not yet established with the API server",
        ));
        summarize(status);
        return Ok(waiting(ctx, "SchemaDiscovery", &discovery.name_any(), CRD_NOT_ESTABLISHED_REASON));
    }
    status.set_condition(Condition::new(
        ESTABLISHED,
        ConditionStatus::True,
        "Established",
        "The CRD is established with the API server",
    ));

    // ControllerReady
    let desired = build_object_mirror(discovery, &clone, &remote)?;
    let mirror = match get_typed::<ObjectMirror>(management, Some(&namespace), &discovery.name_any()).await? {
        None => {
            info!(event = "CreatingObjectMirror", name = %discovery.name_any(), namespace = %namespace);
            create_typed(management, &desired).await?
        }
        Some(current) if current.spec != desired.spec => {
            let mut updated = current;
            updated.spec = desired.spec;
            info!(event = "ApplyingObjectMirror", name = %discovery.name_any(), namespace = %namespace);
            replace_typed(management, &updated).await?
        }
        Some(current) => current,
    };

    if is_ready(mirror.status.as_ref(), mirror.meta().generation) {
        status.set_condition(Condition::new(CONTROLLER_READY, ConditionStatus::True, "Ready", "The controller is ready"));
    } else {
        status.set_condition(Condition::new(CONTROLLER_READY, ConditionStatus::False, "Unready", "The controller is unready"));
    }

    if summarize(status) {
        Ok(Action::requeue(ctx.state.resync_after()))
    } else {
        Ok(waiting(ctx, "SchemaDiscovery", &discovery.name_any(), CONTROLLER_UNREADY_REASON))
    }
}

async fn cleanup_discovery(discovery: &SchemaDiscovery, ctx: &Context) -> Result<Action> {
    let namespace = discovery
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let management = ctx.management.as_ref();

    let mut status = discovery.status.clone().unwrap_or_default();
    status.set_condition(Condition::ready(
        ConditionStatus::False,
        TERMINATING_REASON,
        "The discovery is being deleted",
    ));
    update_status(management, discovery, &status).await?;

    // Mirrored objects drain through the running mirror loop before the clone
    // and the ObjectMirror go away
    if let Some(mirror) = get_typed::<ObjectMirror>(management, Some(&namespace), &discovery.name_any()).await? {
        let target = MirrorTarget::from_spec(&mirror.spec, &namespace);
        let pending = pending_sources(management, &target).await?;
        if !pending.is_empty() {
            for source in pending.iter().filter(|s| s.metadata.deletion_timestamp.is_none()) {
                let key = ObjectKey::of(source).ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))?;
                info!(event = "DeletingMirroredObject", kind = target.source.kind.as_str(), name = %key);
                management.delete(&target.source, &key).await?;
            }
            return Ok(waiting(ctx, "SchemaDiscovery", &discovery.name_any(), "MirroredObjectsPending"));
        }
    }

    if let Some(local_crd) = &status.local_crd {
        info!(event = "DeletingCRD", name = %local_crd.name);
        let clone = delete_typed::<CustomResourceDefinition>(management, None, &local_crd.name).await?;
        if clone == DeleteOutcome::Deleting {
            return Ok(waiting(ctx, "SchemaDiscovery", &discovery.name_any(), "CRDDeletionPending"));
        }
    }

    info!(event = "DeletingObjectMirror", name = %discovery.name_any(), namespace = %namespace);
    let mirror = delete_typed::<ObjectMirror>(management, Some(&namespace), &discovery.name_any()).await?;
    if mirror == DeleteOutcome::Deleting {
        return Ok(waiting(ctx, "SchemaDiscovery", &discovery.name_any(), "ObjectMirrorDeletionPending"));
    }

    let service = ctx.connector.connect(&namespace, &discovery.spec.service_cluster.name).await?;
    unclaim(service.as_ref(), &discovery.spec.crd.name, &discovery_owner(discovery)).await?;

    release_finalizer(management, discovery, FINALIZER).await?;
    info!(event = "Reconciled", kind = "SchemaDiscovery", name = %discovery.name_any(), deleted = true);
    Ok(Action::await_change())
}

/// Remove the claim labels from the remote CRD when they point at `owner`
async fn unclaim(service: &dyn ClusterApi, crd_name: &str, owner: &Owner) -> Result<()> {
    let Some(mut remote) = get_typed::<CustomResourceDefinition>(service, None, crd_name).await? else {
        return Ok(());
    };
    if remove_owner(&mut remote.metadata, owner) {
        info!(event = "ReleasingCRD", name = crd_name, cluster = service.name());
        replace_typed(service, &remote).await?;
    }
    Ok(())
}
