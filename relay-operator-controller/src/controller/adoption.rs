use futures::StreamExt;
use kube::{
    api::{Api, ResourceExt},
    core::DynamicObject,
    runtime::{watcher, WatchStreamExt},
};
use serde_json::Value;
use std::sync::Arc;

use relay_operator_common::telemetry::{info, warn};

use crate::cluster::ObjectKey;
use crate::controller::context::Context;
use crate::controller::namespace_mapping::find_by_service_namespace;
use crate::controller::object_mirror::MirrorTarget;
use crate::document::spec_keys;
use crate::error::{ControllerError, Result};
use crate::ownership::is_owned;

/// What adopting a destination object led to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdoptionOutcome {
    /// The destination already carries owner labels
    Owned,
    /// No NamespaceMapping points at the destination's namespace
    NoMapping,
    /// A source object with the same name already exists
    AlreadyExists,
    /// A source object was created for the destination
    Created,
}

/// Promote a destination object created directly in the service cluster by
/// creating a matching source object in the management cluster. The regular
/// mirror flow takes over from there.
pub async fn adopt(destination: &DynamicObject, target: &MirrorTarget, ctx: &Context) -> Result<AdoptionOutcome> {
    if is_owned(&destination.metadata) {
        return Ok(AdoptionOutcome::Owned);
    }
    let service_namespace = destination
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let management = ctx.management.as_ref();

    let Some(mapping) = find_by_service_namespace(
        management,
        &target.provider_namespace,
        &target.service_cluster,
        &service_namespace,
    )
    .await?
    else {
        return Ok(AdoptionOutcome::NoMapping);
    };

    let name = destination.name_any();
    let namespace = mapping.spec.management_namespace.name;
    let key = ObjectKey::namespaced(&namespace, &name);
    if management.get(&target.source, &key).await?.is_some() {
        return Ok(AdoptionOutcome::AlreadyExists);
    }

    let mut source = DynamicObject::new(&name, &target.source).within(&namespace);
    source.data = Value::Object(spec_keys(destination));
    match management.create(&target.source, &source).await {
        Ok(_) => {
            info!(
                event = "Adopted",
                kind = target.source.kind.as_str(),
                name = %key,
                cluster = target.service_cluster.as_str(),
            );
            Ok(AdoptionOutcome::Created)
        }
        // Lost a race with another writer
        Err(e) if e.is_conflict() => Ok(AdoptionOutcome::AlreadyExists),
        Err(e) => Err(e),
    }
}

/// Watch destinations and adopt those without owner labels. Runs until the
/// watch stream ends.
pub async fn adoption_watcher(destinations: Api<DynamicObject>, target: MirrorTarget, ctx: Arc<Context>) {
    watcher(destinations, watcher::Config::default())
        .default_backoff()
        .applied_objects()
        .for_each(|event| {
            let target = target.clone();
            let ctx = ctx.clone();
            async move {
                let destination = match event {
                    Ok(destination) => destination,
                    Err(e) => {
                        warn!(event = "WatchError", kind = target.destination.kind.as_str(), error = %e);
                        return;
                    }
                };
                if destination.metadata.deletion_timestamp.is_some() {
                    return;
                }
                if let Err(e) = adopt(&destination, &target, &ctx).await {
                    warn!(
                        event = "AdoptionFailed",
                        kind = target.destination.kind.as_str(),
                        name = %destination.name_any(),
                        error = %e,
                    );
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::object_mirror::{build_destination, reconcile_source, MirrorState};
    use crate::testing::{mirror_target, source_object, TestEnv};
    use serde_json::json;

    fn unowned(namespace: &str) -> DynamicObject {
        let target = mirror_target();
        let mut destination = DynamicObject::new("legacy", &target.destination).within(namespace);
        destination.data = json!({"spec": {"size": 5}});
        destination
    }

    #[tokio::test]
    async fn unowned_destination_is_promoted_once() {
        let env = TestEnv::new();
        let target = mirror_target();
        let service_namespace = env.ready_mapping("team-a").await;
        let destination = env.service.seed(&target.destination, unowned(&service_namespace));

        assert_eq!(adopt(&destination, &target, &env.ctx).await.unwrap(), AdoptionOutcome::Created);
        assert_eq!(adopt(&destination, &target, &env.ctx).await.unwrap(), AdoptionOutcome::AlreadyExists);

        let source = env
            .management
            .object(&target.source, &ObjectKey::namespaced("team-a", "legacy"))
            .expect("source created");
        assert_eq!(source.data["spec"], json!({"size": 5}));

        // The regular mirror flow then claims the destination
        let key = ObjectKey::namespaced("team-a", "legacy");
        assert_eq!(reconcile_source(&key, &target, &env.ctx).await.unwrap().0, MirrorState::Active);
        let claimed = env
            .service
            .object(&target.destination, &ObjectKey::namespaced(&service_namespace, "legacy"))
            .unwrap();
        assert_eq!(adopt(&claimed, &target, &env.ctx).await.unwrap(), AdoptionOutcome::Owned);
    }

    #[tokio::test]
    async fn mirrored_destination_is_left_alone() {
        let env = TestEnv::new();
        let target = mirror_target();
        let source = source_object("team-a", "cache", json!({"spec": {}}));
        let destination = build_destination(&source, &target, "team-a-eu-west-1");

        assert_eq!(adopt(&destination, &target, &env.ctx).await.unwrap(), AdoptionOutcome::Owned);
        assert_eq!(env.writes(), (0, 0));
    }

    #[tokio::test]
    async fn destination_outside_mapped_namespaces_is_ignored() {
        let env = TestEnv::new();
        let target = mirror_target();

        let outcome = adopt(&unowned("kube-system"), &target, &env.ctx).await.unwrap();

        assert_eq!(outcome, AdoptionOutcome::NoMapping);
        assert_eq!(env.management.writes(), 0);
    }
}
