//! Label-diff reconciliation for one-to-many fan-outs.

use kube::core::{ApiResource, DynamicObject, Selector};
use std::collections::BTreeSet;

use relay_operator_common::telemetry::info;

use crate::cluster::{ClusterApi, ObjectKey};
use crate::document::{overlay, same_spec};
use crate::error::{ControllerError, Result};

#[derive(Debug, PartialEq)]
pub struct SetDiff<T> {
    /// Every desired member, to be created or brought up to date
    pub upserts: Vec<T>,
    /// Actual members absent from the desired set
    pub deletions: Vec<T>,
}

/// Split `actual` against `desired` by `key`
pub fn reconcile_set<T, K, F>(desired: Vec<T>, actual: Vec<T>, key: F) -> SetDiff<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let wanted: BTreeSet<K> = desired.iter().map(&key).collect();
    let deletions = actual
        .into_iter()
        .filter(|member| !wanted.contains(&key(member)))
        .collect();

    SetDiff { upserts: desired, deletions }
}

/// Bring the children selected by `selector` in `namespace` in line with `desired`.
///
/// Missing children are created, drifted ones replaced, and children no longer
/// desired deleted. Nothing is written once the set has converged. Returns the
/// current desired children.
pub async fn sync_children(
    cluster: &dyn ClusterApi,
    resource: &ApiResource,
    namespace: &str,
    selector: &Selector,
    desired: Vec<DynamicObject>,
) -> Result<Vec<DynamicObject>> {
    let actual = cluster.list(resource, Some(namespace), selector).await?;
    let name = |obj: &DynamicObject| obj.metadata.name.clone().unwrap_or_default();
    let diff = reconcile_set(desired, actual.clone(), name);

    let mut children = Vec::with_capacity(diff.upserts.len());
    for child in diff.upserts {
        let current = actual.iter().find(|a| a.metadata.name == child.metadata.name);
        let applied = match current {
            None => {
                info!(event = "CreatingChild", kind = resource.kind.as_str(), name = name(&child).as_str());
                cluster.create(resource, &child).await?
            }
            Some(current) if !same_spec(current, &child) || labels_drifted(current, &child) => {
                let mut updated = overlay(current, &child);
                updated
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .extend(child.metadata.labels.clone().unwrap_or_default());
                cluster.replace(resource, &updated).await?
            }
            Some(current) => current.clone(),
        };
        children.push(applied);
    }

    for stale in diff.deletions {
        let key = ObjectKey::of(&stale).ok_or(ControllerError::MissingObjectKeyError(".metadata.name"))?;
        info!(event = "DeletingChild", kind = resource.kind.as_str(), name = key.name.as_str());
        cluster.delete(resource, &key).await?;
    }

    Ok(children)
}

fn labels_drifted(current: &DynamicObject, desired: &DynamicObject) -> bool {
    let current = current.metadata.labels.clone().unwrap_or_default();
    desired
        .metadata
        .labels
        .iter()
        .flatten()
        .any(|(k, v)| current.get(k) != Some(v))
}
