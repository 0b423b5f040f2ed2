//! Synthetic cross-cluster ownership.
//!
//! Owner references cannot point across clusters, so ownership is recorded as a
//! set of labels naming the owner. Labels (rather than annotations) keep the
//! reverse lookup a plain label selector.

use kube::core::{Expression, ObjectMeta, Selector};
use std::collections::BTreeMap;

pub const OWNER_NAME_LABEL: &str = "owner.relay.io/name";
pub const OWNER_NAMESPACE_LABEL: &str = "owner.relay.io/namespace";
pub const OWNER_TYPE_LABEL: &str = "owner.relay.io/type";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Owner {
    pub name: String,
    pub namespace: String,
    pub group: String,
    pub kind: String,
}

impl Owner {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// GroupKind rendered as `Kind.group`, or just `Kind` for the core group
    pub fn type_label(&self) -> String {
        if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        }
    }

    fn labels(&self) -> [(&'static str, String); 3] {
        [
            (OWNER_NAME_LABEL, self.name.clone()),
            (OWNER_NAMESPACE_LABEL, self.namespace.clone()),
            (OWNER_TYPE_LABEL, self.type_label()),
        ]
    }

    /// Selects every object owned by this owner
    pub fn selector(&self) -> Selector {
        Selector::from_iter(
            self.labels()
                .into_iter()
                .map(|(k, v)| Expression::Equal(k.to_string(), v)),
        )
    }
}

/// Stamp the owner labels. Returns whether the labels changed.
pub fn set_owner(meta: &mut ObjectMeta, owner: &Owner) -> bool {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in owner.labels() {
        if labels.get(key) != Some(&value) {
            labels.insert(key.to_string(), value);
            changed = true;
        }
    }
    changed
}

/// Remove the owner labels when they point at `owner`. Returns whether anything was removed.
pub fn remove_owner(meta: &mut ObjectMeta, owner: &Owner) -> bool {
    if !is_owned_by(meta, owner) {
        return false;
    }
    if let Some(labels) = meta.labels.as_mut() {
        for key in [OWNER_NAME_LABEL, OWNER_NAMESPACE_LABEL, OWNER_TYPE_LABEL] {
            labels.remove(key);
        }
    }
    true
}

pub fn is_owned(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .is_some_and(|l| l.contains_key(OWNER_NAME_LABEL))
}

pub fn is_owned_by(meta: &ObjectMeta, owner: &Owner) -> bool {
    match meta.labels.as_ref() {
        Some(labels) => owner
            .labels()
            .iter()
            .all(|(k, v)| labels.get(*k) == Some(v)),
        None => false,
    }
}

/// Owner recorded on the object as (name, namespace, type label)
pub fn owner_of(meta: &ObjectMeta) -> Option<(String, String, String)> {
    let labels = meta.labels.as_ref()?;
    Some((
        labels.get(OWNER_NAME_LABEL)?.clone(),
        labels.get(OWNER_NAMESPACE_LABEL)?.clone(),
        labels.get(OWNER_TYPE_LABEL)?.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::SelectorExt;

    fn owner() -> Owner {
        Owner::new("cache", "tenant-a", "eu-west-1.tenant-a", "Redis")
    }

    #[test]
    fn set_owner_is_idempotent() {
        let mut meta = ObjectMeta::default();

        assert!(set_owner(&mut meta, &owner()));
        assert!(!set_owner(&mut meta, &owner()));
        assert_eq!(
            owner_of(&meta),
            Some(("cache".into(), "tenant-a".into(), "Redis.eu-west-1.tenant-a".into()))
        );
    }

    #[test]
    fn remove_owner_only_removes_matching_owner() {
        let mut meta = ObjectMeta::default();
        set_owner(&mut meta, &owner());
        let other = Owner::new("other", "tenant-a", "eu-west-1.tenant-a", "Redis");

        assert!(!remove_owner(&mut meta, &other));
        assert!(is_owned(&meta));
        assert!(remove_owner(&mut meta, &owner()));
        assert!(!is_owned(&meta));
    }

    #[test]
    fn selector_matches_owned_labels() {
        let mut meta = ObjectMeta::default();
        set_owner(&mut meta, &owner());
        let labels = meta.labels.unwrap();

        assert!(owner().selector().matches(&labels));
        assert!(!Owner::new("x", "tenant-a", "g", "K").selector().matches(&labels));
    }

    #[test]
    fn core_group_type_label_is_kind_only() {
        assert_eq!(Owner::new("a", "b", "", "Namespace").type_label(), "Namespace");
    }
}
