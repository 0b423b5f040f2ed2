//! Kind-agnostic helpers over dynamically typed objects.
//!
//! A mirrored object is treated as a map of top-level keys. Everything except
//! `metadata`, `status`, `kind` and `apiVersion` is "spec-equivalent" and flows
//! from source to destination; `status` flows the other way.

use kube::core::DynamicObject;
use serde_json::{Map, Value};

const RESERVED_KEYS: &[&str] = &["metadata", "status", "kind", "apiVersion"];

/// Top-level keys of the document that are neither metadata nor status
pub fn spec_keys(obj: &DynamicObject) -> Map<String, Value> {
    match &obj.data {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Map::new(),
    }
}

pub fn status(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status").filter(|s| !s.is_null())
}

pub fn same_spec(a: &DynamicObject, b: &DynamicObject) -> bool {
    spec_keys(a) == spec_keys(b)
}

/// Replace the spec-equivalent keys of `obj`, keeping its status
pub fn with_spec_keys(obj: &DynamicObject, keys: Map<String, Value>) -> DynamicObject {
    let mut data = keys;
    if let Some(status) = status(obj) {
        data.insert("status".to_string(), status.clone());
    }
    DynamicObject {
        types: obj.types.clone(),
        metadata: obj.metadata.clone(),
        data: Value::Object(data),
    }
}

/// Take `current`'s metadata and status verbatim and every other top-level key from `desired`
pub fn overlay(current: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut merged = with_spec_keys(current, spec_keys(desired));
    if merged.types.is_none() {
        merged.types = desired.types.clone();
    }
    merged
}

/// Apply a JSON merge patch (RFC 7386) in place
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Smallest merge patch turning `from` into `to`. Removed keys are nulled.
pub fn merge_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from_map), Value::Object(to_map)) => {
            let mut patch = Map::new();
            for key in from_map.keys() {
                if !to_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in to_map {
                match from_map.get(key) {
                    Some(old) if old == value => {}
                    Some(old) if old.is_object() && value.is_object() => {
                        patch.insert(key.clone(), merge_diff(old, value));
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}
