//! JSON merge algorithms used to fold state deltas into full state documents.
//!
//! All functions follow JSON Merge Patch (RFC 7396) semantics: objects merge key by key
//! recursively, arrays & scalars replace the target value wholesale, and an explicit `null`
//! removes the key from the target.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use crate::error::AppError;

/// Apply the given delta document onto the given full state document, returning the new full state.
///
/// An empty `full` is treated as `{}`. If either side is not a JSON object, the delta replaces
/// the full state entirely. Invalid JSON in the delta is an input error.
pub fn apply_delta(full: &str, delta: &str) -> Result<String> {
    let delta_val: Value = match serde_json::from_str(delta) {
        Ok(val) => val,
        Err(_) => bail!(AppError::InvalidInput("delta state is invalid JSON".into())),
    };
    if !delta_val.is_object() {
        return Ok(delta.to_string());
    }

    // A primitive, an array or garbage in `full` is replaced by the delta as a whole.
    let mut full_val = match serde_json::from_str::<Value>(full) {
        Ok(val) if val.is_object() => val,
        _ => Value::Object(Map::new()),
    };

    merge_patch(&mut full_val, &delta_val);
    serde_json::to_string(&full_val).context("error serializing merged state")
}

/// Merge the `patch` document into the `old` document.
///
/// When the old value is absent or empty, the patch is returned verbatim.
pub fn merge_json(old: &str, patch: &str) -> Result<String> {
    if old.trim().is_empty() {
        return Ok(patch.to_string());
    }
    let mut target: Value = serde_json::from_str(old).context("error decoding stored document for merge")?;
    let patch: Value = serde_json::from_str(patch).context("error decoding patch document for merge")?;
    merge_patch(&mut target, &patch);
    serde_json::to_string(&target).context("error serializing merged document")
}

/// Calculate the merge patch which transforms `old` into `new`.
///
/// Falls back to `new` itself when either document can not be decoded or is not an object.
pub fn calculate_delta(old: &str, new: &str) -> String {
    let (old_val, new_val) = match (serde_json::from_str::<Value>(old), serde_json::from_str::<Value>(new)) {
        (Ok(old_val), Ok(new_val)) => (old_val, new_val),
        _ => return new.to_string(),
    };
    if !old_val.is_object() || !new_val.is_object() {
        return new.to_string();
    }
    serde_json::to_string(&create_patch(&old_val, &new_val)).unwrap_or_else(|_| new.to_string())
}

/// Apply the RFC 7396 merge patch algorithm in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let patch_map = match patch {
        Value::Object(patch_map) => patch_map,
        _ => {
            *target = patch.clone();
            return;
        }
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, val) in patch_map {
            if val.is_null() {
                target_map.remove(key);
                continue;
            }
            let entry = target_map.entry(key.clone()).or_insert(Value::Null);
            merge_patch(entry, val);
        }
    }
}

/// Build the merge patch between two JSON objects.
fn create_patch(old: &Value, new: &Value) -> Value {
    let (old_map, new_map) = match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => (old_map, new_map),
        _ => return new.clone(),
    };
    let mut patch = Map::new();
    for key in old_map.keys() {
        if !new_map.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, new_val) in new_map {
        match old_map.get(key) {
            Some(old_val) if old_val == new_val => continue,
            Some(old_val) if old_val.is_object() && new_val.is_object() => {
                patch.insert(key.clone(), create_patch(old_val, new_val));
            }
            _ => {
                patch.insert(key.clone(), new_val.clone());
            }
        }
    }
    Value::Object(patch)
}
