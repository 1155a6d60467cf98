//! JSON-Patch (RFC 6902) helpers shared by the overlay and the GC path.
//!
//! Deltas throughout this crate are `json_patch::Patch` values rather than
//! shallow merge objects: a patch is naturally composable (`merge_patches` is
//! just list concatenation) and naturally invertible (`reverse_patch`), both
//! of which the overlay FSM and the mutation-log GC path rely on.

use json_patch::{Patch, PatchOperation};
use serde_json::Value;

use crate::errors::{DbError, DbResult};

pub fn diff(from: &Value, to: &Value) -> Patch {
    json_patch::diff(from, to)
}

pub fn apply(document: &Value, patch: &Patch) -> DbResult<Value> {
    let mut out = document.clone();
    json_patch::patch(&mut out, patch).map_err(|e| DbError::PatchFailed(e.to_string()))?;
    Ok(out)
}

/// Composes two deltas into one: applying `merge(d1, d2)` to a value is
/// equivalent to applying `d1` then `d2` in sequence.
pub fn merge_patches(d1: &Patch, d2: &Patch) -> Patch {
    let mut ops = d1.0.clone();
    ops.extend(d2.0.clone());
    Patch(ops)
}

/// JSON-pointer paths touched by a patch's operations.
pub fn touched_paths(patch: &Patch) -> Vec<&str> {
    patch
        .0
        .iter()
        .map(|op| match op {
            PatchOperation::Add(o) => o.path.as_str(),
            PatchOperation::Remove(o) => o.path.as_str(),
            PatchOperation::Replace(o) => o.path.as_str(),
            PatchOperation::Move(o) => o.path.as_str(),
            PatchOperation::Copy(o) => o.path.as_str(),
            PatchOperation::Test(o) => o.path.as_str(),
        })
        .collect()
}

/// Resolves a JSON Pointer (RFC 6901) path against a value.
fn resolve_pointer<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    if pointer.is_empty() {
        return Some(value);
    }
    pointer
        .split('/')
        .skip(1)
        .try_fold(value, |current, token| {
            let token = token.replace("~1", "/").replace("~0", "~");
            match current {
                Value::Object(map) => map.get(&token),
                Value::Array(arr) => token.parse::<usize>().ok().and_then(|i| arr.get(i)),
                _ => None,
            }
        })
}

/// Builds a patch that, applied to `authoritative`, restores the fields a
/// shadowed update once changed — used by mutation-log GC (§4.3.4) to revert
/// an overlay-masked update back to the present authoritative value.
pub fn shadow_restoring_patch(change_delta: &Patch, authoritative: &Value) -> Patch {
    let mut ops = Vec::with_capacity(change_delta.0.len());
    for path in touched_paths(change_delta) {
        match resolve_pointer(authoritative, path) {
            Some(value) => ops.push(PatchOperation::Replace(json_patch::ReplaceOperation {
                path: path.parse().expect("path already validated by the source patch"),
                value: value.clone(),
            })),
            None => ops.push(PatchOperation::Remove(json_patch::RemoveOperation {
                path: path.parse().expect("path already validated by the source patch"),
            })),
        }
    }
    Patch(ops)
}

pub fn empty() -> Patch {
    Patch(Vec::new())
}

pub fn is_empty(patch: &Patch) -> bool {
    patch.0.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_then_apply_round_trips() {
        let from = json!({"title": "a", "status": "incomplete"});
        let to = json!({"title": "b", "status": "incomplete"});
        let patch = diff(&from, &to);
        assert_eq!(apply(&from, &patch).unwrap(), to);
    }

    #[test]
    fn merge_patches_is_sequential_application() {
        let base = json!({"title": "a", "n": 1});
        let p1 = diff(&base, &json!({"title": "b", "n": 1}));
        let after_p1 = apply(&base, &p1).unwrap();
        let p2 = diff(&after_p1, &json!({"title": "b", "n": 2}));

        let merged = merge_patches(&p1, &p2);
        let direct = apply(&base, &merged).unwrap();
        let sequential = apply(&after_p1, &p2).unwrap();
        assert_eq!(direct, sequential);
    }

    #[test]
    fn shadow_restoring_patch_pulls_current_values() {
        let original_delta = diff(&json!({"title": "a"}), &json!({"title": "b"}));
        let authoritative = json!({"title": "server-value", "other": 1});
        let restore = shadow_restoring_patch(&original_delta, &authoritative);
        let result = apply(&json!({"title": "b"}), &restore).unwrap();
        assert_eq!(result["title"], "server-value");
    }
}
