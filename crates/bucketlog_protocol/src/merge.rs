//! JSON merge patch (RFC 7386).
//!
//! Used for both manifest deltas and stored values. A `None` patch is
//! "no change"; a `null` patch deletes.
//!
//! Merging is not associative in general: when a node switches between
//! an object and a scalar across three patches, `merge(merge(a, p), q)`
//! and `merge(a, compose(p, q))` can differ. Only identity, idempotence
//! and the merge/diff inverse law are relied upon.

use serde_json::{Map, Value};

/// Applies `patch` to `target`.
///
/// - `None` returns `target` unchanged
/// - `null` at the top level deletes the whole document, leaving `{}`
/// - an object patch recurses key by key, with `null` members removing keys
/// - anything else (arrays, scalars) replaces the target wholesale
pub fn merge(target: &Value, patch: Option<&Value>) -> Value {
    match patch {
        None => target.clone(),
        Some(Value::Null) => Value::Object(Map::new()),
        Some(patch) => merge_value(target.clone(), patch),
    }
}

fn merge_value(target: Value, patch: &Value) -> Value {
    let Value::Object(patch) = patch else {
        return patch.clone();
    };

    let mut base = match target {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in patch {
        if value.is_null() {
            base.remove(key);
        } else {
            let current = base.remove(key).unwrap_or(Value::Null);
            base.insert(key.clone(), merge_value(current, value));
        }
    }
    Value::Object(base)
}

/// Returns the patch that turns `before` into `after`.
///
/// `merge(before, diff(before, after).as_ref()) == after` holds for every
/// pair of documents whose objects contain no `null` members. Returns
/// `None` when the documents are equal.
pub fn diff(before: &Value, after: &Value) -> Option<Value> {
    if before == after {
        return None;
    }

    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) => {
                        if let Some(inner) = diff(previous, value) {
                            patch.insert(key.clone(), inner);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(after.clone()),
    }
}

/// Combines two patches into one that has the effect of applying `first`
/// then `second`.
///
/// Unlike [`merge`], `null` members of `second` are kept so deletions
/// survive into the combined patch.
pub fn compose(first: &Value, second: &Value) -> Value {
    match (first, second) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (key, value) in b {
                let combined = match out.get(key) {
                    Some(existing @ Value::Object(_)) if value.is_object() => {
                        compose(existing, value)
                    }
                    _ => value.clone(),
                };
                out.insert(key.clone(), combined);
            }
            Value::Object(out)
        }
        _ => second.clone(),
    }
}
