//! JSON merge patch (RFC 7386)

use serde_json::{Map, Value};

/// Computes the merge patch turning `from` into `to`; `None` when equal.
///
/// Keys missing from `to` become `null`; arrays are replaced whole.
#[must_use]
pub fn diff(from: &Value, to: &Value) -> Option<Value> {
    if from == to {
        return None;
    }

    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, old) in from {
                match to.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) => {
                        if let Some(p) = diff(old, new) {
                            patch.insert(key.clone(), p);
                        }
                    }
                }
            }
            for (key, new) in to {
                if !from.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(to.clone()),
    }
}

/// Applies a merge patch in place.
pub fn apply(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                apply(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_equal_is_none() {
        let v = json!({"phase": "Ready"});
        assert!(diff(&v, &v).is_none());
    }

    #[test]
    fn test_diff_removes_missing_keys() {
        let from = json!({"phase": "Ready", "usedInNamespaces": ["a"]});
        let to = json!({"phase": "Ready"});

        assert_eq!(diff(&from, &to), Some(json!({"usedInNamespaces": null})));
    }

    #[test]
    fn test_diff_then_apply_reaches_target() {
        let from = json!({"phase": "Pending", "target": {"registryURL": "a"}, "conditions": [1]});
        let to = json!({"phase": "Ready", "target": {}, "conditions": [1, 2], "progress": "100%"});

        let patch = diff(&from, &to).unwrap();
        let mut patched = from.clone();
        apply(&mut patched, &patch);

        assert_eq!(patched, to);
    }
}
