//! JSON merge patch (RFC 7386).

use serde_json::{Map, Value as JsonValue};

/// Applies a merge patch to `target` in place.
///
/// Objects merge recursively, `null` removes a member, and any other value
/// (arrays included) replaces the target wholesale.
pub fn merge_patch(target: &mut JsonValue, patch: &JsonValue) {
    let JsonValue::Object(patch_members) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = JsonValue::Object(Map::new());
    }

    if let JsonValue::Object(target_members) = target {
        for (name, value) in patch_members {
            if value.is_null() {
                target_members.remove(name);
            } else {
                merge_patch(
                    target_members.entry(name.clone()).or_insert(JsonValue::Null),
                    value,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_nested_objects() {
        let mut doc = json!({"status": {"state": "Pending", "message": ""}});
        merge_patch(&mut doc, &json!({"status": {"state": "Running"}}));
        assert_eq!(doc, json!({"status": {"state": "Running", "message": ""}}));
    }

    #[test]
    fn null_removes_member() {
        let mut doc = json!({"status": {"completionTime": "2024-01-01T00:00:00Z"}});
        merge_patch(&mut doc, &json!({"status": {"completionTime": null}}));
        assert_eq!(doc, json!({"status": {}}));
    }

    #[test]
    fn arrays_are_replaced() {
        let mut doc = json!({"metadata": {"finalizers": ["a", "b"]}});
        merge_patch(&mut doc, &json!({"metadata": {"finalizers": ["b"]}}));
        assert_eq!(doc["metadata"]["finalizers"], json!(["b"]));
    }

    #[test]
    fn non_object_patch_replaces_target() {
        let mut doc = json!({"a": 1});
        merge_patch(&mut doc, &json!(["x"]));
        assert_eq!(doc, json!(["x"]));
    }
}
