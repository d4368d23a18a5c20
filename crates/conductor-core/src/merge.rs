//! Recursive JSON object merge.

use serde_json::Value;

/// Merge `overlay` onto `base`, recursing into objects.
///
/// Non-object values in `overlay` replace whatever `base` holds at the same
/// position. A `null` overlay leaves `base` untouched.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_nested_objects() {
        let mut base = json!({"replicas": 1, "image": {"repo": "a", "tag": "1"}});
        deep_merge(&mut base, &json!({"image": {"tag": "2"}, "debug": true}));
        assert_eq!(
            base,
            json!({"replicas": 1, "image": {"repo": "a", "tag": "2"}, "debug": true})
        );
    }

    #[test]
    fn test_merge_replaces_arrays_and_scalars() {
        let mut base = json!({"args": ["a", "b"], "port": 80});
        deep_merge(&mut base, &json!({"args": ["c"], "port": 8080}));
        assert_eq!(base, json!({"args": ["c"], "port": 8080}));
    }

    #[test]
    fn test_null_overlay_is_noop() {
        let mut base = json!({"enabled": true});
        deep_merge(&mut base, &Value::Null);
        assert_eq!(base, json!({"enabled": true}));
    }

    #[test]
    fn test_object_over_null_base() {
        let mut base = Value::Null;
        deep_merge(&mut base, &json!({"a": 1}));
        assert_eq!(base, json!({"a": 1}));
    }
}
