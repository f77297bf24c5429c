//! Deterministic cache keys.
//!
//! A key is the SHA-256 of the backend, path, method and a canonical
//! rendering of the JSON body. Canonical means object keys are sorted at
//! every depth, so `{"a":1,"b":2}` and `{"b":2,"a":1}` share a key.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded cache key for a request.
pub fn cache_key(backend: &str, path: &str, method: &str, body: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backend.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    if let Some(body) = body {
        let mut canonical = String::new();
        write_canonical(body, &mut canonical);
        hasher.update(canonical.as_bytes());
    }

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_object_key_order() {
        let a = json!({"b": 2, "a": {"y": [1, {"z": 1, "x": 0}], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, {"x": 0, "z": 1}]}, "b": 2});
        assert_eq!(
            cache_key("users", "/users", "POST", Some(&a)),
            cache_key("users", "/users", "POST", Some(&b))
        );
    }

    #[test]
    fn test_key_distinguishes_inputs() {
        let base = cache_key("users", "/users/1", "GET", None);
        assert_eq!(base.len(), 64);
        assert_ne!(base, cache_key("orders", "/users/1", "GET", None));
        assert_ne!(base, cache_key("users", "/users/2", "GET", None));
        assert_ne!(base, cache_key("users", "/users/1", "HEAD", None));
        assert_ne!(base, cache_key("users", "/users/1", "GET", Some(&json!({}))));
        // array order is significant
        assert_ne!(
            cache_key("users", "/", "GET", Some(&json!([1, 2]))),
            cache_key("users", "/", "GET", Some(&json!([2, 1])))
        );
    }

    #[test]
    fn test_method_case_insensitive() {
        assert_eq!(
            cache_key("users", "/users", "get", None),
            cache_key("users", "/users", "GET", None)
        );
    }
}
