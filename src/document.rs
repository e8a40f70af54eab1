//! Document type and reserved-field helpers
//!
//! A document is an arbitrary JSON object. Two field names are reserved:
//! `_id` (optional, any scalar, unique per store) and `packageUId` (the
//! shard key, required on documents managed by the sharded store).
//!
//! Index tables key documents by the *string form* of a scalar value, the
//! way a JSON object key would, so `index_key` is the single source of
//! truth for that stringification.

use serde_json::{Map, Value};

/// A stored document: a JSON object with arbitrary nesting
pub type Document = Map<String, Value>;

/// Reserved field holding a document's unique scalar id
pub const ID_FIELD: &str = "_id";

/// Reserved field holding the shard key on sharded documents
pub const SHARD_KEY_FIELD: &str = "packageUId";

/// String form of a scalar value as used for index keys.
///
/// Strings are used raw (no quoting); numbers and booleans use their JSON
/// text. Nulls, arrays, and objects have no index key.
pub fn index_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// The index key of a document's `_id`, if it carries a scalar one
pub fn id_key(doc: &Document) -> Option<String> {
    doc.get(ID_FIELD).and_then(index_key)
}

/// The document's shard key, if present and a string
pub fn shard_key(doc: &Document) -> Option<&str> {
    doc.get(SHARD_KEY_FIELD).and_then(Value::as_str)
}

/// True when a field value is "absent-like": missing or JSON null
pub fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().expect("test doc must be an object").clone()
    }

    #[test]
    fn test_index_key_scalars() {
        assert_eq!(index_key(&json!("abc")), Some("abc".to_string()));
        assert_eq!(index_key(&json!(42)), Some("42".to_string()));
        assert_eq!(index_key(&json!(true)), Some("true".to_string()));
        assert_eq!(index_key(&json!(null)), None);
        assert_eq!(index_key(&json!([1, 2])), None);
        assert_eq!(index_key(&json!({"a": 1})), None);
    }

    #[test]
    fn test_id_key_and_shard_key() {
        let d = doc(json!({"_id": 7, "packageUId": "pkgA.1.0.0"}));
        assert_eq!(id_key(&d), Some("7".to_string()));
        assert_eq!(shard_key(&d), Some("pkgA.1.0.0"));

        let no_id = doc(json!({"name": "x"}));
        assert_eq!(id_key(&no_id), None);
        assert_eq!(shard_key(&no_id), None);
    }

    #[test]
    fn test_is_absent() {
        let d = doc(json!({"a": null, "b": 1}));
        assert!(is_absent(d.get("a")));
        assert!(is_absent(d.get("missing")));
        assert!(!is_absent(d.get("b")));
    }
}
