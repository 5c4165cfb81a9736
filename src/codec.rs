//! Key codec for embedding user documents inside step log records.
//!
//! Conditions, patches and pre-images are stored as plain values inside a
//! task record. A user key such as `$inc` or `address.city` would be read by
//! the store as an operator or a path when that record is written, so keys
//! are rewritten before they are persisted:
//!
//! - a key starting with [`OPERATOR_MARKER`] gets [`OPERATOR_ESCAPE`] prepended;
//! - every [`PATH_SEPARATOR`] inside a key is replaced by [`SEPARATOR_ESCAPE`].
//!
//! [`decode`] reverses both rewrites. The transform descends into nested
//! objects and into objects held in arrays; scalar values are never touched.
//!
//! The escape tokens themselves are reserved: a user key that already
//! contains [`OPERATOR_ESCAPE`] or [`SEPARATOR_ESCAPE`] is not supported and
//! comes back from [`decode`] with the token rewritten.
//!
//! ```
//! use docsaga::codec;
//! use serde_json::json;
//!
//! let condition = json!({"age": {"$gt": 30}, "address.city": "Lagos"});
//! let stored = codec::encode(condition.clone());
//! assert!(stored.get("address.city").is_none());
//! assert_eq!(codec::decode(stored), condition);
//! ```

use serde_json::{Map, Value};

/// Leading character of store operators.
pub const OPERATOR_MARKER: char = '$';

/// Separator the store uses for nested field paths.
pub const PATH_SEPARATOR: char = '.';

/// Prepended to keys starting with [`OPERATOR_MARKER`].
pub const OPERATOR_ESCAPE: &str = "_~~docsaga~~escape$~~op~~00~~_";

/// Replaces each [`PATH_SEPARATOR`] inside a key.
pub const SEPARATOR_ESCAPE: &str = "_~~docsaga~~escape~~dot~~00~~_";

/// Encodes every key of `value` that the store would misinterpret.
pub fn encode(value: Value) -> Value {
    transcode(value, encode_key)
}

/// Reverses [`encode`].
pub fn decode(value: Value) -> Value {
    transcode(value, decode_key)
}

/// Encodes the keys of a document.
pub fn encode_document(document: Map<String, Value>) -> Map<String, Value> {
    transcode_map(document, encode_key)
}

/// Decodes the keys of a document.
pub fn decode_document(document: Map<String, Value>) -> Map<String, Value> {
    transcode_map(document, decode_key)
}

/// Rewrites a single key for storage.
pub fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    if key.starts_with(OPERATOR_MARKER) {
        encoded.push_str(OPERATOR_ESCAPE);
    }
    for ch in key.chars() {
        if ch == PATH_SEPARATOR {
            encoded.push_str(SEPARATOR_ESCAPE);
        } else {
            encoded.push(ch);
        }
    }
    encoded
}

/// Restores a key produced by [`encode_key`]. Token text in `key` is always
/// read as an escape.
pub fn decode_key(key: &str) -> String {
    let key = key.strip_prefix(OPERATOR_ESCAPE).unwrap_or(key);
    key.replace(SEPARATOR_ESCAPE, &PATH_SEPARATOR.to_string())
}

fn transcode(value: Value, rewrite: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(transcode_map(map, rewrite)),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|item| transcode(item, rewrite)).collect())
        }
        scalar => scalar,
    }
}

fn transcode_map(map: Map<String, Value>, rewrite: fn(&str) -> String) -> Map<String, Value> {
    map.into_iter().map(|(key, value)| (rewrite(&key), transcode(value, rewrite))).collect()
}
