//! Canonical hashing of structured values.
//!
//! Values are converted to JSON, mapping keys are sorted recursively, and the
//! compact serialization is digested. Two values that differ only in key order
//! or formatting therefore produce the same [`ContentHash`].

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::hash::ContentHash;

/// A value could not be reduced to canonical form.
///
/// Only happens for types whose serde representation is not JSON-compatible
/// (e.g. maps with non-string keys). This is a caller bug.
#[derive(Debug, thiserror::Error)]
#[error("value cannot be canonicalized: {0}")]
pub struct HashError(#[from] serde_json::Error);

/// Stateless canonical hasher.
pub struct ContentHasher;

impl ContentHasher {
    /// Hashes any serializable value in canonical form.
    pub fn hash<T: Serialize + ?Sized>(value: &T) -> Result<ContentHash, HashError> {
        let canonical = Self::canonical_json(value)?;
        Ok(ContentHash::from_bytes(canonical.as_bytes()))
    }

    /// Combines named digests into one digest over their sorted mapping.
    ///
    /// Used to derive a stage cache key from several upstream inputs.
    pub fn combine(named: &BTreeMap<String, ContentHash>) -> ContentHash {
        let mut buf = String::with_capacity(named.len() * 80);
        buf.push('{');
        for (i, (name, digest)) in named.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            // Names are escaped through serde_json so quotes can't forge a boundary.
            buf.push_str(&Value::String(name.clone()).to_string());
            buf.push(':');
            buf.push('"');
            buf.push_str(&digest.to_hex());
            buf.push('"');
        }
        buf.push('}');
        ContentHash::from_bytes(buf.as_bytes())
    }

    /// Renders a value as compact JSON with recursively sorted object keys.
    pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
        let v = serde_json::to_value(value)?;
        Ok(sort_value(v).to_string())
    }
}

fn sort_value(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}
