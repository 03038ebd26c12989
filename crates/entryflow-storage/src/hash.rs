//! Deterministic content hashing using blake3.
//!
//! Hashes identify entry content (`input_hash`, `output_hash`) and node
//! configuration (`node hash`). They are the keys of the processing cache, so
//! two semantically identical values must always hash the same.
//!
//! # Determinism
//!
//! - Object keys are sorted recursively before serialization; array order is
//!   preserved.
//! - The canonical value is rendered as compact JSON,
//!   independent of whether `serde_json` preserves insertion order.
//! - The digest is the lowercase hex of a 256-bit blake3 hash.

use serde_json::{Map, Value};

use entryflow_core::{ContentHash, EntryPayload, NodeConfig};

/// Returns `value` with all object keys sorted, recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hashes any JSON value, independent of object key order.
pub fn hash_value(value: &Value) -> ContentHash {
    let canonical = canonicalize(value);
    // `Display` on a Value is compact JSON and infallible.
    let bytes = canonical.to_string();
    ContentHash(blake3::hash(bytes.as_bytes()).to_hex().to_string())
}

/// Hash of an entry's input (the payload without its output).
pub fn hash_input(payload: &EntryPayload) -> ContentHash {
    hash_value(&payload.input_value())
}

/// Hash of an entry's output (`null` when absent).
pub fn hash_output(payload: &EntryPayload) -> ContentHash {
    hash_value(&payload.output_value())
}

/// Node hash: node type plus the result-relevant part of its configuration.
pub fn node_hash(config: &NodeConfig) -> ContentHash {
    hash_value(&serde_json::json!({
        "type": config.node_type().as_str(),
        "config": config.hash_projection(),
    }))
}
