//! Node entries: one dataset record's state at one node.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CacheKey;
use crate::filter::FilterOutcome;
use crate::id::{ContentHash, NodeEntryId, NodeId};
use crate::status::EntryStatus;

/// The record carried by an entry.
///
/// The well-known chat fields are typed; everything else in the record (for
/// example a plain `content` field) is kept in `fields` and serialized flat,
/// so `{"content": "X123"}` round-trips unchanged. The *input* of an entry is
/// the payload without `output`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntryPayload {
    /// The payload minus its output, as hashed into `input_hash`.
    pub fn input_value(&self) -> Value {
        let mut input = self.clone();
        input.output = None;
        serde_json::to_value(input).unwrap_or(Value::Null)
    }

    /// The output as hashed into `output_hash` (`null` when absent).
    pub fn output_value(&self) -> Value {
        self.output.clone().unwrap_or(Value::Null)
    }

    /// A copy of this payload carrying a different output.
    pub fn with_output(&self, output: Option<Value>) -> EntryPayload {
        EntryPayload {
            output,
            ..self.clone()
        }
    }
}

/// One record's presence at one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeEntryId,
    pub node_id: NodeId,
    /// Entry at the upstream node this one was forwarded from.
    pub parent_node_entry_id: Option<NodeEntryId>,
    pub input_hash: ContentHash,
    pub output_hash: ContentHash,
    pub status: EntryStatus,
    pub payload: EntryPayload,
    /// Terminal failure message (status ERROR).
    pub error: Option<String>,
    /// Transient message, e.g. the last rate-limit response.
    pub diagnostic: Option<String>,
    pub outgoing_input_hash: Option<ContentHash>,
    pub outgoing_output_hash: Option<ContentHash>,
    pub filter_outcome: Option<FilterOutcome>,
}

impl NodeEntry {
    /// Full cache key of this entry at a node with the given hash.
    pub fn cache_key(&self, node_hash: &ContentHash) -> CacheKey {
        CacheKey {
            node_hash: node_hash.clone(),
            incoming_input_hash: self.input_hash.clone(),
            incoming_output_hash: self.output_hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn free_form_fields_serialize_flat() {
        let payload: EntryPayload = serde_json::from_value(json!({ "content": "X123" })).unwrap();
        assert_eq!(payload.fields["content"], "X123");
        assert!(payload.messages.is_empty());
        assert_eq!(serde_json::to_value(&payload).unwrap(), json!({ "content": "X123" }));
    }

    #[test]
    fn input_value_excludes_output() {
        let payload: EntryPayload = serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "hi" }],
            "output": { "role": "assistant", "content": "hello" }
        }))
        .unwrap();
        let input = payload.input_value();
        assert!(input.get("output").is_none());
        assert_eq!(input["messages"][0]["content"], "hi");
        assert_eq!(payload.output_value()["content"], "hello");
    }

    #[test]
    fn missing_output_hashes_as_null() {
        let payload = EntryPayload::default();
        assert_eq!(payload.output_value(), Value::Null);
    }

    #[test]
    fn with_output_keeps_input() {
        let payload: EntryPayload =
            serde_json::from_value(json!({ "content": "a", "output": "old" })).unwrap();
        let next = payload.with_output(Some(json!("new")));
        assert_eq!(next.input_value(), payload.input_value());
        assert_eq!(next.output, Some(json!("new")));
    }
}
