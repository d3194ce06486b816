//! Reassembly of streamed tool calls.
//!
//! Providers stream a tool call as a sequence of fragments sharing a call
//! index: the first usually names the function, the rest append pieces of a
//! JSON argument string. Nothing is emitted until the provider signals that
//! the tool calls are complete.

use serde_json::Value;
use tracing::{debug, warn};

use crate::chunk::ToolCallFragment;
use crate::error::Error;
use crate::turn::ToolCall;

#[derive(Debug, Default, Clone)]
struct PendingCall {
    id: Option<String>,
    kind: Option<String>,
    name: Option<String>,
    /// Argument fragments in arrival order.
    arguments: Vec<String>,
}

/// Accumulates tool-call fragments for one assistant turn.
///
/// Slots are indexed directly by call index. Indices are small and dense in
/// practice, so a vector beats a map here.
#[derive(Debug, Default, Clone)]
pub struct ToolCallAssembler {
    slots: Vec<Option<PendingCall>>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fragment.
    pub fn push(&mut self, fragment: ToolCallFragment) {
        if fragment.index >= self.slots.len() {
            self.slots.resize_with(fragment.index + 1, || None);
        }
        let slot = self.slots[fragment.index].get_or_insert_with(PendingCall::default);

        // Later fragments may repeat the id or name; the first one wins.
        if slot.id.is_none() {
            slot.id = fragment.id.filter(|id| !id.is_empty());
        }
        if slot.kind.is_none() {
            slot.kind = fragment.kind;
        }
        if slot.name.is_none() {
            slot.name = fragment.name.filter(|name| !name.is_empty());
        }
        if !fragment.arguments.is_empty() {
            slot.arguments.push(fragment.arguments);
        }
    }

    pub fn extend(&mut self, fragments: impl IntoIterator<Item = ToolCallFragment>) {
        for fragment in fragments {
            self.push(fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Number of distinct call indices seen since the last merge.
    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }

    /// Merge everything accumulated so far into finished tool calls.
    ///
    /// The assembler is empty afterwards whether or not the merge succeeded.
    pub fn finish(&mut self) -> Result<Vec<ToolCall>, Error> {
        let slots = std::mem::take(&mut self.slots);
        let mut calls = Vec::with_capacity(slots.len());

        for (index, slot) in slots.into_iter().enumerate() {
            let Some(pending) = slot else {
                continue;
            };

            if let Some(kind) = pending.kind.as_deref() {
                if kind != "function" {
                    debug!(index, kind, "Tool call with non-function type");
                }
            }

            let name = pending.name.ok_or_else(|| {
                warn!(index, "Tool call fragments never carried a function name");
                Error::protocol(format!("tool call at index {index} has no function name"))
            })?;

            let raw = pending.arguments.concat();
            let arguments = parse_arguments(&name, &raw)?;
            let id = pending.id.unwrap_or_else(|| format!("call_{index}"));

            debug!(index, tool = %name, call_id = %id, args_len = raw.len(), "Assembled tool call");
            calls.push(ToolCall::new(id, name, arguments));
        }

        Ok(calls)
    }
}

fn parse_arguments(name: &str, raw: &str) -> Result<Value, Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(Error::protocol(format!(
            "arguments for tool '{name}' are not a JSON object: {other}"
        ))),
        Err(e) => {
            warn!(tool = %name, error = %e, "Malformed tool call arguments");
            Err(Error::protocol(format!(
                "malformed arguments for tool '{name}': {e}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fragments_merge_into_one_call() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(
            ToolCallFragment::new(0)
                .with_id("call_abc")
                .with_name("web_search")
                .with_arguments("{\"qu"),
        );
        assembler.push(ToolCallFragment::new(0).with_arguments("ery\":\"x\"}"));

        let calls = assembler.finish().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments, json!({"query": "x"}));
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_arbitrary_splits_produce_same_call() {
        let payload = r#"{"query":"rust async","limit":5,"filters":{"lang":"en"}}"#;
        let expected: Value = serde_json::from_str(payload).unwrap();

        for split_every in 1..payload.len() {
            let mut assembler = ToolCallAssembler::new();
            assembler.push(ToolCallFragment::new(0).with_name("web_search"));
            let chars: Vec<char> = payload.chars().collect();
            for piece in chars.chunks(split_every) {
                assembler.push(ToolCallFragment::new(0).with_arguments(piece.iter().collect::<String>()));
            }
            let calls = assembler.finish().unwrap();
            assert_eq!(calls.len(), 1, "split size {split_every}");
            assert_eq!(calls[0].arguments, expected, "split size {split_every}");
        }
    }

    #[test]
    fn test_interleaved_indices() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(ToolCallFragment::new(1).with_id("b").with_name("fetch"));
        assembler.push(ToolCallFragment::new(0).with_id("a").with_name("web_search"));
        assembler.push(ToolCallFragment::new(1).with_arguments("{\"url\":"));
        assembler.push(ToolCallFragment::new(0).with_arguments("{\"query\":\"q\"}"));
        assembler.push(ToolCallFragment::new(1).with_arguments("\"https://x\"}"));
        assert_eq!(assembler.pending_count(), 2);

        let calls = assembler.finish().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[1].name, "fetch");
        assert_eq!(calls[1].arguments, json!({"url": "https://x"}));
    }

    #[test]
    fn test_missing_id_is_synthesized() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(ToolCallFragment::new(2).with_name("clock"));
        let calls = assembler.finish().unwrap();
        assert_eq!(calls[0].id, "call_2");
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn test_parse_failure_discards_buffer() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(ToolCallFragment::new(0).with_name("good").with_arguments("{}"));
        assembler.push(ToolCallFragment::new(1).with_name("bad").with_arguments("{\"q\": tru"));

        let err = assembler.finish().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("bad"));
        assert!(assembler.is_empty());
        assert!(assembler.finish().unwrap().is_empty());
    }

    #[test]
    fn test_missing_name_is_protocol_error() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(ToolCallFragment::new(0).with_arguments("{}"));
        assert!(matches!(assembler.finish(), Err(Error::Protocol(_))));
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(ToolCallFragment::new(0).with_name("f").with_arguments("[1,2]"));
        assert!(assembler.finish().is_err());
    }
}
