//! Request and stream types for OpenAI-shaped chat completion APIs.
//!
//! Used by both the OpenAI and OpenRouter adapters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

use turnstile_core::{
    plain_content, Attachment, ChunkDelta, CompletionSettings, ConversationTurn, Error,
    FinishReason, ModelInfo, ModelList, NormalizedChunk, Role, ToolCallFragment, ToolDefinition,
    Usage,
};

use crate::stream::ChunkIds;

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    /// Omitted when neither the settings nor the adapter name a model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    /// Extra parameters (reasoning_effort, provider routing, etc.)
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct WireMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    fn text(role: &'static str, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(Value::String(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct WireToolCall {
    pub id: String,
    pub r#type: &'static str,
    pub function: WireFunctionCall,
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireTool {
    pub r#type: &'static str,
    pub function: WireFunction,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

fn convert_tool(tool: &ToolDefinition) -> WireTool {
    WireTool {
        r#type: "function",
        function: WireFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: serde_json::to_value(&tool.parameters).unwrap_or_default(),
        },
    }
}

/// Data URL for an attachment, unless it already is a URL.
pub(crate) fn attachment_url(attachment: &Attachment) -> String {
    let data = attachment.data.as_str();
    if data.starts_with("http://") || data.starts_with("https://") || data.starts_with("data:") {
        data.to_string()
    } else {
        format!("data:{};base64,{}", attachment.mime_type, data)
    }
}

fn user_content(turn: &ConversationTurn) -> Value {
    if turn.attachments.is_empty() {
        return Value::String(turn.content.clone());
    }

    let mut parts = Vec::with_capacity(turn.attachments.len() + 1);
    if !turn.content.is_empty() {
        parts.push(json!({"type": "text", "text": turn.content}));
    }
    for attachment in &turn.attachments {
        if attachment.is_image() {
            parts.push(json!({
                "type": "image_url",
                "image_url": {"url": attachment_url(attachment)},
            }));
        } else {
            parts.push(json!({
                "type": "text",
                "text": format!("[{}]\n{}", attachment.name, attachment.data),
            }));
        }
    }
    Value::Array(parts)
}

/// Convert the session history into chat messages.
///
/// Tool calls still lacking a result are left out, since the API rejects a
/// tool call that is not followed by its result.
pub(crate) fn build_messages(
    history: &[ConversationTurn],
    system_prompt: Option<&str>,
) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);

    let has_system = history.first().is_some_and(|t| t.role == Role::System);
    if let (Some(prompt), false) = (system_prompt, has_system) {
        messages.push(WireMessage::text("system", prompt));
    }

    for turn in history {
        match turn.role {
            Role::System => messages.push(WireMessage::text("system", turn.content.clone())),
            Role::User => messages.push(WireMessage {
                content: Some(user_content(turn)),
                ..WireMessage::text("user", "")
            }),
            Role::Tool => messages.push(WireMessage::text("tool", turn.content.clone())),
            Role::Assistant => {
                let text = plain_content(turn);
                let answered: Vec<_> = turn.tool_calls.iter().filter(|c| c.has_result()).collect();

                if answered.is_empty() {
                    messages.push(WireMessage::text("assistant", text));
                    continue;
                }

                messages.push(WireMessage {
                    role: "assistant",
                    content: (!text.is_empty()).then(|| Value::String(text.to_string())),
                    tool_calls: Some(
                        answered
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                r#type: "function",
                                function: WireFunctionCall {
                                    name: call.name.clone(),
                                    arguments: call.arguments.to_string(),
                                },
                            })
                            .collect(),
                    ),
                    tool_call_id: None,
                });
                for call in answered {
                    messages.push(WireMessage {
                        tool_call_id: Some(call.id.clone()),
                        ..WireMessage::text("tool", call.result.clone().unwrap_or_default())
                    });
                }
            }
        }
    }

    messages
}

pub(crate) fn build_request(
    history: &[ConversationTurn],
    settings: &CompletionSettings,
    default_model: Option<&str>,
    include_usage: bool,
) -> ChatRequest {
    let tools = (!settings.tools.is_empty())
        .then(|| settings.tools.iter().map(convert_tool).collect());

    ChatRequest {
        model: settings
            .model
            .clone()
            .or_else(|| default_model.map(str::to_string)),
        messages: build_messages(history, settings.system_prompt.as_deref()),
        temperature: settings.temperature,
        max_tokens: settings.max_tokens,
        top_p: settings.top_p,
        stream: true,
        stream_options: include_usage.then_some(StreamOptions {
            include_usage: true,
        }),
        tools,
        extra: settings.extra.clone(),
    }
}

// Stream types

#[derive(Debug, Deserialize)]
pub(crate) struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    role: Option<String>,
    content: Option<String>,
    /// DeepSeek, vLLM and most OpenAI-compatible servers.
    reasoning_content: Option<String>,
    /// OpenRouter.
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
}

impl StreamDelta {
    fn into_delta(self) -> ChunkDelta {
        let role = match self.role.as_deref() {
            Some("assistant") => Some(Role::Assistant),
            _ => None,
        };
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|tc| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                ToolCallFragment {
                    index: tc.index,
                    id: tc.id,
                    kind: tc.kind,
                    name,
                    arguments,
                }
            })
            .collect();

        ChunkDelta {
            role,
            content: self.content,
            reasoning: self.reasoning_content.or(self.reasoning),
            tool_calls,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
    #[serde(default)]
    code: Option<Value>,
}

/// Turns OpenAI-shaped stream payloads into normalized chunks.
///
/// The chunk carrying a finish reason is held back until the stream ends so
/// the usage report that follows it can ride on the final chunk.
#[derive(Debug, Default)]
pub struct StreamTranslator {
    ids: ChunkIds,
    held: Option<NormalizedChunk>,
    done: bool,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Translate one event's data payload.
    pub fn data(&mut self, data: &str) -> Result<Vec<NormalizedChunk>, Error> {
        let data = data.trim();
        if data.is_empty() || self.done {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(self.finish().into_iter().collect());
        }
        trace!(data = %data, "Stream payload");
        let response: StreamResponse = serde_json::from_str(data)?;
        self.response(response)
    }

    pub(crate) fn response(&mut self, response: StreamResponse) -> Result<Vec<NormalizedChunk>, Error> {
        if let Some(err) = response.error {
            let message = match err.code {
                Some(Value::String(code)) => format!("{} ({code})", err.message),
                Some(code) => format!("{} ({code})", err.message),
                None => err.message,
            };
            return Err(Error::stream(message));
        }

        let usage = response
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));
        let mut out = Vec::new();

        let Some(choice) = response.choices.into_iter().find(|c| c.index == 0) else {
            if let Some(usage) = usage {
                match self.held.as_mut() {
                    Some(held) => held.usage = Some(usage),
                    None => out.push(NormalizedChunk::new(self.ids.next_id()).with_usage(usage)),
                }
            }
            return Ok(out);
        };

        let finish = choice.finish_reason.as_deref().map(FinishReason::parse);
        let delta = choice.delta.into_delta();

        if finish.is_none() && delta.is_empty() && usage.is_none() {
            return Ok(out);
        }
        if let Some(held) = self.held.take() {
            out.push(held);
        }

        let mut chunk = NormalizedChunk::new(self.ids.next_id()).with_delta(delta);
        if let Some(usage) = usage {
            chunk = chunk.with_usage(usage);
        }
        match finish {
            Some(reason) => self.held = Some(chunk.with_finish_reason(reason)),
            None => out.push(chunk),
        }
        Ok(out)
    }

    /// End of stream: the held chunk, or a bare terminal marker, made final.
    pub fn finish(&mut self) -> Option<NormalizedChunk> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(match self.held.take() {
            Some(held) => held.with_final(),
            None => NormalizedChunk::terminal(self.ids.next_id()),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelsResponse {
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
}

impl ModelsResponse {
    pub fn into_list(self, provider: &str) -> ModelList {
        let mut models: Vec<ModelInfo> = self
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by,
                context_window: m.context_length,
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        ModelList {
            provider: provider.to_string(),
            models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::{ChunkError, MessageProcessor, ToolCall};

    fn translate(payloads: &[&str]) -> Vec<NormalizedChunk> {
        let mut translator = StreamTranslator::new();
        let mut out = Vec::new();
        for payload in payloads {
            out.extend(translator.data(payload).unwrap());
        }
        out.extend(translator.finish());
        out
    }

    #[test]
    fn test_content_stream_with_usage() {
        let chunks = translate(&[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            "[DONE]",
        ]);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        let last = chunks.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.finish_reason(), Some(&FinishReason::Stop));
        assert_eq!(last.usage.unwrap().total_tokens, 7);

        let mut processor = MessageProcessor::new("gpt");
        let results: Vec<_> = chunks
            .into_iter()
            .map(|c| processor.process(c).unwrap())
            .collect();
        let last = results.last().unwrap();
        assert!(last.finished);
        assert_eq!(last.text, "Hello");
        assert_eq!(last.usage.unwrap().prompt_tokens, 5);
    }

    #[test]
    fn test_reasoning_fields() {
        let chunks = translate(&[
            r#"{"choices":[{"index":0,"delta":{"reasoning_content":"ponder"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"reasoning":"more"}}]}"#,
        ]);
        let reasoning: Vec<_> = chunks
            .iter()
            .filter_map(|c| c.primary().and_then(|p| p.delta.reasoning.clone()))
            .collect();
        assert_eq!(reasoning, vec!["ponder", "more"]);
    }

    #[test]
    fn test_tool_call_stream() {
        let chunks = translate(&[
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc","type":"function","function":{"name":"web_search","arguments":"{\"qu"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ery\":\"x\"}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);

        let mut processor = MessageProcessor::new("gpt");
        let mut calls = Vec::new();
        for chunk in chunks {
            calls.extend(processor.process(chunk).unwrap().tool_calls);
        }
        assert_eq!(
            calls,
            vec![ToolCall::new("call_abc", "web_search", json!({"query": "x"}))]
        );
    }

    #[test]
    fn test_stream_without_done_still_finishes() {
        let mut translator = StreamTranslator::new();
        translator
            .data(r#"{"choices":[{"index":0,"delta":{"content":"a"}}]}"#)
            .unwrap();
        let last = translator.finish().unwrap();
        assert!(last.is_final);
        assert_eq!(last.id, 1);
        assert!(translator.finish().is_none());
    }

    #[test]
    fn test_in_stream_error() {
        let mut translator = StreamTranslator::new();
        let err = translator
            .data(r#"{"error":{"message":"upstream overloaded","code":502}}"#)
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("overloaded"));
        assert!(matches!(
            ChunkError::from(&err),
            ChunkError::Transport(_)
        ));
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let mut translator = StreamTranslator::new();
        let err = translator.data("{not json").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_build_messages_with_tool_results() {
        let history = vec![
            ConversationTurn::user("time?"),
            ConversationTurn::assistant("**gpt**\n\nchecking")
                .with_model("gpt")
                .with_tool_calls(vec![
                    ToolCall::new("c1", "clock", json!({})).with_result("noon"),
                    ToolCall::new("c2", "never_ran", json!({})),
                ]),
        ];
        let messages = build_messages(&history, Some("be brief"));

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[2].content, Some(json!("checking")));
        let calls = messages[2].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(messages[3].role, "tool");
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[3].content, Some(json!("noon")));
    }

    #[test]
    fn test_user_attachments_become_parts() {
        let turn = ConversationTurn::user("look").with_attachments(vec![Attachment::new(
            "cat.png",
            "image/png",
            "QUJD",
        )]);
        let messages = build_messages(&[turn], None);
        let parts = messages[0].content.as_ref().unwrap().as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,QUJD");
    }

    #[test]
    fn test_build_request_fields() {
        let settings = CompletionSettings::new()
            .with_temperature(0.2)
            .with_tools(vec![ToolDefinition::new("clock", "Current time")]);
        let request = build_request(&[ConversationTurn::user("hi")], &settings, Some("gpt-4o"), true);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["stream"], true);
        assert_eq!(value["stream_options"]["include_usage"], true);
        assert_eq!(value["tools"][0]["function"]["name"], "clock");
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn test_models_response() {
        let response: ModelsResponse = serde_json::from_str(
            r#"{"data":[{"id":"b","owned_by":"x"},{"id":"a","context_length":8192}]}"#,
        )
        .unwrap();
        let list = response.into_list("openai");
        assert_eq!(list.ids(), vec!["a", "b"]);
        assert_eq!(list.models[0].context_window, Some(8192));
    }
}
