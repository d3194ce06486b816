use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use turnstile_core::{
    plain_content, ChunkStream, CompletionSettings, ConversationTurn, Error, FinishReason,
    ModelInfo, ModelList, NormalizedChunk, ProviderAdapter, Role, ToolCallFragment,
    ToolDefinition, Usage,
};

use crate::stream::{http_error, streaming_client, ChunkIds};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: streaming_client(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn build_request(&self, history: &[ConversationTurn], settings: &CompletionSettings) -> AnthropicRequest {
        let mut system_parts: Vec<String> = settings.system_prompt.iter().cloned().collect();
        let mut messages: Vec<AnthropicMessage> = Vec::new();

        for turn in history {
            match turn.role {
                Role::System => {
                    if !turn.content.is_empty() {
                        system_parts.push(turn.content.clone());
                    }
                }
                Role::User => messages.push(AnthropicMessage {
                    role: "user",
                    content: user_content(turn),
                }),
                Role::Tool => messages.push(AnthropicMessage {
                    role: "user",
                    content: vec![AnthropicContentBlock::Text {
                        text: turn.content.clone(),
                    }],
                }),
                Role::Assistant => {
                    let text = plain_content(turn);
                    let mut blocks = Vec::new();
                    if !text.is_empty() {
                        blocks.push(AnthropicContentBlock::Text {
                            text: text.to_string(),
                        });
                    }
                    let answered: Vec<_> = turn.tool_calls.iter().filter(|c| c.has_result()).collect();
                    for call in &answered {
                        blocks.push(AnthropicContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        });
                    }
                    if !blocks.is_empty() {
                        messages.push(AnthropicMessage {
                            role: "assistant",
                            content: blocks,
                        });
                    }
                    if !answered.is_empty() {
                        messages.push(AnthropicMessage {
                            role: "user",
                            content: answered
                                .iter()
                                .map(|call| AnthropicContentBlock::ToolResult {
                                    tool_use_id: call.id.clone(),
                                    content: call.result.clone().unwrap_or_default(),
                                })
                                .collect(),
                        });
                    }
                }
            }
        }

        let tools = (!settings.tools.is_empty())
            .then(|| settings.tools.iter().map(convert_tool).collect());

        AnthropicRequest {
            model: settings
                .model
                .clone()
                .or_else(|| self.default_model.clone()),
            messages: merge_adjacent_messages(messages),
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            max_tokens: settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: settings.temperature,
            top_p: settings.top_p,
            stream: true,
            tools,
        }
    }
}

fn user_content(turn: &ConversationTurn) -> Vec<AnthropicContentBlock> {
    let mut blocks = Vec::new();
    for attachment in &turn.attachments {
        if attachment.is_image() {
            let source = if attachment.data.starts_with("http://") || attachment.data.starts_with("https://") {
                ImageSource::Url {
                    url: attachment.data.clone(),
                }
            } else {
                ImageSource::Base64 {
                    media_type: attachment.mime_type.clone(),
                    data: attachment.data.clone(),
                }
            };
            blocks.push(AnthropicContentBlock::Image { source });
        } else {
            blocks.push(AnthropicContentBlock::Text {
                text: format!("[{}]\n{}", attachment.name, attachment.data),
            });
        }
    }
    if !turn.content.is_empty() {
        blocks.push(AnthropicContentBlock::Text {
            text: turn.content.clone(),
        });
    }
    blocks
}

fn convert_tool(tool: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: serde_json::to_value(&tool.parameters).unwrap_or_default(),
    }
}

/// Merge adjacent messages with the same role (Anthropic requires strict alternation)
fn merge_adjacent_messages(messages: Vec<AnthropicMessage>) -> Vec<AnthropicMessage> {
    let mut merged: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        if let Some(last) = merged.last_mut() {
            if last.role == msg.role {
                last.content.extend(msg.content);
                continue;
            }
        }
        merged.push(msg);
    }

    merged
}

/// Translates Anthropic message-stream events into normalized chunks.
#[derive(Debug, Default)]
pub(crate) struct EventTranslator {
    ids: ChunkIds,
    /// Content block index to tool-call index, for tool_use blocks.
    tool_blocks: HashMap<usize, usize>,
    input_tokens: u32,
    held: Option<NormalizedChunk>,
    done: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn event(&mut self, event_type: &str, data: &str) -> Result<Vec<NormalizedChunk>, Error> {
        if self.done {
            return Ok(Vec::new());
        }

        let chunk = match event_type {
            "message_start" => {
                let event: MessageStartEvent = serde_json::from_str(data)?;
                self.input_tokens = event.message.usage.map_or(0, |u| u.input_tokens.unwrap_or(0));
                None
            }
            "content_block_start" => {
                let event: ContentBlockStartEvent = serde_json::from_str(data)?;
                match event.content_block.block_type.as_str() {
                    "tool_use" => {
                        let index = self.tool_blocks.len();
                        self.tool_blocks.insert(event.index, index);
                        let mut fragment = ToolCallFragment::new(index)
                            .with_name(event.content_block.name.unwrap_or_default());
                        fragment.id = event.content_block.id;
                        debug!(tool_id = ?fragment.id, tool_name = ?fragment.name, "Anthropic tool call started");
                        Some(NormalizedChunk::tool_fragments(self.ids.next_id(), vec![fragment]))
                    }
                    _ => None,
                }
            }
            "content_block_delta" => {
                let event: ContentBlockDeltaEvent = serde_json::from_str(data)?;
                let delta = event.delta;
                match delta.delta_type.as_str() {
                    "text_delta" => delta
                        .text
                        .filter(|t| !t.is_empty())
                        .map(|t| NormalizedChunk::content(self.ids.next_id(), t)),
                    "thinking_delta" => delta
                        .thinking
                        .filter(|t| !t.is_empty())
                        .map(|t| NormalizedChunk::reasoning(self.ids.next_id(), t)),
                    "input_json_delta" => {
                        let index = self.tool_blocks.get(&event.index).copied().ok_or_else(|| {
                            Error::protocol(format!("input_json_delta for unknown block {}", event.index))
                        })?;
                        delta.partial_json.filter(|j| !j.is_empty()).map(|json| {
                            NormalizedChunk::tool_fragments(
                                self.ids.next_id(),
                                vec![ToolCallFragment::new(index).with_arguments(json)],
                            )
                        })
                    }
                    other => {
                        trace!(delta_type = other, "Ignoring Anthropic delta");
                        None
                    }
                }
            }
            "message_delta" => {
                let event: MessageDeltaEvent = serde_json::from_str(data)?;
                let output_tokens = event.usage.and_then(|u| u.output_tokens).unwrap_or(0);
                let mut chunk = NormalizedChunk::new(self.ids.next_id())
                    .with_usage(Usage::new(self.input_tokens, output_tokens));
                if let Some(reason) = event.delta.stop_reason.as_deref() {
                    debug!(stop_reason = reason, "Anthropic stream message_delta");
                    chunk = chunk.with_finish_reason(FinishReason::parse(reason));
                }
                self.held = Some(chunk);
                None
            }
            "message_stop" => self.finish(),
            "error" => {
                let event: ErrorEvent = serde_json::from_str(data).unwrap_or_default();
                error!(data = %data, "Anthropic SSE error event");
                return Err(Error::stream(format!(
                    "{}: {}",
                    event.error.error_type, event.error.message
                )));
            }
            "ping" | "content_block_stop" => None,
            other => {
                trace!(event_type = other, "Unknown Anthropic SSE event");
                None
            }
        };

        Ok(chunk.into_iter().collect())
    }

    /// The pending message_delta chunk, or a bare terminal marker, made final.
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

async fn rejected(err: EventSourceError) -> Error {
    match err {
        EventSourceError::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            http_error(status.as_u16(), &body)
        }
        EventSourceError::Transport(e) => Error::network(e.to_string()),
        other => Error::stream(other.to_string()),
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn request_completion(
        &self,
        scope: CancellationToken,
        history: &[ConversationTurn],
        settings: &CompletionSettings,
    ) -> Result<ChunkStream, Error> {
        let api_request = self.build_request(history, settings);
        debug!(
            model = ?api_request.model,
            message_count = api_request.messages.len(),
            has_tools = api_request.tools.is_some(),
            "Anthropic stream request"
        );
        trace!(request = %serde_json::to_string(&api_request).unwrap_or_default(), "Anthropic stream request payload");

        let builder = self
            .authorize(self.client.post(format!("{}/messages", self.base_url)))
            .header("Content-Type", "application/json")
            .json(&api_request);
        let mut es = EventSource::new(builder).map_err(|e| Error::stream(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<NormalizedChunk, Error>>(100);

        tokio::spawn(async move {
            let mut translator = EventTranslator::new();

            loop {
                let event = tokio::select! {
                    _ = scope.cancelled() => {
                        debug!("Anthropic stream cancelled");
                        es.close();
                        return;
                    }
                    event = es.next() => event,
                };

                let result = match event {
                    None | Some(Err(EventSourceError::StreamEnded)) => break,
                    Some(Ok(Event::Open)) => {
                        debug!("Anthropic SSE connection opened");
                        continue;
                    }
                    Some(Ok(Event::Message(msg))) => {
                        trace!(event_type = %msg.event, data = %msg.data, "Anthropic SSE event");
                        translator.event(&msg.event, &msg.data)
                    }
                    Some(Err(e)) => {
                        es.close();
                        let err = rejected(e).await;
                        error!(error = %err, "Anthropic SSE error");
                        Err(err)
                    }
                };

                match result {
                    Ok(chunks) => {
                        for chunk in chunks {
                            if tx.send(Ok(chunk)).await.is_err() {
                                es.close();
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        es.close();
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }

                if translator.is_done() {
                    debug!("Anthropic SSE stream complete");
                    es.close();
                    return;
                }
            }

            if let Some(chunk) = translator.finish() {
                let _ = tx.send(Ok(chunk)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn request_models_list(&self, scope: CancellationToken) -> Result<ModelList, Error> {
        let send = self
            .authorize(self.client.get(format!("{}/models", self.base_url)))
            .send();
        let response = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(Error::Cancelled),
            response = send => response.map_err(|e| Error::network(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status.as_u16(), &body));
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| Error::protocol(e.to_string()))?;
        Ok(ModelList {
            provider: self.name().to_string(),
            models: models.data.into_iter().map(|m| ModelInfo::new(m.id)).collect(),
        })
    }
}

// ── Anthropic API types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

// ── Streaming event types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageStartBody,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: DeltaContent,
}

#[derive(Debug, Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<AnthropicModel>,
}

#[derive(Debug, Deserialize)]
struct AnthropicModel {
    id: String,
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use turnstile_core::{Attachment, MessageProcessor, ToolCall};

    fn run(events: &[(&str, &str)]) -> Vec<NormalizedChunk> {
        let mut translator = EventTranslator::new();
        let mut out = Vec::new();
        for (event_type, data) in events {
            out.extend(translator.event(event_type, data).unwrap());
        }
        out.extend(translator.finish());
        out
    }

    #[test]
    fn test_adapter_creation() {
        let adapter = AnthropicAdapter::new("test-key")
            .with_base_url("https://custom.proxy.com/v1")
            .with_default_model("claude-sonnet-4-20250514");
        assert_eq!(adapter.name(), "anthropic");
        assert_eq!(adapter.base_url, "https://custom.proxy.com/v1");
        assert_eq!(adapter.default_model(), Some("claude-sonnet-4-20250514"));
    }

    #[test]
    fn test_build_request_system_and_defaults() {
        let adapter = AnthropicAdapter::new("k").with_default_model("claude");
        let history = vec![
            ConversationTurn::system("You are helpful."),
            ConversationTurn::user("Hello"),
        ];
        let request =
            adapter.build_request(&history, &CompletionSettings::new().with_system_prompt("Be brief."));

        assert_eq!(request.model.as_deref(), Some("claude"));
        assert_eq!(request.system.as_deref(), Some("Be brief.\n\nYou are helpful."));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_build_request_tool_round_trip() {
        let adapter = AnthropicAdapter::new("k");
        let history = vec![
            ConversationTurn::user("weather?"),
            ConversationTurn::assistant("**claude**\n\nLooking.")
                .with_model("claude")
                .with_tool_calls(vec![
                    ToolCall::new("toolu_1", "weather", json!({"city": "Oslo"})).with_result("rain"),
                ]),
            ConversationTurn::user("thanks"),
        ];
        let request = adapter.build_request(&history, &CompletionSettings::default());

        // tool_result and the next prompt merge into one user message.
        assert_eq!(request.messages.len(), 3);
        assert_eq!(
            request.messages[1].content[0],
            AnthropicContentBlock::Text {
                text: "Looking.".into()
            }
        );
        assert!(matches!(
            &request.messages[1].content[1],
            AnthropicContentBlock::ToolUse { id, .. } if id == "toolu_1"
        ));
        assert_eq!(request.messages[2].content.len(), 2);
        assert!(matches!(
            &request.messages[2].content[0],
            AnthropicContentBlock::ToolResult { content, .. } if content == "rain"
        ));
    }

    #[test]
    fn test_image_attachment_block() {
        let turn = ConversationTurn::user("what is this").with_attachments(vec![Attachment::new(
            "a.png",
            "image/png",
            "QUJD",
        )]);
        let value = serde_json::to_value(user_content(&turn)).unwrap();
        assert_eq!(value[0]["type"], "image");
        assert_eq!(value[0]["source"]["type"], "base64");
        assert_eq!(value[0]["source"]["media_type"], "image/png");
        assert_eq!(value[1]["text"], "what is this");
    }

    #[test]
    fn test_text_stream_with_usage() {
        let chunks = run(&[
            ("message_start", r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":12,"output_tokens":1}}}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            ("ping", r#"{"type":"ping"}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":6}}"#),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ]);

        assert_eq!(chunks.len(), 3);
        let last = chunks.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.finish_reason(), Some(&FinishReason::Stop));
        assert_eq!(last.usage, Some(Usage::new(12, 6)));

        let mut processor = MessageProcessor::new("claude");
        let mut text = String::new();
        for chunk in chunks {
            text = processor.process(chunk).unwrap().text;
        }
        assert_eq!(text, "Hello");
    }

    #[test]
    fn test_thinking_then_tool_use() {
        let chunks = run(&[
            ("message_start", r#"{"type":"message_start","message":{"usage":{"input_tokens":3}}}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Need weather."}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"weather","input":{}}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\": "}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"Oslo\"}"}}"#),
            ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":20}}"#),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ]);

        let mut processor = MessageProcessor::new("claude");
        let mut calls = Vec::new();
        let mut text = String::new();
        for chunk in chunks {
            let result = processor.process(chunk).unwrap();
            text = result.text;
            calls.extend(result.tool_calls);
        }
        assert_eq!(
            calls,
            vec![ToolCall::new("toolu_9", "weather", json!({"city": "Oslo"}))]
        );
        assert_eq!(text, "<think>Need weather.</think>");
    }

    #[test]
    fn test_error_event() {
        let mut translator = EventTranslator::new();
        let err = translator
            .event(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            )
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("overloaded_error: Overloaded"));
    }

    #[test]
    fn test_json_delta_for_unknown_block_is_protocol_error() {
        let mut translator = EventTranslator::new();
        let err = translator
            .event(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":4,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_merge_adjacent_messages() {
        let merged = merge_adjacent_messages(vec![
            AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock::Text { text: "a".into() }],
            },
            AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock::Text { text: "b".into() }],
            },
            AnthropicMessage {
                role: "assistant",
                content: vec![AnthropicContentBlock::Text { text: "c".into() }],
            },
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content.len(), 2);
    }
}
