//! Provider-agnostic streaming chunks.
//!
//! Every adapter translates its vendor wire format into [`NormalizedChunk`]s.
//! Nothing past this boundary knows which provider produced a chunk.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::turn::{Role, Usage};

/// Provider-supplied code indicating why generation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Map a vendor finish/stop reason string onto the normalized set.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "refusal" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    /// Stop and Length end a turn; everything else leaves that to the flag.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FinishReason::Stop | FinishReason::Length)
    }
}

/// One fragment of a streamed tool call.
///
/// Only `index` is guaranteed; the id, type and name usually arrive on the
/// first fragment for an index and the arguments trickle in afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCallFragment {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.kind = Some("function".to_string());
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// `None` is an explicit null content delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallFragment>,
}

impl ChunkDelta {
    pub fn has_text(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty())
            || self.reasoning.as_deref().is_some_and(|r| !r.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_text() && self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Error carried in-band by a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkError {
    /// The turn's scope was cancelled. Resolves by finalizing partial content.
    Cancelled,
    Transport(String),
    Protocol(String),
}

impl From<ChunkError> for Error {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Cancelled => Error::Cancelled,
            ChunkError::Transport(message) => Error::Stream(message),
            ChunkError::Protocol(message) => Error::Protocol(message),
        }
    }
}

impl From<&Error> for ChunkError {
    fn from(err: &Error) -> Self {
        match err {
            Error::Cancelled => ChunkError::Cancelled,
            Error::Protocol(message) => ChunkError::Protocol(message.clone()),
            other => ChunkError::Transport(other.to_string()),
        }
    }
}

/// Provider-agnostic unit of streamed completion data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedChunk {
    /// Ordering key, unique within one completion stream.
    pub id: u64,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChunkError>,
}

impl NormalizedChunk {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// A chunk with a single choice carrying `content`.
    pub fn content(id: u64, content: impl Into<String>) -> Self {
        Self::new(id).with_delta(ChunkDelta {
            content: Some(content.into()),
            ..ChunkDelta::default()
        })
    }

    /// A chunk with a single choice carrying provider reasoning text.
    pub fn reasoning(id: u64, reasoning: impl Into<String>) -> Self {
        Self::new(id).with_delta(ChunkDelta {
            reasoning: Some(reasoning.into()),
            ..ChunkDelta::default()
        })
    }

    /// A chunk carrying tool-call fragments.
    pub fn tool_fragments(id: u64, fragments: Vec<ToolCallFragment>) -> Self {
        Self::new(id).with_delta(ChunkDelta {
            tool_calls: fragments,
            ..ChunkDelta::default()
        })
    }

    /// A bare terminal marker.
    pub fn terminal(id: u64) -> Self {
        Self {
            id,
            is_final: true,
            ..Self::default()
        }
    }

    /// The single terminal chunk delivered when a turn's scope is cancelled.
    pub fn cancelled(id: u64) -> Self {
        Self {
            id,
            is_final: true,
            error: Some(ChunkError::Cancelled),
            ..Self::default()
        }
    }

    pub fn failed(id: u64, error: &Error) -> Self {
        Self {
            id,
            is_final: true,
            error: Some(ChunkError::from(error)),
            ..Self::default()
        }
    }

    pub fn with_delta(mut self, delta: ChunkDelta) -> Self {
        match self.choices.first_mut() {
            Some(choice) => choice.delta = delta,
            None => self.choices.push(ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }),
        }
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        match self.choices.first_mut() {
            Some(choice) => choice.finish_reason = Some(reason),
            None => self.choices.push(ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(reason),
            }),
        }
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// The choice the engine tracks. Multi-choice completions are not
    /// requested, so anything past index 0 is ignored.
    pub fn primary(&self) -> Option<&ChunkChoice> {
        self.choices.first()
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.primary().and_then(|c| c.finish_reason.as_ref())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.error, Some(ChunkError::Cancelled))
    }

    /// Whether this chunk closes the response text. Content without a
    /// finish reason never does, even when flagged final.
    pub fn ends_turn(&self) -> bool {
        let finish_reason = self.finish_reason();
        let has_content = self
            .primary()
            .and_then(|c| c.delta.content.as_deref())
            .is_some_and(|c| !c.is_empty());
        if has_content && finish_reason.is_none() {
            return false;
        }
        self.is_final || finish_reason.is_some_and(FinishReason::is_terminal)
    }
}
