//! Chunk-by-chunk reconstruction of one assistant turn.
//!
//! The [`MessageProcessor`] keeps an id-sorted, duplicate-free buffer of every
//! chunk that carried information, rebuilds the response text from it after
//! each chunk, decides when the turn is over, and hands tool-call fragments to
//! the [`ToolCallAssembler`]. It is a plain value owned by the orchestrator's
//! reducer; nothing else touches it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::assembler::ToolCallAssembler;
use crate::chunk::{FinishReason, NormalizedChunk};
use crate::error::Error;
use crate::turn::{ConversationTurn, ToolCall, Usage};

/// Marker opening a reasoning segment in streamed text.
pub const REASONING_START: &str = "<think>";
/// Marker closing a reasoning segment in streamed text.
pub const REASONING_END: &str = "</think>";

/// Reasoning delimiters some models embed directly in their content.
const INLINE_DELIMITERS: [(&str, &str); 2] = [("<thinking>", "</thinking>"), ("<think>", "</think>")];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    #[default]
    Idle,
    ProcessingChunks,
    AwaitingToolCallResult,
    Finalized,
    Error,
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessingState::Idle => "idle",
            ProcessingState::ProcessingChunks => "processing",
            ProcessingState::AwaitingToolCallResult => "awaiting-tool-results",
            ProcessingState::Finalized => "finalized",
            ProcessingState::Error => "error",
        };
        f.write_str(name)
    }
}

/// The text-bearing part of a chunk, as kept in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedChunk {
    pub id: u64,
    pub content: String,
    pub reasoning: String,
    pub is_final: bool,
}

impl BufferedChunk {
    fn from_chunk(chunk: &NormalizedChunk, is_final: bool) -> Self {
        let delta = chunk.primary().map(|c| &c.delta);
        Self {
            id: chunk.id,
            content: delta.and_then(|d| d.content.clone()).unwrap_or_default(),
            reasoning: delta.and_then(|d| d.reasoning.clone()).unwrap_or_default(),
            is_final,
        }
    }

    fn has_text(&self) -> bool {
        !self.content.is_empty() || !self.reasoning.is_empty()
    }
}

/// Outcome of processing one chunk.
#[derive(Debug, Clone, Default)]
pub struct ParsingResult {
    /// The chunk carried nothing new; no state changed.
    pub skip: bool,
    /// The turn was cancelled; `turn` holds the best-effort partial response.
    pub cancelled: bool,
    /// The turn reached a terminal chunk; `turn` holds the final response.
    pub finished: bool,
    /// Response text rebuilt from the buffer, reasoning wrapped in markers.
    pub text: String,
    /// Snapshot of the buffer after this chunk.
    pub buffer: Vec<BufferedChunk>,
    /// Usage reported by this chunk, if any.
    pub usage: Option<Usage>,
    /// Completed tool calls awaiting execution.
    pub tool_calls: Vec<ToolCall>,
    pub state: ProcessingState,
    /// Storable turn, present when finished, cancelled or awaiting tool results.
    pub turn: Option<ConversationTurn>,
}

#[derive(Debug, Default)]
struct Rendered {
    /// Text with reasoning wrapped in [`REASONING_START`]/[`REASONING_END`].
    stream: String,
    content: String,
    reasoning: String,
}

/// Walks buffered chunks in id order, placing reasoning markers and
/// splitting inline delimiters out of content.
#[derive(Default)]
struct Renderer {
    out: Rendered,
    /// Marker opened and not yet closed.
    open: bool,
    /// Marker already closed once this turn.
    closed: bool,
    /// Inside an inline delimiter pair embedded in content.
    inline: Option<&'static str>,
    /// Consecutive content pieces, scanned together so a delimiter split
    /// across chunks is still recognized.
    pending: String,
}

impl Renderer {
    fn reasoning(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.out.reasoning.push_str(text);
        if self.closed {
            // Only one reasoning block is shown per turn.
            trace!(len = text.len(), "Reasoning after closed block kept out of stream text");
            return;
        }
        if !self.open {
            self.out.stream.push_str(REASONING_START);
            self.open = true;
        }
        self.out.stream.push_str(text);
    }

    fn content(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.open {
            self.out.stream.push_str(REASONING_END);
            self.open = false;
            self.closed = true;
        }
        self.out.stream.push_str(text);
        self.out.content.push_str(text);
    }

    fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let mut rest = pending.as_str();

        while !rest.is_empty() {
            match self.inline {
                None => match find_opening(rest) {
                    Some((pos, open, close)) => {
                        self.content(&rest[..pos]);
                        rest = &rest[pos + open.len()..];
                        self.inline = Some(close);
                    }
                    None => {
                        self.content(rest);
                        rest = "";
                    }
                },
                Some(close) => match rest.find(close) {
                    Some(pos) => {
                        self.reasoning(&rest[..pos]);
                        rest = &rest[pos + close.len()..];
                        self.inline = None;
                    }
                    None => {
                        self.reasoning(rest);
                        rest = "";
                    }
                },
            }
        }
    }

    fn push(&mut self, chunk: &BufferedChunk) {
        if !chunk.reasoning.is_empty() {
            self.flush();
            self.reasoning(&chunk.reasoning);
        }
        self.pending.push_str(&chunk.content);
    }

    fn finish(mut self, close: bool) -> Rendered {
        self.flush();
        if close && self.open {
            self.out.stream.push_str(REASONING_END);
        }
        self.out
    }
}

fn find_opening(text: &str) -> Option<(usize, &'static str, &'static str)> {
    INLINE_DELIMITERS
        .iter()
        .filter_map(|(open, close)| text.find(open).map(|pos| (pos, *open, *close)))
        .min_by_key(|(pos, _, _)| *pos)
}

fn render(buffer: &[BufferedChunk], close: bool) -> Rendered {
    let mut renderer = Renderer::default();
    for chunk in buffer.iter().filter(|c| c.has_text()) {
        renderer.push(chunk);
    }
    renderer.finish(close)
}

/// Header placed once at the top of every stored assistant turn.
pub fn model_header(model: &str) -> String {
    format!("**{model}**\n\n")
}

/// Renderer markup for a stored reasoning block.
pub fn reasoning_markup(reasoning: &str) -> String {
    format!("<details><summary>Reasoning</summary>\n\n{}\n\n</details>\n\n", reasoning.trim())
}

/// Stored assistant content without the model header and reasoning markup,
/// as it should be sent back to a provider.
pub fn plain_content(turn: &ConversationTurn) -> &str {
    let mut text = turn.content.as_str();
    if let Some(model) = &turn.model {
        let header = model_header(model);
        text = text.strip_prefix(header.as_str()).unwrap_or(text);
    }
    if text.starts_with("<details><summary>Reasoning</summary>") {
        const END: &str = "</details>\n\n";
        if let Some(pos) = text.find(END) {
            text = &text[pos + END.len()..];
        }
    }
    text
}

/// Reconstructs one assistant turn from a stream of normalized chunks.
#[derive(Debug, Clone, Default)]
pub struct MessageProcessor {
    model: String,
    state: ProcessingState,
    buffer: Vec<BufferedChunk>,
    assembler: ToolCallAssembler,
    usage: Option<Usage>,
    /// Ids of usage-only chunks, which never enter the buffer.
    usage_ids: BTreeSet<u64>,
}

impl MessageProcessor {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    pub fn buffer(&self) -> &[BufferedChunk] {
        &self.buffer
    }

    /// Latest usage reported during this turn.
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Current response text, without closing an open reasoning block.
    pub fn text(&self) -> String {
        render(&self.buffer, false).stream
    }

    /// Start a new turn, discarding anything left from the previous one.
    pub fn begin(&mut self) {
        self.reset();
        self.state = ProcessingState::ProcessingChunks;
    }

    /// Drop all turn state and return to Idle.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.assembler.reset();
        self.usage = None;
        self.usage_ids.clear();
        self.state = ProcessingState::Idle;
    }

    /// Continue after tool results have been supplied.
    ///
    /// This is the only way out of [`ProcessingState::AwaitingToolCallResult`]
    /// back into [`ProcessingState::ProcessingChunks`]. The continuation is a
    /// fresh completion stream, so the buffer starts empty.
    pub fn resume(&mut self) -> Result<(), Error> {
        if self.state != ProcessingState::AwaitingToolCallResult {
            return Err(Error::invalid_state(format!(
                "cannot resume from state {}",
                self.state
            )));
        }
        self.buffer.clear();
        self.assembler.reset();
        self.usage_ids.clear();
        self.state = ProcessingState::ProcessingChunks;
        Ok(())
    }

    /// Process a single chunk.
    pub fn process(&mut self, chunk: NormalizedChunk) -> Result<ParsingResult, Error> {
        if chunk.is_cancellation() {
            debug!(chunk_id = chunk.id, buffered = self.buffer.len(), "Turn cancelled");
            return Ok(self.cancel());
        }

        if let Some(err) = chunk.error.clone() {
            self.state = ProcessingState::Error;
            return Err(err.into());
        }

        match self.state {
            ProcessingState::Idle => self.state = ProcessingState::ProcessingChunks,
            ProcessingState::ProcessingChunks => {}
            other => {
                debug!(chunk_id = chunk.id, state = %other, "Ignoring chunk outside an active stream");
                return Ok(self.skipped(None));
            }
        }

        let slot = match self.buffer.binary_search_by_key(&chunk.id, |c| c.id) {
            Ok(_) => None,
            Err(slot) => Some(slot),
        };
        let Some(slot) = slot.filter(|_| !self.usage_ids.contains(&chunk.id)) else {
            debug!(chunk_id = chunk.id, "Dropping duplicate chunk");
            return Ok(self.skipped(None));
        };

        let finish_reason = chunk.finish_reason().cloned();
        let carries_information = chunk
            .primary()
            .is_some_and(|choice| !choice.delta.is_empty());
        if !chunk.is_final && finish_reason.is_none() && !carries_information {
            // Nothing to buffer, but a usage report still claims its id.
            if let Some(usage) = chunk.usage {
                self.usage = Some(usage);
                self.usage_ids.insert(chunk.id);
            }
            trace!(chunk_id = chunk.id, "Skipping chunk without content");
            return Ok(self.skipped(chunk.usage));
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let is_terminal = chunk.ends_turn();

        if slot < self.buffer.len() {
            debug!(chunk_id = chunk.id, before = self.buffer[slot].id, "Out-of-order chunk reordered");
        }
        self.buffer.insert(slot, BufferedChunk::from_chunk(&chunk, is_terminal));

        if let Some(choice) = chunk.choices.into_iter().next() {
            self.assembler.extend(choice.delta.tool_calls);
        }

        let wants_tools = finish_reason == Some(FinishReason::ToolCalls)
            || (is_terminal && !self.assembler.is_empty());
        if wants_tools {
            // The assembler resets itself even when the merge fails.
            let calls = match self.assembler.finish() {
                Ok(calls) => calls,
                Err(e) => {
                    self.state = ProcessingState::Error;
                    return Err(e);
                }
            };
            if !calls.is_empty() {
                debug!(count = calls.len(), "Tool calls complete, awaiting results");
                self.state = ProcessingState::AwaitingToolCallResult;
                let rendered = render(&self.buffer, true);
                let turn = self.synthesize_turn(&rendered, calls.clone());
                return Ok(ParsingResult {
                    text: rendered.stream,
                    buffer: self.buffer.clone(),
                    usage: chunk.usage,
                    tool_calls: calls,
                    state: self.state,
                    turn: Some(turn),
                    ..ParsingResult::default()
                });
            }
        }

        if is_terminal {
            self.state = ProcessingState::Finalized;
            let rendered = render(&self.buffer, true);
            let turn = self.synthesize_turn(&rendered, Vec::new());
            return Ok(ParsingResult {
                finished: true,
                text: rendered.stream,
                buffer: self.buffer.clone(),
                usage: chunk.usage,
                state: self.state,
                turn: Some(turn),
                ..ParsingResult::default()
            });
        }

        Ok(ParsingResult {
            text: self.text(),
            buffer: self.buffer.clone(),
            usage: chunk.usage,
            state: self.state,
            ..ParsingResult::default()
        })
    }

    fn cancel(&mut self) -> ParsingResult {
        let rendered = render(&self.buffer, true);
        let turn = (!rendered.stream.is_empty())
            .then(|| self.synthesize_turn(&rendered, Vec::new()));
        self.assembler.reset();
        self.state = ProcessingState::Finalized;
        ParsingResult {
            cancelled: true,
            finished: true,
            text: rendered.stream,
            buffer: self.buffer.clone(),
            state: self.state,
            turn,
            ..ParsingResult::default()
        }
    }

    fn skipped(&self, usage: Option<Usage>) -> ParsingResult {
        ParsingResult {
            skip: true,
            text: self.text(),
            buffer: self.buffer.clone(),
            usage,
            state: self.state,
            ..ParsingResult::default()
        }
    }

    fn synthesize_turn(&self, rendered: &Rendered, tool_calls: Vec<ToolCall>) -> ConversationTurn {
        let mut body = String::new();
        if !rendered.reasoning.trim().is_empty() {
            body.push_str(&reasoning_markup(&rendered.reasoning));
        }
        body.push_str(&rendered.content);

        let header = model_header(&self.model);
        let content = if body.is_empty() || self.model.is_empty() || body.starts_with(&header) {
            body
        } else {
            format!("{header}{body}")
        };

        let mut turn = ConversationTurn::assistant(content).with_tool_calls(tool_calls);
        if !self.model.is_empty() {
            turn = turn.with_model(self.model.clone());
        }
        if !rendered.reasoning.is_empty() {
            turn = turn.with_reasoning(rendered.reasoning.clone());
        }
        turn
    }
}
