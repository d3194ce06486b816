//! Plain-text rendering of orchestrator events.

use std::io::{self, Write};

use turnstile_core::{ProcessingState, UiEvent};

/// What the caller should do after an event was rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The turn or request in flight is over.
    Done,
}

pub struct Renderer<O: Write, E: Write> {
    out: O,
    err: E,
    /// Response text already written for the current turn.
    printed: String,
    busy: bool,
    errors: usize,
}

impl<O: Write, E: Write> Renderer<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            printed: String::new(),
            busy: false,
            errors: 0,
        }
    }

    /// Errors reported since creation.
    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn handle(&mut self, event: UiEvent) -> io::Result<Flow> {
        match event {
            UiEvent::StateChanged(ProcessingState::Idle) => {
                if !self.busy {
                    return Ok(Flow::Continue);
                }
                self.busy = false;
                if !self.printed.is_empty() && !self.printed.ends_with('\n') {
                    writeln!(self.out)?;
                }
                self.printed.clear();
                self.out.flush()?;
                return Ok(Flow::Done);
            }
            UiEvent::StateChanged(_) => self.busy = true,
            UiEvent::PartialText(text) => self.text(&text)?,
            UiEvent::ToolCallRequested(call) => {
                writeln!(self.err, "[tool] {}({})", call.name, call.arguments)?;
            }
            UiEvent::ToolCallCompleted { call_id, tool } => {
                tracing::debug!(call_id = %call_id, tool = %tool, "Tool call completed");
            }
            UiEvent::Usage { latest, session } => {
                tracing::info!(
                    prompt_tokens = latest.prompt_tokens,
                    completion_tokens = latest.completion_tokens,
                    session_total = session.total_tokens,
                    "Token usage"
                );
            }
            UiEvent::TurnPersisted { cancelled: true, .. } => {
                if !self.printed.is_empty() {
                    writeln!(self.out)?;
                    self.printed.push('\n');
                }
                writeln!(self.err, "[cancelled]")?;
            }
            UiEvent::TurnPersisted { .. } => {}
            UiEvent::Error { kind, message } => {
                self.errors += 1;
                writeln!(self.err, "Error ({kind:?}): {message}")?;
                if !self.busy {
                    return Ok(Flow::Done);
                }
            }
            UiEvent::Models(list) => {
                writeln!(self.out, "Models for {}:", list.provider)?;
                for id in list.ids() {
                    writeln!(self.out, "  {id}")?;
                }
                return Ok(Flow::Done);
            }
        }
        Ok(Flow::Continue)
    }

    /// Write whatever `text` adds to what is already on screen.
    fn text(&mut self, text: &str) -> io::Result<()> {
        match text.strip_prefix(self.printed.as_str()) {
            Some(suffix) => {
                write!(self.out, "{suffix}")?;
            }
            None => {
                // Earlier output was rewritten (a late chunk landed before it).
                tracing::debug!(printed = self.printed.len(), now = text.len(), "Response text rewritten");
                write!(self.out, "\n{text}")?;
            }
        }
        self.out.flush()?;
        self.printed = text.to_string();
        Ok(())
    }
}
