//! turnstile-core: streaming completion reconciliation and turn orchestration
//!
//! Provider adapters turn vendor streams into [`NormalizedChunk`]s; the
//! [`MessageProcessor`] rebuilds an assistant turn from them; the
//! [`Orchestrator`] drives turns, tool calls, cancellation and persistence.

pub mod assembler;
pub mod chunk;
pub mod completion;
pub mod error;
pub mod orchestrator;
pub mod processor;
pub mod provider;
pub mod store;
pub mod tool;
pub mod turn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use assembler::ToolCallAssembler;
pub use chunk::{ChunkChoice, ChunkDelta, ChunkError, FinishReason, NormalizedChunk, ToolCallFragment};
pub use completion::{get_completion, resume_completion, CompletionJob};
pub use error::{Error, ErrorKind};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorEvent, OrchestratorHandle, UiEvent};
pub use processor::{
    model_header, plain_content, reasoning_markup, BufferedChunk, MessageProcessor, ParsingResult, ProcessingState,
    REASONING_END, REASONING_START,
};
pub use provider::{ChunkStream, CompletionSettings, ModelInfo, ModelList, ProviderAdapter};
pub use store::{InMemorySessionStore, SessionStore};
pub use tool::{PropertySchema, Tool, ToolDefinition, ToolExecutor, ToolOutput, ToolParameters, ToolRegistry};
pub use turn::{Attachment, ConversationTurn, Role, ToolCall, Usage};

pub type Result<T> = std::result::Result<T, Error>;
