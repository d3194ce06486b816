//! The session reducer.
//!
//! All turn state lives in [`Orchestrator`] and is mutated only by
//! [`Orchestrator::update`], one event at a time. Provider streams, tool
//! executions and model listings run as spawned tasks that report back
//! through the same event queue.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::NormalizedChunk;
use crate::completion::{get_completion, resume_completion, CompletionJob};
use crate::error::{Error, ErrorKind};
use crate::processor::{MessageProcessor, ParsingResult, ProcessingState};
use crate::provider::{CompletionSettings, ModelList, ProviderAdapter};
use crate::store::SessionStore;
use crate::tool::ToolExecutor;
use crate::turn::{Attachment, ConversationTurn, ToolCall, Usage};

/// Inputs to the reducer.
#[derive(Debug)]
pub enum OrchestratorEvent {
    /// A new user prompt.
    Submit {
        prompt: String,
        attachments: Vec<Attachment>,
    },
    /// A chunk forwarded by a completion task.
    Chunk { stream: u64, chunk: NormalizedChunk },
    /// A tool execution finished.
    ToolFinished {
        turn: u64,
        call_id: String,
        tool: String,
        result: Result<String, Error>,
    },
    /// Stop the active turn.
    Cancel,
    /// Ask the adapter for its model catalogue.
    ListModels,
    ModelsListed(Result<ModelList, Error>),
    /// Stop the reducer loop.
    Shutdown,
}

/// Notifications for the front end.
#[derive(Debug, Clone)]
pub enum UiEvent {
    StateChanged(ProcessingState),
    /// Full response text so far, reasoning wrapped in markers.
    PartialText(String),
    ToolCallRequested(ToolCall),
    ToolCallCompleted { call_id: String, tool: String },
    /// Usage reported by the last chunk, plus the running session total.
    Usage { latest: Usage, session: Usage },
    /// A turn was written to the store. `turn` is `None` when a cancelled
    /// turn had no content.
    TurnPersisted {
        turn: Option<ConversationTurn>,
        cancelled: bool,
    },
    Error { kind: ErrorKind, message: String },
    Models(ModelList),
}

impl UiEvent {
    fn error(err: &Error) -> Self {
        UiEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Clonable sender for feeding events to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    pub async fn send(&self, event: OrchestratorEvent) -> Result<(), Error> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::invalid_state("orchestrator queue closed"))
    }

    pub async fn submit(&self, prompt: impl Into<String>, attachments: Vec<Attachment>) -> Result<(), Error> {
        self.send(OrchestratorEvent::Submit {
            prompt: prompt.into(),
            attachments,
        })
        .await
    }

    pub async fn cancel(&self) -> Result<(), Error> {
        self.send(OrchestratorEvent::Cancel).await
    }

    pub async fn list_models(&self) -> Result<(), Error> {
        self.send(OrchestratorEvent::ListModels).await
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.send(OrchestratorEvent::Shutdown).await
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub session_id: String,
    /// Capacity of the event queue.
    pub queue_size: usize,
}

impl OrchestratorConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            queue_size: 100,
        }
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }
}

/// Cancellation scopes of the active turn. Cancelling `turn` also cancels
/// `stream` and every tool task.
struct TurnScope {
    turn: CancellationToken,
    stream: CancellationToken,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    adapter: Arc<dyn ProviderAdapter>,
    store: Arc<dyn SessionStore>,
    tools: Arc<dyn ToolExecutor>,
    settings: CompletionSettings,

    history: Vec<ConversationTurn>,
    /// History length at the last successful write.
    committed: usize,
    processor: MessageProcessor,
    state: ProcessingState,

    root: CancellationToken,
    scope: Option<TurnScope>,
    turn: u64,
    stream: u64,
    /// Cancel requested; waiting for the stream's cancellation chunk.
    cancelling: bool,
    /// Results received so far, keyed by call id.
    results: HashMap<String, String>,
    usage: Usage,

    events: mpsc::Sender<OrchestratorEvent>,
    ui: mpsc::Sender<UiEvent>,
}

impl Orchestrator {
    /// Create an orchestrator and the receiving end of its event queue.
    pub fn new(
        config: OrchestratorConfig,
        adapter: Arc<dyn ProviderAdapter>,
        store: Arc<dyn SessionStore>,
        tools: Arc<dyn ToolExecutor>,
        settings: CompletionSettings,
        ui: mpsc::Sender<UiEvent>,
    ) -> (Self, mpsc::Receiver<OrchestratorEvent>) {
        let (events, rx) = mpsc::channel(config.queue_size);

        let mut settings = settings;
        if settings.tools.is_empty() {
            settings.tools = tools.definitions();
        }
        let processor = MessageProcessor::new(adapter.resolve_model(&settings));

        let orchestrator = Self {
            config,
            adapter,
            store,
            tools,
            settings,
            history: Vec::new(),
            committed: 0,
            processor,
            state: ProcessingState::Idle,
            root: CancellationToken::new(),
            scope: None,
            turn: 0,
            stream: 0,
            cancelling: false,
            results: HashMap::new(),
            usage: Usage::default(),
            events,
            ui,
        };
        (orchestrator, rx)
    }

    /// Start from previously stored turns.
    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.committed = history.len();
        self.history = history;
        self
    }

    /// Load the session's stored turns, replacing the in-memory history.
    pub async fn restore(&mut self) -> Result<usize, Error> {
        let history = self
            .store
            .load_session_messages(&self.config.session_id)
            .await?;
        info!(session = %self.config.session_id, turns = history.len(), "Restored session");
        self.committed = history.len();
        self.history = history;
        Ok(self.committed)
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            tx: self.events.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Token usage accumulated over the session.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    /// Drive the reducer until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<OrchestratorEvent>) {
        while let Some(event) = events.recv().await {
            if matches!(event, OrchestratorEvent::Shutdown) {
                self.shutdown();
                break;
            }
            self.update(event).await;
        }
        debug!(session = %self.config.session_id, "Orchestrator loop finished");
    }

    pub async fn update(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::Submit {
                prompt,
                attachments,
            } => self.submit(prompt, attachments).await,
            OrchestratorEvent::Chunk { stream, chunk } => self.on_chunk(stream, chunk).await,
            OrchestratorEvent::ToolFinished {
                turn,
                call_id,
                tool,
                result,
            } => self.on_tool_finished(turn, call_id, tool, result).await,
            OrchestratorEvent::Cancel => self.cancel().await,
            OrchestratorEvent::ListModels => self.list_models(),
            OrchestratorEvent::ModelsListed(Ok(models)) => {
                debug!(provider = %models.provider, count = models.models.len(), "Models listed");
                self.emit(UiEvent::Models(models)).await;
            }
            OrchestratorEvent::ModelsListed(Err(e)) => {
                warn!(error = %e, "Model listing failed");
                self.emit(UiEvent::error(&e)).await;
            }
            OrchestratorEvent::Shutdown => self.shutdown(),
        }
    }

    async fn emit(&self, event: UiEvent) {
        if self.ui.send(event).await.is_err() {
            debug!("UI receiver dropped");
        }
    }

    async fn set_state(&mut self, state: ProcessingState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "State change");
            self.state = state;
            self.emit(UiEvent::StateChanged(state)).await;
        }
    }

    fn job(&mut self) -> CompletionJob {
        self.stream += 1;
        CompletionJob {
            stream: self.stream,
            adapter: Arc::clone(&self.adapter),
            history: self.history.clone(),
            settings: self.settings.clone(),
        }
    }

    async fn submit(&mut self, prompt: String, attachments: Vec<Attachment>) {
        if self.state != ProcessingState::Idle {
            let err = Error::invalid_state(format!("cannot submit while {}", self.state));
            warn!(state = %self.state, "Submit rejected");
            self.emit(UiEvent::error(&err)).await;
            return;
        }

        self.turn += 1;
        self.history
            .push(ConversationTurn::user(prompt).with_attachments(attachments));
        self.processor
            .set_model(self.adapter.resolve_model(&self.settings));
        self.processor.begin();
        self.cancelling = false;
        self.results.clear();

        let turn = self.root.child_token();
        let stream = turn.child_token();
        self.scope = Some(TurnScope {
            turn,
            stream: stream.clone(),
        });
        self.set_state(ProcessingState::ProcessingChunks).await;

        let job = self.job();
        info!(turn = self.turn, stream = job.stream, provider = self.adapter.name(), "Turn started");
        tokio::spawn(get_completion(job, stream, self.events.clone()));
    }

    async fn on_chunk(&mut self, stream: u64, chunk: NormalizedChunk) {
        if stream != self.stream || self.state != ProcessingState::ProcessingChunks {
            debug!(stream, current = self.stream, chunk_id = chunk.id, "Dropping stale chunk");
            return;
        }

        // Once cancelled, only the stream's terminal chunk matters.
        let chunk = if self.cancelling && !chunk.is_cancellation() {
            if chunk.is_final || chunk.error.is_some() {
                NormalizedChunk::cancelled(chunk.id)
            } else {
                debug!(chunk_id = chunk.id, "Dropping chunk after cancel");
                return;
            }
        } else {
            chunk
        };

        match self.processor.process(chunk) {
            Ok(result) => self.on_parsed(result).await,
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_parsed(&mut self, result: ParsingResult) {
        if let Some(latest) = result.usage {
            self.usage += latest;
            self.emit(UiEvent::Usage {
                latest,
                session: self.usage,
            })
            .await;
        }

        if result.skip {
            return;
        }

        if !result.text.is_empty() {
            self.emit(UiEvent::PartialText(result.text)).await;
        }

        if result.cancelled {
            self.finish_turn(result.turn, true).await;
        } else if !result.tool_calls.is_empty() {
            match result.turn {
                Some(turn) => self.await_tools(turn).await,
                None => {
                    self.fail(Error::invalid_state("tool calls without an assistant turn"))
                        .await
                }
            }
        } else if result.finished {
            self.finish_turn(result.turn, false).await;
        }
    }

    async fn persist(&mut self) -> Result<(), Error> {
        self.store
            .update_session_messages(&self.config.session_id, &self.history)
            .await?;
        self.committed = self.history.len();
        debug!(session = %self.config.session_id, turns = self.committed, "Session persisted");
        Ok(())
    }

    async fn finish_turn(&mut self, turn: Option<ConversationTurn>, cancelled: bool) {
        if let Some(turn) = &turn {
            self.history.push(turn.clone());
        }
        self.set_state(ProcessingState::Finalized).await;

        if let Err(e) = self.persist().await {
            self.fail(e).await;
            return;
        }
        info!(turn = self.turn, cancelled, "Turn finished");
        self.emit(UiEvent::TurnPersisted { turn, cancelled }).await;
        self.end_turn().await;
    }

    async fn await_tools(&mut self, turn: ConversationTurn) {
        let calls = turn.tool_calls.clone();
        self.history.push(turn.clone());
        self.set_state(ProcessingState::AwaitingToolCallResult).await;

        if let Err(e) = self.persist().await {
            self.fail(e).await;
            return;
        }
        self.emit(UiEvent::TurnPersisted {
            turn: Some(turn),
            cancelled: false,
        })
        .await;

        let Some(scope) = &self.scope else {
            return;
        };
        // The rest of this stream can only repeat the finish reason.
        scope.stream.cancel();
        let turn_scope = scope.turn.clone();

        for call in calls {
            self.emit(UiEvent::ToolCallRequested(call.clone())).await;
            self.spawn_tool(call, turn_scope.child_token());
        }
    }

    fn spawn_tool(&self, call: ToolCall, scope: CancellationToken) {
        let tools = Arc::clone(&self.tools);
        let events = self.events.clone();
        let turn = self.turn;

        debug!(turn, call_id = %call.id, tool = %call.name, "Dispatching tool");
        tokio::spawn(async move {
            let ToolCall {
                id, name, arguments, ..
            } = call;
            let result = tokio::select! {
                biased;
                _ = scope.cancelled() => Err(Error::Cancelled),
                result = run_tool(tools.as_ref(), &name, arguments) => result,
            };
            let _ = events
                .send(OrchestratorEvent::ToolFinished {
                    turn,
                    call_id: id,
                    tool: name,
                    result,
                })
                .await;
        });
    }

    async fn on_tool_finished(
        &mut self,
        turn: u64,
        call_id: String,
        tool: String,
        result: Result<String, Error>,
    ) {
        if turn != self.turn || self.state != ProcessingState::AwaitingToolCallResult {
            debug!(turn, current = self.turn, call_id = %call_id, "Dropping stale tool result");
            return;
        }

        let output = match result {
            Ok(output) => output,
            Err(Error::Cancelled) => {
                debug!(call_id = %call_id, tool = %tool, "Tool cancelled");
                return;
            }
            Err(e) => {
                let err = match e {
                    Error::Tool { .. } => e,
                    other => Error::tool(&tool, other.to_string()),
                };
                warn!(call_id = %call_id, tool = %tool, error = %err, "Tool failed");
                self.fail(err).await;
                return;
            }
        };

        let Some(pending) = self.history.last() else {
            return;
        };
        if !pending.tool_calls.iter().any(|c| c.id == call_id) {
            warn!(call_id = %call_id, tool = %tool, "Result for unknown tool call");
            return;
        }
        if self.results.contains_key(&call_id) {
            debug!(call_id = %call_id, "Duplicate tool result ignored");
            return;
        }

        debug!(call_id = %call_id, tool = %tool, len = output.len(), "Tool finished");
        self.results.insert(call_id.clone(), output);
        self.emit(UiEvent::ToolCallCompleted { call_id, tool }).await;

        if self.results.len() == pending.tool_calls.len() {
            self.resume().await;
        }
    }

    async fn resume(&mut self) {
        let mut results = std::mem::take(&mut self.results);
        if let Some(pending) = self.history.last_mut() {
            for call in &mut pending.tool_calls {
                if let Some(output) = results.remove(&call.id) {
                    call.result = Some(output);
                }
            }
        }

        if let Err(e) = self.processor.resume() {
            self.fail(e).await;
            return;
        }

        let Some(scope) = self.scope.as_mut() else {
            return;
        };
        let stream = scope.turn.child_token();
        scope.stream = stream.clone();
        self.set_state(ProcessingState::ProcessingChunks).await;

        let job = self.job();
        debug!(turn = self.turn, stream = job.stream, "Resuming with tool results");
        tokio::spawn(resume_completion(job, stream, self.events.clone()));
    }

    async fn cancel(&mut self) {
        match self.state {
            ProcessingState::ProcessingChunks => {
                if self.cancelling {
                    return;
                }
                info!(turn = self.turn, "Cancelling turn");
                self.cancelling = true;
                if let Some(scope) = &self.scope {
                    scope.stream.cancel();
                }
            }
            ProcessingState::AwaitingToolCallResult => {
                // The pending turn is already stored.
                info!(turn = self.turn, "Cancelling tool calls");
                self.end_turn().await;
            }
            state => debug!(state = %state, "Nothing to cancel"),
        }
    }

    /// Report an error, drop everything not yet committed and return to Idle.
    async fn fail(&mut self, err: Error) {
        warn!(turn = self.turn, error = %err, "Turn failed");
        self.set_state(ProcessingState::Error).await;
        self.emit(UiEvent::error(&err)).await;

        if self.history.len() > self.committed {
            debug!(dropped = self.history.len() - self.committed, "Discarding uncommitted turns");
            self.history.truncate(self.committed);
        }
        self.end_turn().await;
    }

    async fn end_turn(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.turn.cancel();
        }
        self.cancelling = false;
        self.results.clear();
        self.processor.reset();
        self.set_state(ProcessingState::Idle).await;
    }

    fn list_models(&self) {
        let adapter = Arc::clone(&self.adapter);
        let events = self.events.clone();
        let scope = self.root.child_token();
        tokio::spawn(async move {
            let result = adapter.request_models_list(scope).await;
            let _ = events.send(OrchestratorEvent::ModelsListed(result)).await;
        });
    }

    fn shutdown(&mut self) {
        info!(session = %self.config.session_id, "Shutting down");
        self.root.cancel();
    }
}

async fn run_tool(tools: &dyn ToolExecutor, name: &str, arguments: Value) -> Result<String, Error> {
    tools.execute_tool(name, arguments).await
}
