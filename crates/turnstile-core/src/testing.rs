//! Test doubles for the adapter, store and tool seams.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::chunk::NormalizedChunk;
use crate::error::Error;
use crate::provider::{ChunkStream, CompletionSettings, ModelInfo, ModelList, ProviderAdapter};
use crate::store::SessionStore;
use crate::tool::{ToolDefinition, ToolExecutor};
use crate::turn::ConversationTurn;

/// What one `request_completion` call produces.
pub struct Script {
    items: Vec<Result<NormalizedChunk, Error>>,
    /// Keep the stream open after the scripted items.
    hang: bool,
    /// Fail the request itself instead of returning a stream.
    request_error: Option<Error>,
}

impl Script {
    pub fn chunks(chunks: Vec<NormalizedChunk>) -> Self {
        Self {
            items: chunks.into_iter().map(Ok).collect(),
            hang: false,
            request_error: None,
        }
    }

    pub fn failing(error: Error) -> Self {
        Self {
            items: Vec::new(),
            hang: false,
            request_error: Some(error),
        }
    }

    /// End the scripted items with a stream error.
    pub fn then_fail(mut self, error: Error) -> Self {
        self.items.push(Err(error));
        self
    }

    /// Never end the stream on its own; only cancellation stops it.
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// An adapter that replays scripts in FIFO order.
pub struct ScriptedAdapter {
    scripts: Mutex<Vec<Script>>,
    /// History of every request (for assertion).
    captured: Mutex<Vec<Vec<ConversationTurn>>>,
    models: Vec<String>,
    pub name: String,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            captured: Mutex::new(Vec::new()),
            models: Vec::new(),
            name: "scripted".to_string(),
        }
    }

    pub fn with_script(self, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(0, script);
        self
    }

    pub fn with_models(mut self, models: Vec<&str>) -> Self {
        self.models = models.into_iter().map(str::to_string).collect();
        self
    }

    pub fn request_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    pub fn captured(&self) -> Vec<Vec<ConversationTurn>> {
        self.captured.lock().unwrap().clone()
    }
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        Some("scripted-model")
    }

    async fn request_completion(
        &self,
        _scope: CancellationToken,
        history: &[ConversationTurn],
        _settings: &CompletionSettings,
    ) -> Result<ChunkStream, Error> {
        self.captured.lock().unwrap().push(history.to_vec());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| Error::stream("No script queued"))?;

        if let Some(err) = script.request_error {
            return Err(err);
        }
        let items = stream::iter(script.items);
        if script.hang {
            Ok(Box::pin(items.chain(stream::pending())))
        } else {
            Ok(Box::pin(items))
        }
    }

    async fn request_models_list(&self, _scope: CancellationToken) -> Result<ModelList, Error> {
        Ok(ModelList {
            provider: self.name.clone(),
            models: self.models.iter().map(ModelInfo::new).collect(),
        })
    }
}

/// A store that records every write.
#[derive(Default)]
pub struct RecordingStore {
    writes: Mutex<Vec<(String, Vec<ConversationTurn>)>>,
    fail: Mutex<bool>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn last_write(&self) -> Option<Vec<ConversationTurn>> {
        self.writes.lock().unwrap().last().map(|(_, turns)| turns.clone())
    }
}

#[async_trait]
impl SessionStore for RecordingStore {
    async fn update_session_messages(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<(), Error> {
        if *self.fail.lock().unwrap() {
            return Err(Error::store("write rejected"));
        }
        self.writes
            .lock()
            .unwrap()
            .push((session_id.to_string(), turns.to_vec()));
        Ok(())
    }

    async fn load_session_messages(&self, session_id: &str) -> Result<Vec<ConversationTurn>, Error> {
        Ok(self
            .writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, turns)| turns.clone())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct MockTools {
    results: HashMap<String, Result<String, Error>>,
    calls: Vec<(String, Value)>,
    delay: Option<Duration>,
}

/// A tool executor with canned results per tool name. Clones share state.
#[derive(Clone, Default)]
pub struct MockToolExecutor {
    inner: Arc<Mutex<MockTools>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, tool: &str, result: Result<String, Error>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .results
            .insert(tool.to_string(), result);
        self
    }

    /// Sleep before answering every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute_tool(&self, name: &str, arguments: Value) -> Result<String, Error> {
        let (result, delay) = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push((name.to_string(), arguments));
            let result = inner
                .results
                .get(name)
                .cloned()
                .unwrap_or_else(|| Err(Error::tool(name, "no mock result")));
            (result, inner.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<_> = inner.results.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ToolDefinition::new(name, "mock tool"))
            .collect()
    }
}
