use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::chunk::NormalizedChunk;
use crate::error::Error;
use crate::tool::ToolDefinition;
use crate::turn::ConversationTurn;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<NormalizedChunk, Error>> + Send>>;

/// Per-request generation settings handed to an adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
    /// Extra parameters passed through to the API (e.g., reasoning_effort)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CompletionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_extra(mut self, extra: HashMap<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owned_by: None,
            context_window: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub provider: String,
    pub models: Vec<ModelInfo>,
}

impl ModelList {
    pub fn ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.id.as_str()).collect()
    }
}

/// One vendor API, translated into normalized chunks.
///
/// Implementations must deliver chunks with strictly increasing ids within
/// one stream and serialize any internal concurrency onto that stream.
/// Cancelling `scope` must end the stream promptly; the orchestrator emits
/// the cancellation chunk itself, so adapters need not.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Model used when the settings don't name one.
    fn default_model(&self) -> Option<&str>;

    async fn request_completion(
        &self,
        scope: CancellationToken,
        history: &[ConversationTurn],
        settings: &CompletionSettings,
    ) -> Result<ChunkStream, Error>;

    async fn request_models_list(&self, scope: CancellationToken) -> Result<ModelList, Error>;

    /// Name of the model a request with these settings will use.
    fn resolve_model(&self, settings: &CompletionSettings) -> String {
        settings
            .model
            .clone()
            .or_else(|| self.default_model().map(str::to_string))
            .unwrap_or_else(|| self.name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_settings_builder() {
        let settings = CompletionSettings::new()
            .with_model("gpt-4o")
            .with_temperature(0.7)
            .with_max_tokens(1000)
            .with_system_prompt("be brief");

        assert_eq!(settings.model, Some("gpt-4o".to_string()));
        assert_eq!(settings.temperature, Some(0.7));
        assert_eq!(settings.max_tokens, Some(1000));
        assert_eq!(settings.system_prompt.as_deref(), Some("be brief"));
    }

    #[test]
    fn test_model_list_ids() {
        let list = ModelList {
            provider: "openai".into(),
            models: vec![ModelInfo::new("a"), ModelInfo::new("b")],
        };
        assert_eq!(list.ids(), vec!["a", "b"]);
    }
}
