use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use turnstile_core::{
    ChunkStream, CompletionSettings, ConversationTurn, Error, ModelList, NormalizedChunk,
    ProviderAdapter,
};

use crate::openai_compat::{build_request, ModelsResponse, StreamTranslator};
use crate::stream::{http_error, streaming_client, SseFramer};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for OpenAI and OpenAI-compatible `/chat/completions` servers.
pub struct OpenAiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
}

impl OpenAiAdapter {
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

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            // Local servers often run without a key.
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
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
        let api_request = build_request(history, settings, self.default_model.as_deref(), true);
        debug!(
            model = ?api_request.model,
            message_count = api_request.messages.len(),
            has_tools = api_request.tools.is_some(),
            "OpenAI stream request"
        );
        trace!(request = %serde_json::to_string(&api_request).unwrap_or_default(), "OpenAI stream request payload");

        let send = self
            .authorize(self.client.post(format!("{}/chat/completions", self.base_url)))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .header("Accept-Encoding", "identity")
            .header("Cache-Control", "no-cache")
            .json(&api_request)
            .send();

        let response = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(Error::Cancelled),
            response = send => response.map_err(|e| Error::network(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "OpenAI request failed");
            return Err(http_error(status.as_u16(), &body));
        }

        let (tx, rx) = mpsc::channel::<Result<NormalizedChunk, Error>>(100);

        tokio::spawn(async move {
            let mut response = response;
            let mut framer = SseFramer::new();
            let mut translator = StreamTranslator::new();
            let started = std::time::Instant::now();

            loop {
                let read = tokio::select! {
                    _ = scope.cancelled() => {
                        debug!("OpenAI stream cancelled");
                        return;
                    }
                    read = response.chunk() => read,
                };

                let bytes = match read {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "OpenAI stream read failed");
                        let _ = tx.send(Err(Error::network(e.to_string()))).await;
                        return;
                    }
                };
                trace!(elapsed = ?started.elapsed(), bytes = bytes.len(), "SSE bytes received");

                for data in framer.push(&bytes) {
                    match translator.data(&data) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, data = %data, "Failed to translate SSE message");
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                    if translator.is_done() {
                        debug!(elapsed = ?started.elapsed(), "OpenAI stream complete");
                        return;
                    }
                }
            }

            // Byte stream ended without [DONE].
            let mut tail = Vec::new();
            if let Some(data) = framer.finish() {
                match translator.data(&data) {
                    Ok(chunks) => tail.extend(chunks),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            tail.extend(translator.finish());
            for chunk in tail {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
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
        Ok(models.into_list(self.name()))
    }
}
