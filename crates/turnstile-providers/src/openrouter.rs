use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use turnstile_core::{
    ChunkStream, CompletionSettings, ConversationTurn, Error, ModelList, NormalizedChunk,
    ProviderAdapter,
};

use crate::openai_compat::{build_request, ModelsResponse, StreamTranslator};
use crate::stream::{http_error, streaming_client};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Adapter for the OpenRouter aggregator.
///
/// The payload is OpenAI-shaped; reasoning arrives in `delta.reasoning` and
/// upstream failures can show up as `error` objects mid-stream.
pub struct OpenRouterAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
    app_title: Option<String>,
}

impl OpenRouterAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: streaming_client(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
            app_title: None,
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

    /// Application name reported in OpenRouter's `X-Title` header.
    pub fn with_app_title(mut self, title: impl Into<String>) -> Self {
        self.app_title = Some(title.into());
        self
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        match &self.app_title {
            Some(title) => builder.header("X-Title", title),
            None => builder,
        }
    }
}

/// Read the body of a rejected stream request into a transport error.
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
impl ProviderAdapter for OpenRouterAdapter {
    fn name(&self) -> &str {
        "openrouter"
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
            "OpenRouter stream request"
        );
        trace!(request = %serde_json::to_string(&api_request).unwrap_or_default(), "OpenRouter stream request payload");

        let builder = self
            .request(self.client.post(format!("{}/chat/completions", self.base_url)))
            .json(&api_request);
        let mut es = EventSource::new(builder).map_err(|e| Error::stream(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<NormalizedChunk, Error>>(100);

        tokio::spawn(async move {
            let mut translator = StreamTranslator::new();

            loop {
                let event = tokio::select! {
                    _ = scope.cancelled() => {
                        debug!("OpenRouter stream cancelled");
                        es.close();
                        return;
                    }
                    event = es.next() => event,
                };

                let result = match event {
                    None | Some(Err(EventSourceError::StreamEnded)) => break,
                    Some(Ok(Event::Open)) => {
                        debug!("OpenRouter SSE connection opened");
                        continue;
                    }
                    Some(Ok(Event::Message(msg))) => {
                        trace!(event_type = %msg.event, data = %msg.data, "OpenRouter SSE event");
                        translator.data(&msg.data)
                    }
                    Some(Err(e)) => {
                        es.close();
                        let err = rejected(e).await;
                        error!(error = %err, "OpenRouter SSE error");
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
                    debug!("OpenRouter stream complete");
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
            .request(self.client.get(format!("{}/models", self.base_url)))
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
