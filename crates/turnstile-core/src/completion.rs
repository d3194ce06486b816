//! Units of work that run one provider request and forward its chunks.
//!
//! Each function here is spawned as its own task. It is the only producer
//! for its stream id on the orchestrator queue, and it always ends that
//! stream with exactly one terminal chunk: the adapter's own final chunk, an
//! error chunk, a synthesized end marker, or a cancellation chunk.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::NormalizedChunk;
use crate::error::Error;
use crate::orchestrator::OrchestratorEvent;
use crate::provider::{CompletionSettings, ProviderAdapter};
use crate::turn::ConversationTurn;

/// Everything a completion task needs, captured by value at spawn time.
#[derive(Clone)]
pub struct CompletionJob {
    /// Stream id used to tag forwarded chunks.
    pub stream: u64,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub history: Vec<ConversationTurn>,
    pub settings: CompletionSettings,
}

/// Request a completion for the job's history and forward every chunk.
pub async fn get_completion(
    job: CompletionJob,
    scope: CancellationToken,
    output: mpsc::Sender<OrchestratorEvent>,
) {
    forward(job, scope, output).await;
}

/// Continue a turn after tool results were attached to the last assistant
/// turn of the history.
pub async fn resume_completion(
    job: CompletionJob,
    scope: CancellationToken,
    output: mpsc::Sender<OrchestratorEvent>,
) {
    let ready = job
        .history
        .last()
        .is_some_and(ConversationTurn::tool_results_complete);
    if !ready {
        let err = Error::invalid_state("resume requires an assistant turn with every tool result");
        warn!(stream = job.stream, error = %err, "Refusing to resume completion");
        deliver(&output, job.stream, NormalizedChunk::failed(0, &err)).await;
        return;
    }
    forward(job, scope, output).await;
}

async fn deliver(output: &mpsc::Sender<OrchestratorEvent>, stream: u64, chunk: NormalizedChunk) -> bool {
    output
        .send(OrchestratorEvent::Chunk { stream, chunk })
        .await
        .is_ok()
}

async fn forward(job: CompletionJob, scope: CancellationToken, output: mpsc::Sender<OrchestratorEvent>) {
    let CompletionJob {
        stream: stream_id,
        adapter,
        history,
        settings,
    } = job;

    debug!(
        stream = stream_id,
        provider = adapter.name(),
        history_len = history.len(),
        "Starting completion request"
    );

    let opened = tokio::select! {
        biased;
        _ = scope.cancelled() => {
            deliver(&output, stream_id, NormalizedChunk::cancelled(0)).await;
            return;
        }
        opened = adapter.request_completion(scope.clone(), &history, &settings) => opened,
    };

    let mut chunks = match opened {
        Ok(chunks) => chunks,
        Err(Error::Cancelled) => {
            deliver(&output, stream_id, NormalizedChunk::cancelled(0)).await;
            return;
        }
        Err(e) => {
            warn!(stream = stream_id, error = %e, "Completion request failed");
            deliver(&output, stream_id, NormalizedChunk::failed(0, &e)).await;
            return;
        }
    };

    let mut last_id: Option<u64> = None;
    let next_id = |last: Option<u64>| last.map_or(0, |id| id + 1);

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                debug!(stream = stream_id, "Completion scope cancelled");
                deliver(&output, stream_id, NormalizedChunk::cancelled(next_id(last_id))).await;
                return;
            }
            item = chunks.next() => match item {
                Some(Ok(chunk)) => {
                    last_id = Some(last_id.map_or(chunk.id, |id| id.max(chunk.id)));
                    let terminal = chunk.error.is_some() || (chunk.is_final && chunk.ends_turn());
                    // A final chunk that still carries text leaves the turn open.
                    let held_open = chunk.is_final && !terminal;
                    if !deliver(&output, stream_id, chunk).await {
                        debug!(stream = stream_id, "Orchestrator queue closed");
                        return;
                    }
                    if terminal {
                        return;
                    }
                    if held_open {
                        debug!(stream = stream_id, "Final chunk carried content, closing with a terminal chunk");
                        deliver(&output, stream_id, NormalizedChunk::terminal(next_id(last_id))).await;
                        return;
                    }
                }
                Some(Err(Error::Cancelled)) => {
                    deliver(&output, stream_id, NormalizedChunk::cancelled(next_id(last_id))).await;
                    return;
                }
                Some(Err(e)) => {
                    warn!(stream = stream_id, error = %e, "Completion stream failed");
                    deliver(&output, stream_id, NormalizedChunk::failed(next_id(last_id), &e)).await;
                    return;
                }
                None => {
                    debug!(stream = stream_id, "Completion stream ended without a final chunk");
                    deliver(&output, stream_id, NormalizedChunk::terminal(next_id(last_id))).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkError;
    use crate::testing::{Script, ScriptedAdapter};
    use crate::turn::ToolCall;

    fn job(adapter: ScriptedAdapter, history: Vec<ConversationTurn>) -> CompletionJob {
        CompletionJob {
            stream: 7,
            adapter: Arc::new(adapter),
            history,
            settings: CompletionSettings::default(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<OrchestratorEvent>) -> Vec<NormalizedChunk> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            if let OrchestratorEvent::Chunk { stream, chunk } = event {
                assert_eq!(stream, 7);
                out.push(chunk);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_forwards_until_final() {
        let adapter = ScriptedAdapter::new().with_script(Script::chunks(vec![
            NormalizedChunk::content(0, "a"),
            NormalizedChunk::terminal(1),
            NormalizedChunk::content(2, "ignored"),
        ]));
        let (tx, rx) = mpsc::channel(16);
        get_completion(job(adapter, vec![ConversationTurn::user("hi")]), CancellationToken::new(), tx).await;

        let chunks = collect(rx).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_final);
    }

    #[tokio::test]
    async fn test_synthesizes_terminal_when_stream_ends() {
        let adapter = ScriptedAdapter::new()
            .with_script(Script::chunks(vec![NormalizedChunk::content(3, "a")]));
        let (tx, rx) = mpsc::channel(16);
        get_completion(job(adapter, vec![]), CancellationToken::new(), tx).await;

        let chunks = collect(rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].id, 4);
        assert!(chunks[1].is_final);
    }

    #[tokio::test]
    async fn test_final_chunk_with_content_is_followed_by_terminal() {
        let adapter = ScriptedAdapter::new().with_script(Script::chunks(vec![
            NormalizedChunk::content(0, "a"),
            NormalizedChunk::content(1, "b").with_final(),
            NormalizedChunk::content(2, "ignored"),
        ]));
        let (tx, rx) = mpsc::channel(16);
        get_completion(job(adapter, vec![]), CancellationToken::new(), tx).await;

        let chunks = collect(rx).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].id, 2);
        assert!(chunks[2].ends_turn());
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_hanging_stream() {
        let adapter = ScriptedAdapter::new()
            .with_script(Script::chunks(vec![NormalizedChunk::content(0, "Hel")]).then_hang());
        let (tx, rx) = mpsc::channel(16);
        let scope = CancellationToken::new();
        let task = tokio::spawn(get_completion(job(adapter, vec![]), scope.clone(), tx));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scope.cancel();
        task.await.unwrap();

        let chunks = collect(rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.iter().filter(|c| c.is_cancellation()).count(), 1);
        assert_eq!(chunks[1].id, 1);
    }

    #[tokio::test]
    async fn test_request_failure_becomes_error_chunk() {
        let adapter = ScriptedAdapter::new().with_script(Script::failing(Error::network("refused")));
        let (tx, rx) = mpsc::channel(16);
        get_completion(job(adapter, vec![]), CancellationToken::new(), tx).await;

        let chunks = collect(rx).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0].error, Some(ChunkError::Transport(_))));
    }

    #[tokio::test]
    async fn test_resume_requires_tool_results() {
        let adapter = ScriptedAdapter::new().with_script(Script::chunks(vec![NormalizedChunk::terminal(0)]));
        let pending = ConversationTurn::assistant("").with_tool_calls(vec![ToolCall::new(
            "c1",
            "clock",
            serde_json::json!({}),
        )]);
        let (tx, rx) = mpsc::channel(16);
        resume_completion(job(adapter, vec![pending]), CancellationToken::new(), tx).await;

        let chunks = collect(rx).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].error.is_some());
    }
}
