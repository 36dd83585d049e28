//! The client every iteration controller calls through: wraps a provider
//! with streaming-chunk publication to the event bus, stream-type
//! classification, thought-signature threading, and the native-thinking
//! empty-response retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tarsy_core::{
    clock::new_id, EventBus, SessionId, StreamType, TokenUsage, ToolCall,
    event_bus::EventPayload,
};
use tokio_util::sync::CancellationToken;

use crate::provider::{LlmError, LlmProvider, LlmResult};
use crate::types::{AccumulatedToolCall, LlmRequest, StreamDelta};

const NATIVE_THINKING_EMPTY_RETRIES: u32 = 3;
const NATIVE_THINKING_RETRY_BACKOFF: Duration = Duration::from_secs(3);

pub struct LlmGenerateResult {
    /// Same id the streamed chunks for this call carry as
    /// `llm_interaction_id`; callers persisting an `LlmInteraction` row
    /// should reuse it as `interaction_id` so the two can be correlated.
    pub interaction_id: String,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub thought_signature: Option<String>,
    pub usage: Option<TokenUsage>,
}

pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    event_bus: Arc<EventBus>,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, event_bus: Arc<EventBus>) -> Self {
        Self { provider, event_bus }
    }

    fn is_native_thinking(&self) -> bool {
        self.provider.name() == "google"
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Streams one completion, publishing each text/thinking chunk to the
    /// session's event channel as it arrives, and returns the accumulated
    /// result once the stream ends. For the native-thinking provider, an
    /// empty response (no text, no tool calls) is retried rather than
    /// surfaced, since empty completions there are a known transient quirk
    /// rather than a real failure.
    pub async fn generate(
        &self,
        request: LlmRequest,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmGenerateResult> {
        self.generate_tagged(request, session_id, stage_execution_id, cancel, None).await
    }

    /// Like [`generate`](Self::generate), but every text chunk is published
    /// as `StreamType::Summarization` rather than classified by scanning for
    /// `Final Answer:` — used for tool-result summarisation calls, which
    /// aren't ReAct turns and would otherwise misclassify as THOUGHT.
    pub async fn summarize(
        &self,
        request: LlmRequest,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        mcp_event_id: Option<&str>,
    ) -> LlmResult<LlmGenerateResult> {
        self.generate_tagged(
            request,
            session_id,
            stage_execution_id,
            None,
            Some((StreamType::Summarization, mcp_event_id)),
        )
        .await
    }

    async fn generate_tagged(
        &self,
        request: LlmRequest,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        cancel: Option<CancellationToken>,
        forced: Option<(StreamType, Option<&str>)>,
    ) -> LlmResult<LlmGenerateResult> {
        let max_attempts = if self.is_native_thinking() {
            NATIVE_THINKING_EMPTY_RETRIES
        } else {
            1
        };

        let mut last_err = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(NATIVE_THINKING_RETRY_BACKOFF).await;
            }
            match self
                .generate_once(request.clone(), session_id, stage_execution_id, cancel.clone(), forced)
                .await
            {
                Ok(result) if result.text.is_empty() && result.tool_calls.is_empty() && self.is_native_thinking() => {
                    last_err = Some(LlmError::Empty);
                    continue;
                }
                Ok(result) => return Ok(result),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(LlmError::Empty))
    }

    async fn generate_once(
        &self,
        request: LlmRequest,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        cancel: Option<CancellationToken>,
        forced: Option<(StreamType, Option<&str>)>,
    ) -> LlmResult<LlmGenerateResult> {
        let mut stream = self.provider.complete_stream(request, cancel).await?;

        let llm_interaction_id = new_id();
        let mut text = String::new();
        let mut thought_signature = None;
        let mut usage = None;
        let mut tool_calls: Vec<AccumulatedToolCall> = Vec::new();
        let mut tool_index: HashMap<String, usize> = HashMap::new();
        let mut seen_final_answer = false;

        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::Text(chunk) => {
                    text.push_str(&chunk);
                    let stream_type = match forced {
                        Some((forced_type, _)) => forced_type,
                        None => {
                            if !seen_final_answer && text.to_ascii_lowercase().contains("final answer") {
                                seen_final_answer = true;
                            }
                            if seen_final_answer {
                                StreamType::FinalAnswer
                            } else {
                                StreamType::Thought
                            }
                        }
                    };
                    self.publish_chunk(
                        session_id,
                        stage_execution_id,
                        &llm_interaction_id,
                        stream_type,
                        &chunk,
                        false,
                        forced.and_then(|(_, mcp_event_id)| mcp_event_id),
                    )
                    .await;
                }
                StreamDelta::Thinking(chunk) => {
                    self.publish_chunk(
                        session_id,
                        stage_execution_id,
                        &llm_interaction_id,
                        StreamType::NativeThinking,
                        &chunk,
                        false,
                        None,
                    )
                    .await;
                }
                StreamDelta::ToolCallStart { id, name } => {
                    tool_index.insert(id.clone(), tool_calls.len());
                    tool_calls.push(AccumulatedToolCall { id, name, arguments: String::new() });
                }
                StreamDelta::ToolCallDelta { id, arguments } => {
                    if let Some(&idx) = tool_index.get(&id) {
                        tool_calls[idx].arguments.push_str(&arguments);
                    }
                }
                StreamDelta::ToolCallEnd { .. } => {}
                StreamDelta::ThoughtSignature(sig) => {
                    thought_signature = Some(sig);
                }
                StreamDelta::Done { usage: done_usage, .. } => {
                    usage = done_usage;
                }
                StreamDelta::Error(message) => {
                    return Err(LlmError::StreamError(message));
                }
            }
        }

        let final_stream_type = forced.map(|(t, _)| t).unwrap_or(if seen_final_answer {
            StreamType::FinalAnswer
        } else {
            StreamType::Thought
        });
        self.publish_chunk(
            session_id,
            stage_execution_id,
            &llm_interaction_id,
            final_stream_type,
            "",
            true,
            forced.and_then(|(_, mcp_event_id)| mcp_event_id),
        )
        .await;

        Ok(LlmGenerateResult {
            interaction_id: llm_interaction_id,
            text,
            tool_calls: tool_calls
                .into_iter()
                .map(|t| ToolCall { id: t.id, name: t.name, arguments: t.arguments })
                .collect(),
            thought_signature,
            usage: usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_chunk(
        &self,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        llm_interaction_id: &str,
        stream_type: StreamType,
        text: &str,
        is_complete: bool,
        mcp_event_id: Option<&str>,
    ) {
        self.event_bus
            .publish(
                session_id,
                EventPayload::LlmChunk {
                    stage_execution_id: stage_execution_id.unwrap_or_default().to_string(),
                    llm_interaction_id: llm_interaction_id.to_string(),
                    stream_type: format!("{stream_type:?}"),
                    text: text.to_string(),
                    is_complete,
                    mcp_event_id: mcp_event_id.map(|s| s.to_string()),
                    parallel_metadata: None,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_core::SessionId;

    struct SplitFinalAnswerProvider;

    #[async_trait::async_trait]
    impl LlmProvider for SplitFinalAnswerProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn models(&self) -> &[&str] {
            &["fake-model"]
        }

        async fn complete_stream(
            &self,
            _request: LlmRequest,
            _cancel: Option<CancellationToken>,
        ) -> LlmResult<crate::provider::LlmStream> {
            let items = vec![
                Ok(StreamDelta::Text("Thought: looks fine\nFinal ".to_string())),
                Ok(StreamDelta::Text("Answer: the cluster is healthy".to_string())),
                Ok(StreamDelta::Done { stop_reason: Some("stop".to_string()), usage: None }),
            ];
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// A chunk carrying only the back half of "Final Answer:" must still be
    /// classified as the final answer — the split happened mid-phrase, the
    /// accumulated text already contains it.
    #[tokio::test]
    async fn a_final_answer_split_across_streamed_chunks_is_still_classified_correctly() {
        let event_bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("split-test");
        let mut rx = event_bus.subscribe_session(&session_id);

        let client = LlmClient::new(Arc::new(SplitFinalAnswerProvider), event_bus);
        let request = LlmRequest { model: "fake-model".to_string(), ..Default::default() };
        client
            .generate(request, &session_id, Some("stage-1"), None)
            .await
            .unwrap();

        let mut stream_types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::LlmChunk { stream_type, .. } = event.payload {
                stream_types.push(stream_type);
            }
        }

        assert_eq!(stream_types[0], "Thought");
        assert_eq!(stream_types[1], "FinalAnswer");
    }
}
