//! Test-only fakes shared by the iteration controllers' unit tests: a no-op
//! `LlmProvider` and the plumbing to build a real `Agent` around it without
//! any network or subprocess I/O.

use std::sync::{Arc, Mutex};

use tarsy_core::event_bus::EventBus;
use tarsy_core::history::InMemoryHistoryRepository;
use tarsy_core::types::{Alert, IterationStrategyKind, SessionId};
use tarsy_llm::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use tarsy_llm::types::{LlmRequest, StreamDelta};
use tarsy_llm::LlmClient;
use tarsy_mcp::{McpClient, McpServerRegistry};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::context::{IterationContext, ToolWithServer};

struct FakeProvider;

#[async_trait::async_trait]
impl LlmProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn models(&self) -> &[&str] {
        &["fake-model"]
    }

    async fn complete_stream(&self, _request: LlmRequest, _cancel: Option<CancellationToken>) -> LlmResult<LlmStream> {
        Err(LlmError::RequestFailed("fake provider is not wired to produce completions".into()))
    }
}

/// Replays a fixed script of full-text completions, one per call, so a
/// controller's multi-turn loop can be driven deterministically without any
/// network I/O. Panics if called more times than the script provides for —
/// a test asserting on an exact iteration count should fail loudly, not hang.
struct ScriptedProvider {
    responses: Mutex<std::collections::VecDeque<String>>,
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn models(&self) -> &[&str] {
        &["fake-model"]
    }

    async fn complete_stream(&self, _request: LlmRequest, _cancel: Option<CancellationToken>) -> LlmResult<LlmStream> {
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted provider ran out of canned responses");
        let items = vec![
            Ok(StreamDelta::Text(text)),
            Ok(StreamDelta::Done { stop_reason: Some("stop".to_string()), usage: None }),
        ];
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

fn build_agent(provider: Arc<dyn LlmProvider>, strategy: IterationStrategyKind) -> Agent {
    let event_bus = Arc::new(EventBus::new());
    let history: Arc<dyn tarsy_core::HistoryRepository> = Arc::new(InMemoryHistoryRepository::new());
    let llm_client = Arc::new(LlmClient::new(provider, event_bus.clone()));
    let mcp_client = Arc::new(McpClient::new(
        Arc::new(McpServerRegistry::new()),
        event_bus,
        history.clone(),
        None,
    ));
    Agent::new(
        "triage-agent",
        "fake-model",
        "You are the kubernetes triage agent.",
        strategy,
        llm_client,
        mcp_client,
        history,
    )
}

pub fn fake_agent(strategy: IterationStrategyKind) -> Agent {
    build_agent(Arc::new(FakeProvider), strategy)
}

/// An agent whose LLM calls replay `responses` in order, one full-text
/// completion per call.
pub fn scripted_agent(strategy: IterationStrategyKind, responses: Vec<&str>) -> Agent {
    let provider = ScriptedProvider {
        responses: Mutex::new(responses.into_iter().map(String::from).collect()),
    };
    build_agent(Arc::new(provider), strategy)
}

pub fn fake_context(_agent: &Agent, tools: Vec<ToolWithServer>) -> IterationContext {
    IterationContext {
        alert: Alert {
            alert_type: "pod_crash_loop".to_string(),
            runbook: None,
            data: serde_json::json!({ "namespace": "default" }),
            mcp_selection: None,
        },
        runbook: None,
        tools,
        session_id: SessionId::new("test-session"),
        stage_execution_id: "stage-1".to_string(),
        stage_attributed_data: Vec::new(),
        mcp_selection: None,
        cancel: CancellationToken::new(),
        start_iteration: 1,
        resume_conversation: None,
    }
}
