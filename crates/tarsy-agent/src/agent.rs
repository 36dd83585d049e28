//! The agent (C10): binds an LLM provider, an MCP client scoped to a
//! session's stage, a composed prompt, and an iteration strategy together
//! behind one `process` entry point. The orchestrator constructs a fresh
//! `Agent` per stage; strategies themselves stay stateless across calls.

use std::sync::Arc;

use tarsy_core::clock::now_us;
use tarsy_core::types::{IterationStrategyKind, LlmInteraction, Message};
use tarsy_core::{HistoryRepository, Result};
use tarsy_llm::{LlmClient, LlmGenerateResult};
use tarsy_mcp::McpClient;

use crate::context::{IterationContext, IterationOutcome};
use crate::strategy::RunIterationStrategy;

const DEFAULT_MAX_ITERATIONS: u32 = 20;

pub struct Agent {
    pub agent_name: String,
    pub model: String,
    pub system_prompt: String,
    pub strategy: IterationStrategyKind,
    pub max_iterations: u32,
    pub llm_client: Arc<LlmClient>,
    pub mcp_client: Arc<McpClient>,
    pub history: Arc<dyn HistoryRepository>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_name: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        strategy: IterationStrategyKind,
        llm_client: Arc<LlmClient>,
        mcp_client: Arc<McpClient>,
        history: Arc<dyn HistoryRepository>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            strategy,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            llm_client,
            mcp_client,
            history,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub async fn process(&self, context: IterationContext) -> Result<IterationOutcome> {
        let strategy = self.strategy;
        strategy.run(self, context).await
    }

    /// Persists one LLM request/response pair against a stage execution.
    /// Every iteration controller calls this after each `generate()`, not
    /// just `continue_chat` — otherwise a paused-and-resumed or continued
    /// session has no conversation history to rebuild from.
    pub async fn record_llm_interaction(
        &self,
        context: &IterationContext,
        conversation: Vec<Message>,
        result: &LlmGenerateResult,
        started_at_us: i64,
    ) -> Result<()> {
        self.history
            .put_llm_interaction(LlmInteraction {
                interaction_id: result.interaction_id.clone(),
                session_id: context.session_id.clone(),
                stage_execution_id: Some(context.stage_execution_id.clone()),
                provider: self.llm_client.provider_name().to_string(),
                model: self.model.clone(),
                conversation,
                response: Some(result.text.clone()),
                usage: result.usage,
                started_at_us,
                completed_at_us: Some(now_us()),
            })
            .await
    }
}
