//! Chain registry and orchestrator (C11): resolves an alert type to a chain,
//! then runs that chain's stages in order, giving each stage its own
//! MCP client scoped to its configured servers and always closing that
//! client on the way out of the stage regardless of outcome.

use std::collections::HashMap;
use std::sync::Arc;

use tarsy_agent::{Agent, IterationContext, StageOutput, ToolWithServer};
use tarsy_core::event_bus::EventPayload;
use tarsy_core::types::{
    Alert, ChainDefinition, SessionId, StageExecution, StageStatus,
};
use tarsy_core::{clock::now_us, clock::new_id, EventBus, Error, HistoryRepository, Result};
use tarsy_mcp::McpClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents;
use crate::config::ProviderEntry;

/// Chains in registration order; first chain whose `alert_types` contains
/// the incoming alert type wins.
pub struct ChainRegistry {
    chains: Vec<ChainDefinition>,
}

impl ChainRegistry {
    pub fn new(chains: Vec<ChainDefinition>) -> Self {
        Self { chains }
    }

    pub fn resolve(&self, alert_type: &str) -> Option<&ChainDefinition> {
        self.chains.iter().find(|c| c.alert_types.iter().any(|t| t == alert_type))
    }
}

/// How a chain run finished, handed back to the session manager so it can
/// decide the session's final status.
#[derive(Debug)]
pub enum ChainOutcome {
    Completed { final_analysis: String },
    /// A stage hit `max_iterations` and is asking to be paused; the session
    /// manager records `pause_metadata` and does not mark the session failed.
    Paused { stage_index: u32, reason: String, current_iteration: u32 },
    Cancelled { stage_index: u32 },
}

/// Where a resumed run re-enters its chain: skip every stage before
/// `stage_index` (their recorded output is replayed from history) and
/// continue `stage_index` itself from `current_iteration`, picking its
/// conversation back up from the last LLM interaction persisted against it.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub stage_index: u32,
    pub current_iteration: u32,
}

pub struct ChainRunner {
    mcp_registry: Arc<tarsy_mcp::McpServerRegistry>,
    providers: Arc<HashMap<String, ProviderEntry>>,
    default_provider: String,
    history: Arc<dyn HistoryRepository>,
    event_bus: Arc<EventBus>,
}

impl ChainRunner {
    pub fn new(
        mcp_registry: Arc<tarsy_mcp::McpServerRegistry>,
        providers: Arc<HashMap<String, ProviderEntry>>,
        default_provider: String,
        history: Arc<dyn HistoryRepository>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self { mcp_registry, providers, default_provider, history, event_bus }
    }

    fn resolve_provider<'a>(
        &'a self,
        chain_default: Option<&str>,
        stage_override: Option<&str>,
    ) -> Result<&'a ProviderEntry> {
        let provider_id = stage_override
            .or(chain_default)
            .unwrap_or(&self.default_provider);
        self.providers
            .get(provider_id)
            .ok_or_else(|| Error::configuration(format!("llm provider '{provider_id}' is not configured")))
    }

    /// Runs every stage of `chain` in order against `alert`, returning the
    /// outcome that decides the session's final status. Never returns an
    /// `Err` for a single stage's failure — that is recorded against the
    /// stage and the chain continues (§4.2's partial-failure policy); `Err`
    /// is reserved for configuration problems that make the whole run
    /// impossible to attempt (e.g. an unknown provider).
    ///
    /// `resume_from`, when set, skips every stage before its `stage_index`
    /// entirely (their output is reconstructed from already-persisted
    /// `StageExecution` rows rather than re-run) and re-enters `stage_index`
    /// at `current_iteration`, against that stage's existing
    /// `stage_execution_id` and the conversation its last LLM interaction
    /// left off at.
    pub async fn run(
        &self,
        session_id: &SessionId,
        alert: &Alert,
        chain: &ChainDefinition,
        cancel: &CancellationToken,
        resume_from: Option<ResumePoint>,
    ) -> Result<ChainOutcome> {
        let mut stage_outputs: Vec<StageOutput> = Vec::new();
        let mut existing_stages: HashMap<u32, StageExecution> = HashMap::new();
        if let Some(resume) = &resume_from {
            for existing in self.history.stages_for_session(session_id).await? {
                existing_stages.insert(existing.stage_index, existing);
            }
            let mut prior: Vec<_> = existing_stages
                .values()
                .filter(|s| s.stage_index < resume.stage_index && s.status == StageStatus::Completed)
                .collect();
            prior.sort_by_key(|s| s.stage_index);
            for s in prior {
                if let Some(stage_def) = chain.stages.get(s.stage_index as usize) {
                    let output = s.output.as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    stage_outputs.push(StageOutput { stage_name: stage_def.name.clone(), output });
                }
            }
        }

        for (stage_index, stage) in chain.stages.iter().enumerate() {
            let stage_index = stage_index as u32;

            if let Some(resume) = &resume_from {
                if stage_index < resume.stage_index {
                    continue;
                }
            }

            if cancel.is_cancelled() {
                self.mark_remaining_cancelled(session_id, chain, stage_index).await;
                return Ok(ChainOutcome::Cancelled { stage_index });
            }

            let is_resumed_stage = resume_from.as_ref().is_some_and(|r| r.stage_index == stage_index);
            let (stage_execution_id, start_iteration, resume_conversation) = if is_resumed_stage {
                let stage_execution_id = existing_stages
                    .get(&stage_index)
                    .map(|s| s.stage_execution_id.clone())
                    .unwrap_or_else(new_id);
                let resume_conversation = self
                    .history
                    .llm_interactions_for_stage(&stage_execution_id)
                    .await?
                    .into_iter()
                    .max_by_key(|i| i.started_at_us)
                    .map(|i| i.conversation);
                (stage_execution_id, resume_from.as_ref().unwrap().current_iteration, resume_conversation)
            } else {
                (new_id(), 1, None)
            };

            let mut execution = StageExecution {
                stage_execution_id: stage_execution_id.clone(),
                session_id: session_id.clone(),
                stage_index,
                stage_name: stage.name.clone(),
                agent: stage.agent.clone(),
                status: StageStatus::Active,
                iteration_strategy: stage.iteration_strategy,
                output: None,
                error_message: None,
                started_at_us: Some(now_us()),
                completed_at_us: None,
                current_iteration: None,
            };
            self.history.put_stage(execution.clone()).await?;
            self.event_bus
                .publish(session_id, EventPayload::StageStatusChanged { stage_index, status: "ACTIVE".to_string() })
                .await;

            let provider = match self.resolve_provider(chain.llm_provider.as_deref(), stage.llm_provider.as_deref()) {
                Ok(p) => p,
                Err(e) => return Err(e),
            };

            let agent_spec = agents::lookup(&stage.agent);
            let (default_servers, custom_instructions) = match &agent_spec {
                Some(spec) => (spec.mcp_servers.clone(), spec.custom_instructions.to_string()),
                None => {
                    warn!(agent = %stage.agent, "unknown agent name, running with no default tools");
                    (Vec::new(), String::new())
                }
            };
            let effective_servers =
                if stage.mcp_servers.is_empty() { default_servers } else { stage.mcp_servers.clone() };

            let mcp_client = Arc::new(McpClient::new(
                self.mcp_registry.clone(),
                self.event_bus.clone(),
                self.history.clone(),
                Some(provider.client.clone()),
            ));
            mcp_client.initialize_scoped(&effective_servers).await;

            let mut tools = Vec::new();
            for server in &effective_servers {
                match mcp_client.list_tools(session_id, Some(&stage_execution_id), server).await {
                    Ok(defs) => tools.extend(defs.into_iter().map(|tool| ToolWithServer { server: server.clone(), tool })),
                    Err(e) => warn!(server = %server, error = %e, "failed listing tools for stage, continuing without them"),
                }
            }

            let agent = Agent::new(
                stage.agent.clone(),
                provider.model.clone(),
                custom_instructions,
                stage.iteration_strategy,
                provider.client.clone(),
                mcp_client.clone(),
                self.history.clone(),
            );

            let context = IterationContext {
                alert: alert.clone(),
                runbook: alert.runbook.clone(),
                tools,
                session_id: session_id.clone(),
                stage_execution_id: stage_execution_id.clone(),
                stage_attributed_data: stage_outputs.clone(),
                mcp_selection: alert.mcp_selection.clone(),
                cancel: cancel.clone(),
                start_iteration,
                resume_conversation,
            };

            let outcome = agent.process(context).await;
            mcp_client.close().await;

            match outcome {
                Ok(tarsy_agent::IterationOutcome::Completed { analysis }) => {
                    execution.status = StageStatus::Completed;
                    execution.output = Some(serde_json::Value::String(analysis.clone()));
                    execution.completed_at_us = Some(now_us());
                    self.history.put_stage(execution).await?;
                    self.event_bus
                        .publish(session_id, EventPayload::StageStatusChanged { stage_index, status: "COMPLETED".to_string() })
                        .await;
                    stage_outputs.push(StageOutput { stage_name: stage.name.clone(), output: analysis });
                }
                Ok(tarsy_agent::IterationOutcome::Paused { reason, current_iteration }) => {
                    execution.status = StageStatus::Paused;
                    execution.completed_at_us = Some(now_us());
                    execution.current_iteration = Some(current_iteration);
                    self.history.put_stage(execution).await?;
                    self.event_bus
                        .publish(session_id, EventPayload::StageStatusChanged { stage_index, status: "PAUSED".to_string() })
                        .await;
                    return Ok(ChainOutcome::Paused { stage_index, reason, current_iteration });
                }
                Err(e) if e.kind == tarsy_core::ErrorKind::Cancelled => {
                    execution.status = StageStatus::Failed;
                    execution.error_message = Some(e.message.clone());
                    execution.completed_at_us = Some(now_us());
                    self.history.put_stage(execution).await?;
                    self.mark_remaining_cancelled(session_id, chain, stage_index + 1).await;
                    return Ok(ChainOutcome::Cancelled { stage_index });
                }
                Err(e) => {
                    warn!(stage = %stage.name, error = %e, "stage failed, continuing chain with partial output");
                    execution.status = StageStatus::Failed;
                    execution.error_message = Some(e.message.clone());
                    execution.completed_at_us = Some(now_us());
                    self.history.put_stage(execution).await?;
                    self.event_bus
                        .publish(session_id, EventPayload::StageStatusChanged { stage_index, status: "FAILED".to_string() })
                        .await;
                    stage_outputs.push(StageOutput {
                        stage_name: stage.name.clone(),
                        output: format!("stage failed: {}", e.message),
                    });
                }
            }
        }

        let final_analysis = stage_outputs
            .last()
            .map(|s| s.output.clone())
            .unwrap_or_else(|| "no stage produced an analysis".to_string());
        info!(session = %session_id, "chain run finished");
        Ok(ChainOutcome::Completed { final_analysis })
    }

    async fn mark_remaining_cancelled(&self, session_id: &SessionId, chain: &ChainDefinition, from_index: u32) {
        for (stage_index, stage) in chain.stages.iter().enumerate().skip(from_index as usize) {
            let stage_index = stage_index as u32;
            let execution = StageExecution {
                stage_execution_id: new_id(),
                session_id: session_id.clone(),
                stage_index,
                stage_name: stage.name.clone(),
                agent: stage.agent.clone(),
                status: StageStatus::Failed,
                iteration_strategy: stage.iteration_strategy,
                output: None,
                error_message: Some("cancelled".to_string()),
                started_at_us: None,
                completed_at_us: Some(now_us()),
                current_iteration: None,
            };
            let _ = self.history.put_stage(execution).await;
            self.event_bus
                .publish(session_id, EventPayload::StageStatusChanged { stage_index, status: "CANCELLED".to_string() })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_core::types::StageDefinition;

    fn sample_chain() -> ChainDefinition {
        ChainDefinition {
            chain_id: "kubernetes-default".to_string(),
            alert_types: vec!["kubernetes".to_string()],
            chat_enabled: false,
            llm_provider: None,
            stages: vec![StageDefinition {
                name: "analyze".to_string(),
                agent: "base-agent".to_string(),
                iteration_strategy: tarsy_core::types::IterationStrategyKind::ReactFinalAnalysis,
                llm_provider: None,
                mcp_servers: vec![],
            }],
        }
    }

    #[test]
    fn resolves_a_chain_by_alert_type_first_match_wins() {
        let registry = ChainRegistry::new(vec![sample_chain()]);
        assert!(registry.resolve("kubernetes").is_some());
        assert!(registry.resolve("unknown-alert").is_none());
    }
}
