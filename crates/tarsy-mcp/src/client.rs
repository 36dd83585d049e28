//! MCP client (C5): `list_tools`/`call_tool` over the registry's transports,
//! with selection enforcement, masking, oversize-result summarisation, and
//! hook-context + history recording around every call.

use std::sync::Arc;

use dashmap::DashMap;
use tarsy_core::event_bus::EventPayload;
use tarsy_core::history::HistoryRepository;
use tarsy_core::types::{CommunicationType, McpInteraction, SessionId, ToolDefinition};
use tarsy_core::{clock::now_us, hooks::HookContext, EventBus, Error, Result};
use tarsy_llm::{LlmClient, LlmRequest};
use tarsy_masking::MaskingEngine;
use tracing::{info, warn};

use crate::registry::McpServerRegistry;
use crate::transport::StdioTransport;

/// Tool results larger than this are summarised by an LLM call rather than
/// sent verbatim into the conversation; a raw dump of a large `kubectl get`
/// output would otherwise dominate the context window.
const SUMMARIZE_THRESHOLD_CHARS: usize = 4000;

pub struct McpClient {
    registry: Arc<McpServerRegistry>,
    transports: DashMap<String, Arc<StdioTransport>>,
    masking_engines: DashMap<String, Arc<MaskingEngine>>,
    event_bus: Arc<EventBus>,
    history: Arc<dyn HistoryRepository>,
    summarizer: Option<Arc<LlmClient>>,
}

impl McpClient {
    pub fn new(
        registry: Arc<McpServerRegistry>,
        event_bus: Arc<EventBus>,
        history: Arc<dyn HistoryRepository>,
        summarizer: Option<Arc<LlmClient>>,
    ) -> Self {
        Self {
            registry,
            transports: DashMap::new(),
            masking_engines: DashMap::new(),
            event_bus,
            history,
            summarizer,
        }
    }

    /// Spawns every enabled server's transport. One server's process failing
    /// to start is logged and skipped rather than aborting the others — a
    /// stage can still make progress with a subset of its configured tools.
    pub async fn initialize(&self) {
        self.initialize_scoped(&self.registry.enabled_server_ids()).await;
    }

    /// Spawns only the named servers, skipping any not in the registry or
    /// not enabled. Used to scope a stage's MCP client to the servers its
    /// agent (or an explicit selection override) actually names.
    pub async fn initialize_scoped(&self, server_ids: &[String]) {
        for server_id in server_ids {
            let Some(config) = self.registry.get(server_id) else { continue };
            if !config.enabled {
                continue;
            }
            match StdioTransport::spawn(&config.transport).await {
                Ok(transport) => {
                    self.transports.insert(server_id.clone(), Arc::new(transport));
                    self.masking_engines
                        .insert(server_id.clone(), Arc::new(MaskingEngine::new(&config.masking)));
                    info!(server = %server_id, "mcp server started");
                }
                Err(e) => {
                    warn!(server = %server_id, error = %e, "mcp server failed to start, skipping");
                }
            }
        }
    }

    /// Terminates every transport this client spawned. Called from the
    /// orchestrator's guaranteed-release block at stage exit.
    pub async fn close(&self) {
        for entry in self.transports.iter() {
            entry.value().shutdown().await;
        }
    }

    fn enforce_selection(server: &str, mcp_selection: Option<&[String]>) -> Result<()> {
        match mcp_selection {
            Some(allowed) if !allowed.iter().any(|s| s == server) => Err(Error::selection_violation(format!(
                "server '{server}' is not in the alert's mcp_selection"
            ))),
            _ => Ok(()),
        }
    }

    pub async fn list_tools(
        &self,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        server: &str,
    ) -> Result<Vec<ToolDefinition>> {
        if let Some(cached) = self.registry.cached_tools(server) {
            return Ok(cached);
        }
        let transport = match self.transports.get(server).map(|r| r.clone()) {
            Some(t) => t,
            None => {
                return Err(Error::configuration(format!("no mcp server named '{server}' is running")));
            }
        };

        let hook = HookContext::enter(&self.event_bus, session_id.clone(), "mcp", "list_tools").await;
        let started_at_us = now_us();

        match transport.list_tools().await {
            Ok(tools) => {
                self.registry.cache_tools(server, tools.clone());
                self.history
                    .put_mcp_interaction(McpInteraction {
                        interaction_id: tarsy_core::clock::new_id(),
                        session_id: session_id.clone(),
                        stage_execution_id: stage_execution_id.map(|s| s.to_string()),
                        server_name: server.to_string(),
                        communication_type: CommunicationType::ToolList,
                        tool_name: None,
                        arguments: None,
                        result: Some(serde_json::to_value(&tools).unwrap_or(serde_json::Value::Null)),
                        masked: false,
                        error_message: None,
                        started_at_us,
                        completed_at_us: Some(now_us()),
                    })
                    .await?;
                hook.complete_success().await;
                Ok(tools)
            }
            Err(e) => {
                self.history
                    .put_mcp_interaction(McpInteraction {
                        interaction_id: tarsy_core::clock::new_id(),
                        session_id: session_id.clone(),
                        stage_execution_id: stage_execution_id.map(|s| s.to_string()),
                        server_name: server.to_string(),
                        communication_type: CommunicationType::ToolList,
                        tool_name: None,
                        arguments: None,
                        result: None,
                        masked: false,
                        error_message: Some(e.message.clone()),
                        started_at_us,
                        completed_at_us: Some(now_us()),
                    })
                    .await?;
                hook.complete_error(&e).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn call_tool(
        &self,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        mcp_selection: Option<&[String]>,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Self::enforce_selection(server, mcp_selection)?;

        let transport = self
            .transports
            .get(server)
            .map(|r| r.clone())
            .ok_or_else(|| Error::configuration(format!("no mcp server named '{server}' is running")))?;

        let hook = HookContext::enter(&self.event_bus, session_id.clone(), "mcp", "call_tool").await;
        let started_at_us = now_us();
        self.event_bus
            .publish(
                session_id,
                EventPayload::McpCallStarted { server: server.to_string(), tool: tool.to_string() },
            )
            .await;

        let result = transport.call_tool(tool, arguments.clone()).await;

        match result {
            Ok(raw_result) => {
                let was_masked;
                let masked = match self.masking_engines.get(server) {
                    Some(engine) => {
                        let masked_value = engine.mask_value(&raw_result);
                        was_masked = masked_value != raw_result;
                        masked_value
                    }
                    None => {
                        was_masked = false;
                        raw_result
                    }
                };
                let interaction_id = tarsy_core::clock::new_id();
                let final_result = self
                    .summarize_if_oversized(&masked, session_id, stage_execution_id, &interaction_id)
                    .await;

                self.history
                    .put_mcp_interaction(McpInteraction {
                        interaction_id,
                        session_id: session_id.clone(),
                        stage_execution_id: stage_execution_id.map(|s| s.to_string()),
                        server_name: server.to_string(),
                        communication_type: CommunicationType::ToolCall,
                        tool_name: Some(tool.to_string()),
                        arguments: Some(arguments),
                        result: Some(final_result.clone()),
                        masked: was_masked,
                        error_message: None,
                        started_at_us,
                        completed_at_us: Some(now_us()),
                    })
                    .await?;

                self.event_bus
                    .publish(
                        session_id,
                        EventPayload::McpCallFinished { server: server.to_string(), tool: tool.to_string(), ok: true },
                    )
                    .await;
                hook.complete_success().await;
                Ok(final_result)
            }
            Err(e) => {
                self.history
                    .put_mcp_interaction(McpInteraction {
                        interaction_id: tarsy_core::clock::new_id(),
                        session_id: session_id.clone(),
                        stage_execution_id: stage_execution_id.map(|s| s.to_string()),
                        server_name: server.to_string(),
                        communication_type: CommunicationType::ToolCall,
                        tool_name: Some(tool.to_string()),
                        arguments: Some(arguments),
                        result: None,
                        masked: false,
                        error_message: Some(e.message.clone()),
                        started_at_us,
                        completed_at_us: Some(now_us()),
                    })
                    .await?;
                hook.complete_error(&e).await;
                Err(e)
            }
        }
    }

    async fn summarize_if_oversized(
        &self,
        value: &serde_json::Value,
        session_id: &SessionId,
        stage_execution_id: Option<&str>,
        mcp_event_id: &str,
    ) -> serde_json::Value {
        let Some(summarizer) = &self.summarizer else { return value.clone() };
        let serialized = value.to_string();
        if serialized.len() <= SUMMARIZE_THRESHOLD_CHARS {
            return value.clone();
        }

        let request = LlmRequest {
            system: Some(
                "Summarize the following tool output, preserving any values relevant to diagnosing an infrastructure alert."
                    .to_string(),
            ),
            messages: vec![tarsy_core::Message::user(serialized.clone())],
            ..Default::default()
        };

        match summarizer.summarize(request, session_id, stage_execution_id, Some(mcp_event_id)).await {
            Ok(result) => serde_json::json!({ "summarized": true, "summary": result.text }),
            Err(e) => {
                warn!(error = %e, "tool result summarisation failed, returning raw (masked) result");
                value.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_violation_is_rejected() {
        let allowed = vec!["kubernetes".to_string()];
        assert!(McpClient::enforce_selection("kubernetes", Some(&allowed)).is_ok());
        assert!(McpClient::enforce_selection("github", Some(&allowed)).is_err());
        assert!(McpClient::enforce_selection("github", None).is_ok());
    }
}
