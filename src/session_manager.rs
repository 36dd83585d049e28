//! Session manager (C12): submission/admission/dedup, a concurrency gate,
//! wall-clock timeouts, pod ownership with orphan recovery, pause/resume,
//! cooperative cancellation, and chat continuation.
//!
//! Grounded on the teacher's `ConsciousnessLoop` (`agenticlaw-agent/src/queue.rs`):
//! one cancellation token per in-flight unit of work, a background task per
//! session rather than a shared event loop (sessions don't preempt each
//! other the way human messages preempt tool calls there, so the single
//! consumer loop collapses to "spawn a task, track its token").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tarsy_core::clock::{new_id, now_us};
use tarsy_core::event_bus::EventPayload;
use tarsy_core::types::{Alert, AlertKey, Message, PauseMetadata, Session, SessionId, SessionStatus};
use tarsy_core::{Error, EventBus, HistoryRepository, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProviderEntry;
use crate::orchestrator::{ChainOutcome, ChainRegistry, ChainRunner, ResumePoint};

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(600);
const ORPHAN_THRESHOLD: Duration = Duration::from_secs(60);
const POD_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

fn session_status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Pending => "PENDING",
        SessionStatus::InProgress => "IN_PROGRESS",
        SessionStatus::Paused => "PAUSED",
        SessionStatus::Completed => "COMPLETED",
        SessionStatus::Failed => "FAILED",
        SessionStatus::Cancelled => "CANCELLED",
        SessionStatus::TimedOut => "TIMED_OUT",
    }
}

pub struct SubmitResult {
    pub session_id: SessionId,
}

pub struct SessionManager {
    pod_id: String,
    history: Arc<dyn HistoryRepository>,
    event_bus: Arc<EventBus>,
    chain_registry: Arc<ChainRegistry>,
    chain_runner: Arc<ChainRunner>,
    providers: Arc<HashMap<String, ProviderEntry>>,
    default_provider: String,
    semaphore: Arc<Semaphore>,
    in_flight_keys: Mutex<HashSet<AlertKey>>,
    cancellations: Mutex<HashMap<SessionId, CancellationToken>>,
    session_timeout: Duration,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        history: Arc<dyn HistoryRepository>,
        event_bus: Arc<EventBus>,
        chain_registry: Arc<ChainRegistry>,
        chain_runner: Arc<ChainRunner>,
        providers: Arc<HashMap<String, ProviderEntry>>,
        default_provider: String,
        max_concurrent_alerts: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            pod_id: new_id(),
            history,
            event_bus,
            chain_registry,
            chain_runner,
            providers,
            default_provider,
            semaphore: Arc::new(Semaphore::new(max_concurrent_alerts)),
            in_flight_keys: Mutex::new(HashSet::new()),
            cancellations: Mutex::new(HashMap::new()),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        })
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Marks IN_PROGRESS/PAUSED sessions owned by a different (presumably
    /// dead) pod whose `updated_at_us` has gone stale as FAILED. Run once at
    /// startup before accepting new submissions.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let threshold_us = now_us() - ORPHAN_THRESHOLD.as_micros() as i64;
        let mut recovered = 0;
        for mut session in self.history.list_sessions().await? {
            let is_active = matches!(session.status, SessionStatus::InProgress | SessionStatus::Paused);
            let owned_elsewhere = session.pod_owner.as_deref().is_some_and(|p| p != self.pod_id);
            let stale = session.updated_at_us < threshold_us;
            if is_active && owned_elsewhere && stale {
                session.status = SessionStatus::Failed;
                session.pause_metadata = None;
                session.error_message = Some("orphaned: previous worker lost".to_string());
                session.completed_at_us = Some(now_us());
                session.updated_at_us = now_us();
                let session_id = session.session_id.clone();
                self.history.put_session(session).await?;
                self.event_bus
                    .publish(&session_id, EventPayload::SessionStatusChanged { status: "FAILED".to_string() })
                    .await;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(count = recovered, "recovered orphaned sessions from a previous worker");
        }
        Ok(recovered)
    }

    /// Admits an alert for processing: dedups by fingerprint, resolves a
    /// chain, creates the session record, and spawns the background task
    /// that actually runs the chain.
    pub async fn submit(self: &Arc<Self>, alert: Alert) -> Result<SubmitResult> {
        let alert_key = AlertKey::derive(&alert);

        {
            let mut keys = self.in_flight_keys.lock().await;
            if keys.contains(&alert_key) {
                return Err(Error::duplicate("an equivalent alert is already being processed"));
            }
            keys.insert(alert_key.clone());
        }

        let chain = match self.chain_registry.resolve(&alert.alert_type) {
            Some(chain) => chain.clone(),
            None => {
                self.in_flight_keys.lock().await.remove(&alert_key);
                return Err(Error::no_chain(&alert.alert_type));
            }
        };

        let session_id = SessionId::generate();
        let now = now_us();
        let session = Session {
            session_id: session_id.clone(),
            alert_key,
            alert_type: alert.alert_type.clone(),
            chain_id: chain.chain_id.clone(),
            status: SessionStatus::Pending,
            pause_metadata: None,
            pod_owner: None,
            created_at_us: now,
            updated_at_us: now,
            completed_at_us: None,
            final_analysis: None,
            error_message: None,
        };
        self.history.put_session(session).await?;
        self.event_bus
            .publish(&session_id, EventPayload::SessionStatusChanged { status: "PENDING".to_string() })
            .await;

        let cancel = CancellationToken::new();
        self.cancellations.lock().await.insert(session_id.clone(), cancel.clone());

        let manager = self.clone();
        let session_id_for_task = session_id.clone();
        tokio::spawn(async move {
            manager.process(session_id_for_task, alert, chain, cancel, None).await;
        });

        Ok(SubmitResult { session_id })
    }

    async fn process(
        self: Arc<Self>,
        session_id: SessionId,
        alert: Alert,
        chain: tarsy_core::types::ChainDefinition,
        cancel: CancellationToken,
        resume_from: Option<ResumePoint>,
    ) {
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        if let Err(e) = self.mark_in_progress(&session_id).await {
            warn!(session = %session_id, error = %e, "failed marking session in-progress");
        }

        let refresh_handle = self.spawn_pod_refresher(session_id.clone());

        let run = self.chain_runner.run(&session_id, &alert, &chain, &cancel, resume_from);
        let outcome = tokio::time::timeout(self.session_timeout, run).await;

        refresh_handle.abort();

        match outcome {
            Ok(Ok(ChainOutcome::Completed { final_analysis })) => {
                self.finish(&session_id, SessionStatus::Completed, Some(final_analysis), None).await;
            }
            Ok(Ok(ChainOutcome::Paused { stage_index, reason, current_iteration })) => {
                self.pause(&session_id, stage_index, reason, current_iteration).await;
            }
            Ok(Ok(ChainOutcome::Cancelled { .. })) => {
                self.finish(&session_id, SessionStatus::Cancelled, None, None).await;
            }
            Ok(Err(e)) => {
                self.finish(&session_id, SessionStatus::Failed, None, Some(e.message)).await;
            }
            Err(_) => {
                cancel.cancel();
                self.finish(
                    &session_id,
                    SessionStatus::TimedOut,
                    None,
                    Some(format!("session exceeded its {}s wall-clock budget", self.session_timeout.as_secs())),
                )
                .await;
            }
        }

        self.cancellations.lock().await.remove(&session_id);
        if let Ok(Some(session)) = self.history.get_session(&session_id).await {
            self.in_flight_keys.lock().await.remove(&session.alert_key);
        }
    }

    async fn mark_in_progress(&self, session_id: &SessionId) -> Result<()> {
        if let Some(mut session) = self.history.get_session(session_id).await? {
            session.status = SessionStatus::InProgress;
            session.pod_owner = Some(self.pod_id.clone());
            session.updated_at_us = now_us();
            self.history.put_session(session).await?;
            self.event_bus
                .publish(session_id, EventPayload::SessionStatusChanged { status: "IN_PROGRESS".to_string() })
                .await;
        }
        Ok(())
    }

    fn spawn_pod_refresher(&self, session_id: SessionId) -> tokio::task::JoinHandle<()> {
        let history = self.history.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(POD_REFRESH_INTERVAL).await;
                if let Ok(Some(mut session)) = history.get_session(&session_id).await {
                    session.updated_at_us = now_us();
                    let _ = history.put_session(session).await;
                }
            }
        })
    }

    async fn finish(&self, session_id: &SessionId, status: SessionStatus, final_analysis: Option<String>, error_message: Option<String>) {
        if let Ok(Some(mut session)) = self.history.get_session(session_id).await {
            session.status = status;
            session.pause_metadata = None;
            session.final_analysis = final_analysis;
            session.error_message = error_message;
            session.updated_at_us = now_us();
            session.completed_at_us = Some(now_us());
            let _ = self.history.put_session(session).await;
            self.event_bus
                .publish(session_id, EventPayload::SessionStatusChanged { status: session_status_label(status).to_string() })
                .await;
        }
    }

    async fn pause(&self, session_id: &SessionId, stage_index: u32, reason: String, current_iteration: u32) {
        if let Ok(Some(mut session)) = self.history.get_session(session_id).await {
            session.status = SessionStatus::Paused;
            session.pause_metadata = Some(PauseMetadata {
                stage_index,
                iteration: current_iteration,
                paused_at_us: now_us(),
                reason,
            });
            session.updated_at_us = now_us();
            let _ = self.history.put_session(session).await;
            self.event_bus
                .publish(session_id, EventPayload::SessionStatusChanged { status: "PAUSED".to_string() })
                .await;
        }
    }

    /// Requests cooperative cancellation of an in-flight session. A no-op if
    /// the session isn't currently being processed by this pod.
    pub async fn cancel(&self, session_id: &SessionId) {
        self.event_bus.request_cancellation(session_id).await;
        if let Some(token) = self.cancellations.lock().await.get(session_id) {
            token.cancel();
        }
    }

    /// Resumes a paused session from its last recorded iteration: stages
    /// before the paused one are skipped entirely (their output is replayed
    /// from the persisted `StageExecution` rows, not re-run), and the paused
    /// stage itself continues from its recorded iteration against the
    /// conversation its last LLM interaction left off at, rather than
    /// restarting that stage's prompt from scratch.
    pub async fn resume(self: &Arc<Self>, session_id: SessionId, alert: Alert) -> Result<()> {
        let mut session = self
            .history
            .get_session(&session_id)
            .await?
            .ok_or_else(|| Error::internal("cannot resume a session that does not exist"))?;
        if session.status != SessionStatus::Paused {
            return Err(Error::configuration("only a paused session can be resumed"));
        }
        let pause_metadata = session
            .pause_metadata
            .clone()
            .ok_or_else(|| Error::internal("a paused session must carry pause metadata"))?;
        let chain = self
            .chain_registry
            .resolve(&session.alert_type)
            .cloned()
            .ok_or_else(|| Error::no_chain(&session.alert_type))?;

        session.status = SessionStatus::InProgress;
        session.pause_metadata = None;
        session.updated_at_us = now_us();
        self.history.put_session(session).await?;

        let cancel = CancellationToken::new();
        self.cancellations.lock().await.insert(session_id.clone(), cancel.clone());

        let resume_from = ResumePoint {
            stage_index: pause_metadata.stage_index,
            current_iteration: pause_metadata.iteration,
        };

        let manager = self.clone();
        tokio::spawn(async move {
            manager.process(session_id, alert, chain, cancel, Some(resume_from)).await;
        });
        Ok(())
    }

    /// Appends `message` to the conversation of a terminal, chat-enabled
    /// session's chain and issues one LLM call, returning the reply text.
    pub async fn continue_chat(&self, session_id: &SessionId, message: String) -> Result<String> {
        let session = self
            .history
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::internal("unknown session"))?;
        if !session.status.is_terminal() {
            return Err(Error::configuration("chat continuation requires a terminal session"));
        }
        let chain = self
            .chain_registry
            .resolve(&session.alert_type)
            .ok_or_else(|| Error::no_chain(&session.alert_type))?;
        if !chain.chat_enabled {
            return Err(Error::configuration("this chain does not allow chat continuation"));
        }

        let stages = self.history.stages_for_session(session_id).await?;
        let last_stage = stages
            .iter()
            .max_by_key(|s| s.stage_index)
            .ok_or_else(|| Error::internal("a terminal session has no stage executions"))?;
        let mut conversation = self
            .history
            .llm_interactions_for_stage(&last_stage.stage_execution_id)
            .await?
            .into_iter()
            .max_by_key(|i| i.started_at_us)
            .map(|i| i.conversation)
            .unwrap_or_default();
        conversation.push(Message::user(message));

        let provider_id = chain.llm_provider.as_deref().unwrap_or(&self.default_provider);
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| Error::configuration(format!("llm provider '{provider_id}' is not configured")))?;

        let request = tarsy_llm::LlmRequest {
            model: provider.model.clone(),
            messages: conversation.clone(),
            ..Default::default()
        };
        let result = provider
            .client
            .generate(request, session_id, Some(&last_stage.stage_execution_id), None)
            .await
            .map_err(|e| Error::internal(e.to_string()))?;

        self.history
            .put_llm_interaction(tarsy_core::types::LlmInteraction {
                interaction_id: new_id(),
                session_id: session_id.clone(),
                stage_execution_id: Some(last_stage.stage_execution_id.clone()),
                provider: provider_id.to_string(),
                model: provider.model.clone(),
                conversation: {
                    let mut full = conversation;
                    full.push(Message::assistant(result.text.clone()));
                    full
                },
                response: Some(result.text.clone()),
                usage: result.usage,
                started_at_us: now_us(),
                completed_at_us: Some(now_us()),
            })
            .await?;

        Ok(result.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tarsy_core::types::{ChainDefinition, StageDefinition};
    use tarsy_core::{EventBus, InMemoryHistoryRepository};
    use tarsy_llm::{AnthropicProvider, LlmClient};
    use tarsy_mcp::McpServerRegistry;

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

    fn build_manager() -> Arc<SessionManager> {
        let history: Arc<dyn HistoryRepository> = Arc::new(InMemoryHistoryRepository::new());
        let event_bus = Arc::new(EventBus::new());
        let registry = Arc::new(crate::orchestrator::ChainRegistry::new(vec![sample_chain()]));
        let mcp_registry = Arc::new(McpServerRegistry::new());
        let mut providers = HashMap::new();
        let client = Arc::new(LlmClient::new(Arc::new(AnthropicProvider::new("test-key")), event_bus.clone()));
        providers.insert("default".to_string(), ProviderEntry { client, model: "claude-sonnet-4".to_string() });
        let runner = Arc::new(ChainRunner::new(
            mcp_registry,
            Arc::new(providers.clone()),
            "default".to_string(),
            history.clone(),
            event_bus.clone(),
        ));
        SessionManager::new(history, event_bus, registry, runner, Arc::new(providers), "default".to_string(), 4)
    }

    #[tokio::test]
    async fn submitting_an_unroutable_alert_type_is_rejected() {
        let manager = build_manager();
        let alert = Alert { alert_type: "no-such-type".to_string(), runbook: None, data: serde_json::json!({}), mcp_selection: None };
        let err = manager.submit(alert).await.unwrap_err();
        assert_eq!(err.kind, tarsy_core::ErrorKind::NoChain);
    }

    #[tokio::test]
    async fn a_second_submission_of_the_same_alert_while_in_flight_is_rejected() {
        let manager = build_manager();
        let alert = Alert { alert_type: "kubernetes".to_string(), runbook: None, data: serde_json::json!({"pod": "a"}), mcp_selection: None };
        let first = manager.submit(alert.clone()).await;
        assert!(first.is_ok());
        let second = manager.submit(alert).await;
        assert_eq!(second.unwrap_err().kind, tarsy_core::ErrorKind::Duplicate);
    }
}
