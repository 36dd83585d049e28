//! Storage interface for sessions, stage executions, and interactions.
//!
//! Grounded on the teacher's `SessionRegistry` (`DashMap`-backed registry
//! pattern in `agenticlaw-agent/src/session.rs`), adapted from a session-log
//! store to the structured records this engine persists.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::types::{LlmInteraction, McpInteraction, Session, SessionId, StageExecution};

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn put_session(&self, session: Session) -> Result<()>;
    async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>>;
    async fn sessions_by_pod(&self, pod_owner: &str) -> Result<Vec<Session>>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    async fn put_stage(&self, stage: StageExecution) -> Result<()>;
    async fn stages_for_session(&self, session_id: &SessionId) -> Result<Vec<StageExecution>>;

    async fn put_llm_interaction(&self, interaction: LlmInteraction) -> Result<()>;
    async fn llm_interactions_for_stage(&self, stage_execution_id: &str) -> Result<Vec<LlmInteraction>>;

    async fn put_mcp_interaction(&self, interaction: McpInteraction) -> Result<()>;
    async fn mcp_interactions_for_stage(&self, stage_execution_id: &str) -> Result<Vec<McpInteraction>>;
}

/// Reference implementation used in tests and as the default store when no
/// external history backend is configured.
#[derive(Default)]
pub struct InMemoryHistoryRepository {
    sessions: DashMap<SessionId, Session>,
    stages: DashMap<SessionId, Vec<StageExecution>>,
    llm_interactions: DashMap<String, Vec<LlmInteraction>>,
    mcp_interactions: DashMap<String, Vec<McpInteraction>>,
}

impl InMemoryHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryRepository for InMemoryHistoryRepository {
    async fn put_session(&self, session: Session) -> Result<()> {
        self.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|r| r.clone()))
    }

    async fn sessions_by_pod(&self, pod_owner: &str) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|r| r.pod_owner.as_deref() == Some(pod_owner))
            .map(|r| r.clone())
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.iter().map(|r| r.clone()).collect())
    }

    async fn put_stage(&self, stage: StageExecution) -> Result<()> {
        let mut entry = self.stages.entry(stage.session_id.clone()).or_default();
        if let Some(existing) = entry.iter_mut().find(|s| s.stage_index == stage.stage_index) {
            *existing = stage;
        } else {
            entry.push(stage);
        }
        Ok(())
    }

    async fn stages_for_session(&self, session_id: &SessionId) -> Result<Vec<StageExecution>> {
        Ok(self
            .stages
            .get(session_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn put_llm_interaction(&self, interaction: LlmInteraction) -> Result<()> {
        let key = interaction
            .stage_execution_id
            .clone()
            .unwrap_or_else(|| interaction.session_id.to_string());
        self.llm_interactions.entry(key).or_default().push(interaction);
        Ok(())
    }

    async fn llm_interactions_for_stage(&self, stage_execution_id: &str) -> Result<Vec<LlmInteraction>> {
        Ok(self
            .llm_interactions
            .get(stage_execution_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn put_mcp_interaction(&self, interaction: McpInteraction) -> Result<()> {
        let key = interaction
            .stage_execution_id
            .clone()
            .unwrap_or_else(|| interaction.session_id.to_string());
        self.mcp_interactions.entry(key).or_default().push(interaction);
        Ok(())
    }

    async fn mcp_interactions_for_stage(&self, stage_execution_id: &str) -> Result<Vec<McpInteraction>> {
        Ok(self
            .mcp_interactions
            .get(stage_execution_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertKey, SessionStatus};

    fn sample_session(id: &str) -> Session {
        Session {
            session_id: SessionId::new(id),
            alert_key: AlertKey::derive(&crate::types::Alert {
                alert_type: "test".into(),
                runbook: None,
                data: serde_json::json!({}),
                mcp_selection: None,
            }),
            alert_type: "test".into(),
            chain_id: "default".into(),
            status: SessionStatus::Pending,
            pause_metadata: None,
            pod_owner: Some("pod-a".into()),
            created_at_us: 0,
            updated_at_us: 0,
            completed_at_us: None,
            final_analysis: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn round_trips_a_session() {
        let repo = InMemoryHistoryRepository::new();
        let session = sample_session("s1");
        repo.put_session(session.clone()).await.unwrap();
        let fetched = repo.get_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(fetched.session_id, session.session_id);
    }

    #[tokio::test]
    async fn finds_sessions_owned_by_a_pod() {
        let repo = InMemoryHistoryRepository::new();
        repo.put_session(sample_session("s1")).await.unwrap();
        repo.put_session(sample_session("s2")).await.unwrap();
        let owned = repo.sessions_by_pod("pod-a").await.unwrap();
        assert_eq!(owned.len(), 2);
    }
}
