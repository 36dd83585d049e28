//! Domain entities for the Tarsy engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Session identifier - cheaply cloneable.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn generate() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An incoming alert as submitted to the session manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    pub runbook: Option<String>,
    pub data: serde_json::Value,
    #[serde(default)]
    pub mcp_selection: Option<Vec<String>>,
}

/// Fingerprint used for in-flight deduplication of alerts.
///
/// Two alerts that hash to the same key are treated as the same underlying
/// incident and the second submission is rejected with `ErrorKind::Duplicate`
/// rather than starting a second session.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AlertKey(String);

impl AlertKey {
    pub fn derive(alert: &Alert) -> Self {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        alert.alert_type.hash(&mut hasher);
        alert.runbook.hash(&mut hasher);
        canonical_json(&alert.data).hash(&mut hasher);
        Self(format!("{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Serializes a `Value` with map keys in sorted order, so semantically
/// identical alert payloads hash identically regardless of field order.
fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sort(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Cancelled
                | SessionStatus::TimedOut
        )
    }
}

/// Resumption state captured when a session is paused mid-stage.
///
/// Present if and only if `status == Paused`; the session manager enforces
/// this pairing on every transition rather than trusting callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PauseMetadata {
    pub stage_index: u32,
    pub iteration: u32,
    pub paused_at_us: i64,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub alert_key: AlertKey,
    pub alert_type: String,
    pub chain_id: String,
    pub status: SessionStatus,
    pub pause_metadata: Option<PauseMetadata>,
    pub pod_owner: Option<String>,
    pub created_at_us: i64,
    pub updated_at_us: i64,
    pub completed_at_us: Option<i64>,
    pub final_analysis: Option<String>,
    pub error_message: Option<String>,
}

impl Session {
    /// `true` when `status` and `pause_metadata` disagree about whether the
    /// session is paused. The session manager refuses to persist a session
    /// in this state.
    pub fn pause_invariant_violated(&self) -> bool {
        (self.status == SessionStatus::Paused) != self.pause_metadata.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage_execution_id: String,
    pub session_id: SessionId,
    pub stage_index: u32,
    pub stage_name: String,
    pub agent: String,
    pub status: StageStatus,
    pub iteration_strategy: IterationStrategyKind,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at_us: Option<i64>,
    pub completed_at_us: Option<i64>,
    /// The iteration count an in-progress or paused stage had reached. Set
    /// on pause so a resume can pick the loop back up instead of restarting
    /// the stage's prompt from iteration 1.
    pub current_iteration: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationStrategyKind {
    React,
    ReactTools,
    ReactFinalAnalysis,
    NativeThinking,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// The kind of streamed content an LLM chunk belongs to; used by the
/// iteration controllers to tell reasoning text apart from the final answer
/// while a response is still streaming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    Thought,
    FinalAnswer,
    NativeThinking,
    Summarization,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Google native-thinking continuity token; threaded unchanged through
    /// the conversation whenever the provider hands one back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            thought_signature: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            thought_signature: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            thought_signature: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            thought_signature: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A single request/response pair recorded against a stage execution.
///
/// `conversation` is the cumulative prefix sent to the provider for this
/// call, not just the new turn -- callers append, never replace, when
/// building the next interaction's conversation from the previous one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmInteraction {
    pub interaction_id: String,
    pub session_id: SessionId,
    pub stage_execution_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub conversation: Vec<Message>,
    pub response: Option<String>,
    pub usage: Option<TokenUsage>,
    pub started_at_us: i64,
    pub completed_at_us: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommunicationType {
    ToolList,
    ToolCall,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpInteraction {
    pub interaction_id: String,
    pub session_id: SessionId,
    pub stage_execution_id: Option<String>,
    pub server_name: String,
    pub communication_type: CommunicationType,
    pub tool_name: Option<String>,
    pub arguments: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    /// Whether `result` had any masking patterns applied to it. Lets an
    /// auditor tell a clean result apart from one that was redacted before
    /// ever reaching history.
    pub masked: bool,
    pub error_message: Option<String>,
    pub started_at_us: i64,
    pub completed_at_us: Option<i64>,
}

impl McpInteraction {
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at_us.map(|end| (end - self.started_at_us) / 1000)
    }
}

/// A validated tool-call record: server and tool names are trimmed and
/// guaranteed non-empty. Constructed fallibly so a malformed ReAct action
/// line becomes a `ParseMalformed` error instead of an empty-string call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub server: String,
    pub tool: String,
    pub arguments: serde_json::Value,
}

impl TryFrom<(&str, &str, serde_json::Value)> for ToolCallRecord {
    type Error = crate::error::Error;

    fn try_from(value: (&str, &str, serde_json::Value)) -> Result<Self, Self::Error> {
        let (server, tool, arguments) = value;
        let server = server.trim().to_string();
        let tool = tool.trim().to_string();
        if server.is_empty() || tool.is_empty() {
            return Err(crate::error::Error::parse_malformed(format!(
                "tool call must name a non-empty server and tool, got server={server:?} tool={tool:?}"
            )));
        }
        Ok(Self {
            server,
            tool,
            arguments,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub agent: String,
    pub iteration_strategy: IterationStrategyKind,
    /// Overrides the chain's default provider for this stage only.
    #[serde(default)]
    pub llm_provider: Option<String>,
    /// Overrides the agent's default server list for this stage only.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub chain_id: String,
    pub alert_types: Vec<String>,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub chat_enabled: bool,
    /// Default provider id for stages that don't set their own.
    #[serde(default)]
    pub llm_provider: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    pub pattern: String,
    #[serde(default = "default_mask_replacement")]
    pub replacement: String,
}

fn default_mask_replacement() -> String {
    "***MASKED***".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MaskingConfig {
    #[serde(default)]
    pub pattern_groups: Vec<String>,
    #[serde(default)]
    pub custom_patterns: Vec<CustomPattern>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub server_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub transport: TransportConfig,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub masking: MaskingConfig,
}

fn default_true() -> bool {
    true
}
