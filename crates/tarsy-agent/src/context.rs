//! The per-stage input/output shapes an iteration controller runs against.

use tarsy_core::types::{Alert, Message, SessionId, ToolDefinition};
use tokio_util::sync::CancellationToken;

/// A tool definition paired with the server that serves it, as handed to an
/// iteration controller by the orchestrator's list-cached tool catalogue.
#[derive(Clone, Debug)]
pub struct ToolWithServer {
    pub server: String,
    pub tool: ToolDefinition,
}

/// One prior stage's recorded output, carried forward so later stages (and
/// the final-analysis stage) can build on what came before.
#[derive(Clone, Debug)]
pub struct StageOutput {
    pub stage_name: String,
    pub output: String,
}

/// Everything a controller needs to run one stage, per §4.3's contract.
#[derive(Clone)]
pub struct IterationContext {
    pub alert: Alert,
    pub runbook: Option<String>,
    pub tools: Vec<ToolWithServer>,
    pub session_id: SessionId,
    pub stage_execution_id: String,
    pub stage_attributed_data: Vec<StageOutput>,
    pub mcp_selection: Option<Vec<String>>,
    pub cancel: CancellationToken,
    /// The iteration an iteration-looping controller should start counting
    /// from; 1 for a fresh stage, `current_iteration` from `PauseMetadata`
    /// when resuming one that previously paused on `max_iterations`.
    pub start_iteration: u32,
    /// When resuming a paused stage, the conversation reconstructed from its
    /// persisted LLM interactions, carrying forward every prior tool call
    /// and response instead of re-running the stage's opening prompt.
    pub resume_conversation: Option<Vec<Message>>,
}

/// What a controller hands back to the orchestrator once it stops running.
#[derive(Clone, Debug, PartialEq)]
pub enum IterationOutcome {
    /// The stage produced a finished analysis (or, for a non-final stage, a
    /// data summary the next stage can build on).
    Completed { analysis: String },
    /// `max_iterations` was reached without a final answer; the session
    /// manager pauses the session rather than failing it outright.
    Paused { reason: String, current_iteration: u32 },
}
