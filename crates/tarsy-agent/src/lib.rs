//! Iteration controllers (C9) and the agent (C10) that runs them: binds an
//! LLM client and an MCP client to a composed prompt and one of the four
//! iteration strategies, and exposes `Agent::process`.

mod agent;
mod context;
mod final_analysis;
mod native_thinking;
mod react;
mod strategy;
#[cfg(test)]
mod test_support;

pub use agent::Agent;
pub use context::{IterationContext, IterationOutcome, StageOutput, ToolWithServer};
pub use react::ReactMode;
pub use strategy::RunIterationStrategy;
