//! Request/response shapes shared by every provider adapter.
//!
//! Conversations are carried as `tarsy_core::Message` end to end; each
//! provider translates them into its own wire format at the edge rather than
//! this crate owning a second message representation.

use serde::{Deserialize, Serialize};
use tarsy_core::{Message, ToolDefinition};

pub use tarsy_core::{StreamType, TokenUsage as Usage};

#[derive(Clone, Debug, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: default_model(),
            messages: Vec::new(),
            tools: None,
            max_tokens: Some(8192),
            temperature: None,
            system: None,
        }
    }
}

/// Placeholder default; real deployments always set `model` explicitly from
/// the relevant provider config, this only matters for tests and examples.
fn default_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

/// Streaming delta from a provider. `Thinking` carries native-thinking
/// reasoning text distinct from the ReAct `Thought:` text embedded in `Text`.
#[derive(Clone, Debug)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolCallEnd { id: String },
    /// Google native-thinking continuity token for the turn just produced.
    ThoughtSignature(String),
    Done { stop_reason: Option<String>, usage: Option<Usage> },
    Error(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl AccumulatedToolCall {
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Splits an MCP-style tool name of the form `"{server}__{tool}"` used by
/// the native-thinking function-calling wire format, where upstream function
/// names can't contain the `.`/`:` the rest of the engine uses as separators.
pub fn split_server_tool_name(name: &str) -> Option<(&str, &str)> {
    name.split_once("__")
}

pub fn join_server_tool_name(server: &str, tool: &str) -> String {
    format!("{server}__{tool}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_joins_are_inverse() {
        let joined = join_server_tool_name("kubernetes", "get_pods");
        assert_eq!(split_server_tool_name(&joined), Some(("kubernetes", "get_pods")));
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        let call = AccumulatedToolCall {
            id: "1".into(),
            name: "x".into(),
            arguments: "".into(),
        };
        assert_eq!(call.parse_arguments().unwrap(), serde_json::json!({}));
    }
}
