//! Polymorphism over iteration strategies: `IterationStrategyKind` (a plain
//! tagged enum owned by `tarsy-core`, shared with the history records) grows
//! a `run(agent, context) -> result` operation here rather than each
//! strategy being its own struct implementing a trait hierarchy. Adding a
//! fifth strategy means adding a variant and a match arm, not a new type.

use async_trait::async_trait;
use tarsy_core::types::IterationStrategyKind;
use tarsy_core::Result;

use crate::agent::Agent;
use crate::context::{IterationContext, IterationOutcome};
use crate::{final_analysis, native_thinking, react};

#[async_trait]
pub trait RunIterationStrategy {
    async fn run(&self, agent: &Agent, context: IterationContext) -> Result<IterationOutcome>;
}

#[async_trait]
impl RunIterationStrategy for IterationStrategyKind {
    async fn run(&self, agent: &Agent, context: IterationContext) -> Result<IterationOutcome> {
        match self {
            IterationStrategyKind::React => react::run(agent, context, react::ReactMode::Analysis).await,
            IterationStrategyKind::ReactTools => react::run(agent, context, react::ReactMode::DataSummary).await,
            IterationStrategyKind::ReactFinalAnalysis => final_analysis::run(agent, context).await,
            IterationStrategyKind::NativeThinking => native_thinking::run(agent, context).await,
        }
    }
}

/// Renders the tool catalogue the way every ReAct-style prompt lists it:
/// one `server.tool: description` line per tool.
pub(crate) fn render_tools_catalog(tools: &[crate::context::ToolWithServer]) -> String {
    if tools.is_empty() {
        return "No tools are available for this stage.".to_string();
    }
    tools
        .iter()
        .map(|t| format!("- {}.{}: {}", t.server, t.tool.name, t.tool.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders prior stages' outputs, in order, for prompts that build on what
/// earlier stages in the chain already found.
pub(crate) fn render_prior_stage_outputs(stages: &[crate::context::StageOutput]) -> String {
    if stages.is_empty() {
        return "No prior stage output is available.".to_string();
    }
    stages
        .iter()
        .map(|s| format!("## {}\n{}", s.stage_name, s.output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageOutput;
    use tarsy_core::types::ToolDefinition;

    #[test]
    fn empty_tool_catalogue_says_so_rather_than_rendering_nothing() {
        assert_eq!(render_tools_catalog(&[]), "No tools are available for this stage.");
    }

    #[test]
    fn tool_catalogue_lists_one_line_per_server_qualified_tool() {
        let tools = vec![crate::context::ToolWithServer {
            server: "kubernetes".into(),
            tool: ToolDefinition {
                name: "get_pods".into(),
                description: "lists pods in a namespace".into(),
                input_schema: serde_json::json!({}),
            },
        }];
        let rendered = render_tools_catalog(&tools);
        assert_eq!(rendered, "- kubernetes.get_pods: lists pods in a namespace");
    }

    #[test]
    fn prior_stage_outputs_render_in_order_under_their_own_heading() {
        let stages = vec![
            StageOutput { stage_name: "data-collection".into(), output: "found 3 pods".into() },
            StageOutput { stage_name: "analysis".into(), output: "all healthy".into() },
        ];
        let rendered = render_prior_stage_outputs(&stages);
        let data_pos = rendered.find("## data-collection").unwrap();
        let analysis_pos = rendered.find("## analysis").unwrap();
        assert!(data_pos < analysis_pos);
    }
}
