//! `react` and `react-tools` controllers (§4.3.1-4.3.2): both run the same
//! Thought/Action/Observation loop against C7's parser; the only difference
//! is the closing instruction in the system prompt (`Final Answer:` as a
//! finished analysis vs. as a data summary handed to the next stage) and,
//! by extension, what the returned text means to the caller.

use tarsy_core::clock::now_us;
use tarsy_core::types::Message;
use tarsy_core::{Error, Result};
use tarsy_parser::{ObservationEntry, ResponseType};

use crate::agent::Agent;
use crate::context::{IterationContext, IterationOutcome};
use crate::strategy::{render_prior_stage_outputs, render_tools_catalog};

/// Consecutive malformed completions tolerated before the stage raises
/// rather than keeps nudging the model to fix its format.
const MAX_CONSECUTIVE_MALFORMED: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactMode {
    /// `react`: the stage's own final answer is the session's analysis.
    Analysis,
    /// `react-tools`: the stage's final answer is a data summary consumed
    /// by later stages, not the session's own conclusion.
    DataSummary,
}

pub async fn run(agent: &Agent, context: IterationContext, mode: ReactMode) -> Result<IterationOutcome> {
    let mut conversation = context.resume_conversation.clone().unwrap_or_else(|| {
        vec![
            Message::system(compose_system_prompt(agent, &context, mode)),
            Message::user(compose_initial_user_prompt(&context)),
        ]
    });
    let mut malformed_streak: u32 = 0;
    let mut iteration = context.start_iteration;

    while iteration <= agent.max_iterations {
        if context.cancel.is_cancelled() {
            return Err(Error::cancelled("cancelled between react iterations"));
        }

        let request = tarsy_llm::LlmRequest {
            model: agent.model.clone(),
            messages: conversation.clone(),
            ..Default::default()
        };
        let started_at_us = now_us();
        let result = agent
            .llm_client
            .generate(request, &context.session_id, Some(&context.stage_execution_id), Some(context.cancel.clone()))
            .await
            .map_err(Error::from)?;

        conversation.push(Message::assistant(result.text.clone()));
        agent
            .record_llm_interaction(&context, conversation.clone(), &result, started_at_us)
            .await?;
        let parsed = tarsy_parser::parse(&result.text);

        match parsed.response_type() {
            ResponseType::FinalAnswer => {
                return Ok(IterationOutcome::Completed {
                    analysis: parsed.final_answer.unwrap_or_default(),
                });
            }
            ResponseType::ThoughtAction => {
                malformed_streak = 0;
                if context.cancel.is_cancelled() {
                    return Err(Error::cancelled("cancelled before tool dispatch"));
                }
                let call = parsed.tool_call.expect("ThoughtAction implies a tool call");
                let outcome = agent
                    .mcp_client
                    .call_tool(
                        &context.session_id,
                        Some(&context.stage_execution_id),
                        context.mcp_selection.as_deref(),
                        &call.server,
                        &call.tool,
                        call.arguments.clone(),
                    )
                    .await;
                let entry = ObservationEntry {
                    server: call.server.clone(),
                    tool: call.tool.clone(),
                    outcome: outcome.map_err(|e| e.message),
                };
                conversation.push(Message::user(tarsy_parser::format_observations(&[entry])));
            }
            ResponseType::Malformed => {
                malformed_streak += 1;
                if malformed_streak >= MAX_CONSECUTIVE_MALFORMED {
                    return Err(Error::parse_malformed(format!(
                        "received {malformed_streak} consecutive malformed responses without a recognisable action or final answer"
                    )));
                }
                conversation.push(Message::user(format_correction_reminder()));
            }
        }

        iteration += 1;
    }

    Ok(IterationOutcome::Paused {
        reason: "max_iterations_reached".to_string(),
        current_iteration: agent.max_iterations,
    })
}

fn format_correction_reminder() -> String {
    "Your previous response didn't contain a recognisable Thought/Action/Action Input block or a \
     Final Answer. Reply using exactly one of these two shapes:\n\n\
     Thought: <your reasoning>\nAction: <server>.<tool>\nAction Input: <JSON object of arguments>\n\n\
     or, once you have enough information:\n\n\
     Final Answer: <your conclusion>"
        .to_string()
}

fn compose_system_prompt(agent: &Agent, context: &IterationContext, mode: ReactMode) -> String {
    let closing = match mode {
        ReactMode::Analysis => {
            "When you have enough information to explain what happened and why, respond with \
             `Final Answer:` followed by your complete analysis."
        }
        ReactMode::DataSummary => {
            "When you have collected enough data for the next stage to work with, respond with \
             `Final Answer:` followed by a structured summary of what you found. Do not draw \
             conclusions here; later stages do that."
        }
    };
    format!(
        "{}\n\nYou investigate infrastructure alerts by reasoning step by step and calling tools. \
         On every turn, respond with either:\n\n\
         Thought: <reasoning>\nAction: <server>.<tool>\nAction Input: <JSON object of arguments>\n\n\
         or a final answer. {closing}\n\nAvailable tools:\n{}",
        agent.system_prompt,
        render_tools_catalog(&context.tools),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_reminder_names_both_valid_response_shapes() {
        let reminder = format_correction_reminder();
        assert!(reminder.contains("Action:"));
        assert!(reminder.contains("Final Answer:"));
    }

    #[tokio::test]
    async fn analysis_mode_and_data_summary_mode_close_the_prompt_differently() {
        let agent = crate::test_support::fake_agent(tarsy_core::types::IterationStrategyKind::React);
        let context = crate::test_support::fake_context(&agent, vec![]);

        let analysis_prompt = compose_system_prompt(&agent, &context, ReactMode::Analysis);
        let summary_prompt = compose_system_prompt(&agent, &context, ReactMode::DataSummary);

        assert!(analysis_prompt.contains("complete analysis"));
        assert!(summary_prompt.contains("Do not draw"));
        assert_ne!(analysis_prompt, summary_prompt);
    }

    #[test]
    fn initial_user_prompt_includes_the_runbook_and_prior_stage_output_when_present() {
        let agent = crate::test_support::fake_agent(tarsy_core::types::IterationStrategyKind::React);
        let mut context = crate::test_support::fake_context(&agent, vec![]);
        context.runbook = Some("check pod restarts first".to_string());
        context.stage_attributed_data = vec![crate::context::StageOutput {
            stage_name: "data-collection".into(),
            output: "3 pods crash-looping".into(),
        }];

        let prompt = compose_initial_user_prompt(&context);
        assert!(prompt.contains("check pod restarts first"));
        assert!(prompt.contains("3 pods crash-looping"));
    }

    #[tokio::test]
    async fn a_final_answer_on_the_first_turn_completes_immediately() {
        let agent = crate::test_support::scripted_agent(
            tarsy_core::types::IterationStrategyKind::React,
            vec!["Thought: looks fine\nFinal Answer: the cluster is healthy"],
        );
        let context = crate::test_support::fake_context(&agent, vec![]);

        let outcome = run(&agent, context, ReactMode::Analysis).await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Completed { analysis: "the cluster is healthy".to_string() }
        );
    }

    #[tokio::test]
    async fn a_failed_tool_call_is_fed_back_as_an_observation_instead_of_aborting() {
        let agent = crate::test_support::scripted_agent(
            tarsy_core::types::IterationStrategyKind::React,
            vec![
                "Thought: check pods\nAction: kubernetes.get_pods\nAction Input: {}",
                "Thought: never mind, done\nFinal Answer: cluster is fine after all",
            ],
        );
        let context = crate::test_support::fake_context(&agent, vec![]);

        let outcome = run(&agent, context, ReactMode::Analysis).await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Completed { analysis: "cluster is fine after all".to_string() }
        );
    }

    #[tokio::test]
    async fn three_consecutive_malformed_replies_raise_a_parse_malformed_error() {
        let agent = crate::test_support::scripted_agent(
            tarsy_core::types::IterationStrategyKind::React,
            vec!["not following the format", "still not following it", "nope, again"],
        );
        let context = crate::test_support::fake_context(&agent, vec![]);

        let err = run(&agent, context, ReactMode::Analysis).await.unwrap_err();
        assert_eq!(err.kind, tarsy_core::ErrorKind::ParseMalformed);
    }

    #[tokio::test]
    async fn exhausting_max_iterations_without_a_final_answer_pauses_instead_of_failing() {
        let agent = crate::test_support::scripted_agent(
            tarsy_core::types::IterationStrategyKind::React,
            vec![
                "Thought: still looking\nAction: kubernetes.get_pods\nAction Input: {}",
                "Thought: still looking\nAction: kubernetes.get_pods\nAction Input: {}",
            ],
        )
        .with_max_iterations(2);
        let context = crate::test_support::fake_context(&agent, vec![]);

        let outcome = run(&agent, context, ReactMode::Analysis).await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Paused { reason: "max_iterations_reached".to_string(), current_iteration: 2 }
        );
    }
}

fn compose_initial_user_prompt(context: &IterationContext) -> String {
    let mut sections = vec![format!(
        "Alert type: {}\nAlert data:\n{}",
        context.alert.alert_type,
        serde_json::to_string_pretty(&context.alert.data).unwrap_or_else(|_| context.alert.data.to_string()),
    )];
    if let Some(runbook) = &context.runbook {
        sections.push(format!("Runbook:\n{runbook}"));
    }
    if !context.stage_attributed_data.is_empty() {
        sections.push(format!(
            "Prior stage output:\n{}",
            render_prior_stage_outputs(&context.stage_attributed_data)
        ));
    }
    sections.join("\n\n")
}
