//! `native-thinking` controller (§4.3.4): the Google function-calling
//! flavour. Tool names are encoded as `"{server}__{tool}"` since function
//! names can't carry the `.` the ReAct controllers use, and the vendor's
//! opaque `thought_signature` is threaded back on the assistant message that
//! produced a function call so the provider can continue its reasoning.

use tarsy_core::clock::now_us;
use tarsy_core::types::{Message, ToolCall, ToolDefinition};
use tarsy_core::{Error, Result};
use tarsy_llm::{join_server_tool_name, split_server_tool_name, LlmError};

use crate::agent::Agent;
use crate::context::{IterationContext, IterationOutcome};
use crate::strategy::render_prior_stage_outputs;

pub async fn run(agent: &Agent, context: IterationContext) -> Result<IterationOutcome> {
    let tools: Vec<ToolDefinition> = context
        .tools
        .iter()
        .map(|t| ToolDefinition {
            name: join_server_tool_name(&t.server, &t.tool.name),
            description: t.tool.description.clone(),
            input_schema: t.tool.input_schema.clone(),
        })
        .collect();

    let mut conversation = context.resume_conversation.clone().unwrap_or_else(|| {
        vec![
            Message::system(agent.system_prompt.clone()),
            Message::user(compose_initial_user_prompt(&context)),
        ]
    });
    let mut iteration = context.start_iteration;

    while iteration <= agent.max_iterations {
        if context.cancel.is_cancelled() {
            return Err(Error::cancelled("cancelled between native-thinking iterations"));
        }

        let request = tarsy_llm::LlmRequest {
            model: agent.model.clone(),
            messages: conversation.clone(),
            tools: if tools.is_empty() { None } else { Some(tools.clone()) },
            ..Default::default()
        };

        let started_at_us = now_us();
        let result = match agent
            .llm_client
            .generate(request, &context.session_id, Some(&context.stage_execution_id), Some(context.cancel.clone()))
            .await
        {
            Ok(result) => result,
            // The client already retried empty candidates 3 times with a
            // backoff (§4.4); once that's exhausted, report it as a finished
            // (if unsatisfying) answer rather than looping forever.
            Err(LlmError::Empty) => {
                return Ok(IterationOutcome::Completed {
                    analysis: "the model produced no usable response after repeated empty completions".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut assistant = Message::assistant(result.text.clone());
        assistant.thought_signature = result.thought_signature.clone();
        if !result.tool_calls.is_empty() {
            assistant.tool_calls = Some(result.tool_calls.clone());
        }
        conversation.push(assistant);
        agent
            .record_llm_interaction(&context, conversation.clone(), &result, started_at_us)
            .await?;

        if result.tool_calls.is_empty() {
            if !result.text.trim().is_empty() {
                return Ok(IterationOutcome::Completed { analysis: result.text });
            }
            iteration += 1;
            continue;
        }

        for call in &result.tool_calls {
            if context.cancel.is_cancelled() {
                return Err(Error::cancelled("cancelled before tool dispatch"));
            }
            conversation.push(Message::tool_result(call.id.clone(), dispatch_call(agent, &context, call).await));
        }

        iteration += 1;
    }

    Ok(IterationOutcome::Paused {
        reason: "max_iterations_reached".to_string(),
        current_iteration: agent.max_iterations,
    })
}

async fn dispatch_call(agent: &Agent, context: &IterationContext, call: &ToolCall) -> String {
    let Some((server, tool)) = split_server_tool_name(&call.name) else {
        return format!("error: malformed tool name '{}'", call.name);
    };
    let arguments = serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Object(Default::default()));
    match agent
        .mcp_client
        .call_tool(
            &context.session_id,
            Some(&context.stage_execution_id),
            context.mcp_selection.as_deref(),
            server,
            tool,
            arguments,
        )
        .await
    {
        Ok(value) => serde_json::to_string(&value).unwrap_or_default(),
        Err(e) => format!("error: {}", e.message),
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

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_core::types::IterationStrategyKind;

    #[tokio::test]
    async fn a_final_answer_with_no_function_calls_completes_the_turn() {
        let agent = crate::test_support::scripted_agent(
            IterationStrategyKind::NativeThinking,
            vec!["the cluster looks healthy"],
        );
        let context = crate::test_support::fake_context(&agent, vec![]);

        let outcome = run(&agent, context).await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Completed { analysis: "the cluster looks healthy".to_string() }
        );
    }

    #[tokio::test]
    async fn a_cancelled_context_is_rejected_before_any_llm_call_is_made() {
        let agent = crate::test_support::scripted_agent(IterationStrategyKind::NativeThinking, vec![]);
        let mut context = crate::test_support::fake_context(&agent, vec![]);
        context.cancel.cancel();

        let err = run(&agent, context).await.unwrap_err();
        assert_eq!(err.kind, tarsy_core::ErrorKind::Cancelled);
    }
}
