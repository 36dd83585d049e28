//! `react-final-analysis` controller (§4.3.3): a single LLM call over the
//! accumulated output of every prior stage, no tools involved. Used as the
//! last stage of a chain to produce the session's written analysis.

use tarsy_core::clock::now_us;
use tarsy_core::types::Message;
use tarsy_core::{Error, Result};

use crate::agent::Agent;
use crate::context::{IterationContext, IterationOutcome};
use crate::strategy::render_prior_stage_outputs;

pub async fn run(agent: &Agent, context: IterationContext) -> Result<IterationOutcome> {
    if context.cancel.is_cancelled() {
        return Err(Error::cancelled("cancelled before final analysis"));
    }

    let system = format!(
        "{}\n\nYou write the final analysis for an infrastructure alert investigation, given \
         everything the earlier stages found. Produce a complete, well-organised written \
         analysis; do not call any tools and do not ask follow-up questions.",
        agent.system_prompt,
    );
    let user = format!(
        "Alert type: {}\n\nFindings from prior stages:\n{}",
        context.alert.alert_type,
        render_prior_stage_outputs(&context.stage_attributed_data),
    );

    let request = tarsy_llm::LlmRequest {
        model: agent.model.clone(),
        system: Some(system),
        messages: vec![Message::user(user.clone())],
        ..Default::default()
    };

    let started_at_us = now_us();
    let result = agent
        .llm_client
        .generate(request, &context.session_id, Some(&context.stage_execution_id), Some(context.cancel.clone()))
        .await
        .map_err(Error::from)?;

    agent
        .record_llm_interaction(
            &context,
            vec![Message::user(user), Message::assistant(result.text.clone())],
            &result,
            started_at_us,
        )
        .await?;

    Ok(IterationOutcome::Completed { analysis: result.text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_core::types::IterationStrategyKind;

    #[tokio::test]
    async fn a_cancelled_context_is_rejected_before_any_llm_call_is_made() {
        let agent = crate::test_support::fake_agent(IterationStrategyKind::ReactFinalAnalysis);
        let mut context = crate::test_support::fake_context(&agent, vec![]);
        context.cancel.cancel();

        let err = run(&agent, context).await.unwrap_err();
        assert_eq!(err.kind, tarsy_core::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn a_provider_failure_surfaces_as_an_error_rather_than_panicking() {
        let agent = crate::test_support::fake_agent(IterationStrategyKind::ReactFinalAnalysis);
        let context = crate::test_support::fake_context(&agent, vec![]);

        assert!(run(&agent, context).await.is_err());
    }
}
