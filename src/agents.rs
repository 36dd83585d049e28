//! Static agent catalog: each agent class hard-codes the MCP servers it
//! needs and the instructions appended to its stage's system prompt, rather
//! than loading that from a config file — there is no agent-level YAML
//! schema, only chains, MCP servers, and LLM providers.

pub struct AgentSpec {
    pub mcp_servers: Vec<String>,
    pub custom_instructions: &'static str,
}

/// Returns the spec for a named agent, or `None` if the name isn't known.
/// Unlike the config loaders this has no lenient fallback: an unknown agent
/// in a chain definition means the chain is misconfigured and the stage
/// should fail fast rather than silently run with no tools.
pub fn lookup(agent_name: &str) -> Option<AgentSpec> {
    match agent_name {
        "kubernetes-agent" => Some(AgentSpec {
            mcp_servers: vec!["kubernetes".to_string()],
            custom_instructions: "You triage Kubernetes alerts. Inspect pod, deployment, \
                and event state before concluding; prefer namespaced queries over cluster-wide \
                ones; call out any resource you could not reach rather than guessing at its state.",
        }),
        "runbook-agent" => Some(AgentSpec {
            mcp_servers: vec!["kubernetes".to_string(), "runbooks".to_string()],
            custom_instructions: "Follow the supplied runbook's steps in order. If a step's tool \
                call fails, note it and continue with the remaining steps rather than aborting \
                the whole analysis.",
        }),
        "base-agent" => Some(AgentSpec {
            mcp_servers: vec![],
            custom_instructions: "Analyze the alert using only the data already attached to it; \
                you have no tool access in this stage.",
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn an_unknown_agent_name_resolves_to_none() {
        assert!(lookup("not-a-real-agent").is_none());
    }

    #[test]
    fn the_base_agent_has_no_default_servers() {
        let spec = lookup("base-agent").unwrap();
        assert!(spec.mcp_servers.is_empty());
    }

    #[test]
    fn the_kubernetes_agent_names_its_server() {
        let spec = lookup("kubernetes-agent").unwrap();
        assert_eq!(spec.mcp_servers, vec!["kubernetes".to_string()]);
    }
}
