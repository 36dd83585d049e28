//! Startup configuration: chain routing table, MCP server registry, and LLM
//! provider table, loaded from YAML files in a config directory.
//!
//! Grounded on the teacher's `openclaw_config.rs` lenient-default loading
//! idiom: a single optional entry (one provider, one MCP server) failing to
//! resolve degrades with a warning rather than aborting startup; a missing
//! or unparsable config *file* is fatal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;
use tarsy_core::event_bus::EventBus;
use tarsy_core::types::{ChainDefinition, IterationStrategyKind, McpServerConfig, StageDefinition};
use tarsy_llm::{AnthropicProvider, GoogleProvider, LlmClient, LlmProvider, OpenAiCompatProvider};
use tarsy_mcp::{resolve_env, McpServerRegistry};
use tracing::warn;

#[derive(Debug, Deserialize)]
struct ChainsFile {
    chains: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct ChainYaml {
    matching_alert_types: Vec<String>,
    #[serde(default)]
    chat_enabled: bool,
    #[serde(default)]
    llm_provider: Option<String>,
    stages: Vec<StageYaml>,
}

#[derive(Debug, Deserialize)]
struct StageYaml {
    stage_id: String,
    agent: String,
    iteration_strategy: IterationStrategyKind,
    #[serde(default)]
    llm_provider: Option<String>,
    #[serde(default)]
    mcp_servers: Vec<String>,
}

/// Chains are returned in the order they appear in the file; `ChainRegistry`
/// relies on that order to break ties between chains matching the same
/// alert type ("first match wins; ties broken by registration order").
pub fn load_chains(path: &Path) -> anyhow::Result<Vec<ChainDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading chain config at {}", path.display()))?;
    let file: ChainsFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing chain config at {}", path.display()))?;

    let mut chains = Vec::with_capacity(file.chains.len());
    for (key, value) in file.chains {
        let chain_id = key
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("chain id must be a string"))?
            .to_string();
        let chain: ChainYaml = serde_yaml::from_value(value)
            .with_context(|| format!("parsing chain '{chain_id}'"))?;
        chains.push(ChainDefinition {
            chain_id,
            alert_types: chain.matching_alert_types,
            chat_enabled: chain.chat_enabled,
            llm_provider: chain.llm_provider,
            stages: chain
                .stages
                .into_iter()
                .map(|s| StageDefinition {
                    name: s.stage_id,
                    agent: s.agent,
                    iteration_strategy: s.iteration_strategy,
                    llm_provider: s.llm_provider,
                    mcp_servers: s.mcp_servers,
                })
                .collect(),
        });
    }
    Ok(chains)
}

#[derive(Debug, Deserialize)]
struct McpServersFile {
    servers: Vec<McpServerConfig>,
}

/// Registers every server whose transport fully resolves. A server whose
/// `${VAR}` references don't resolve against the process environment is
/// skipped with a warning rather than failing the whole file (§6).
pub fn load_mcp_servers(path: &Path) -> anyhow::Result<Arc<McpServerRegistry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading mcp server config at {}", path.display()))?;
    let file: McpServersFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing mcp server config at {}", path.display()))?;

    let registry = Arc::new(McpServerRegistry::new());
    for config in file.servers {
        let resolved_command = config.transport.command.as_deref().map(resolve_env);
        let resolved_args: Vec<String> = config.transport.args.iter().map(|a| resolve_env(a)).collect();
        let unresolved = resolved_command.as_deref().is_some_and(|c| c.contains("${"))
            || resolved_args.iter().any(|a| a.contains("${"));
        if unresolved {
            warn!(
                server = %config.server_id,
                "mcp server transport has an unresolved ${{VAR}} reference, skipping this server only"
            );
            continue;
        }
        registry.register(config);
    }
    Ok(registry)
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ProviderKind {
    Openai,
    Google,
    Anthropic,
    Xai,
}

#[derive(Debug, Deserialize)]
struct ProviderYaml {
    #[serde(rename = "type")]
    kind: ProviderKind,
    model: String,
    api_key_env: String,
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    providers: HashMap<String, ProviderYaml>,
}

/// A built LLM client plus the default model its config names, keyed by the
/// provider id chains and stages reference via `llm_provider`.
pub struct ProviderEntry {
    pub client: Arc<LlmClient>,
    pub model: String,
}

/// Builds one `LlmClient` per configured provider, sharing the event bus so
/// every provider's streaming chunks land on the same session channels. A
/// provider whose API key env var isn't set is skipped with a warning, not
/// a fatal error — "missing API keys for an unused provider are not fatal" (§6).
pub fn load_providers(path: &Path, event_bus: Arc<EventBus>) -> anyhow::Result<HashMap<String, ProviderEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading llm provider config at {}", path.display()))?;
    let file: ProvidersFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing llm provider config at {}", path.display()))?;

    let mut providers = HashMap::with_capacity(file.providers.len());
    for (provider_id, entry) in file.providers {
        let api_key = match std::env::var(&entry.api_key_env) {
            Ok(key) => key,
            Err(_) => {
                warn!(
                    provider = %provider_id,
                    env_var = %entry.api_key_env,
                    "api key env var not set; provider unavailable unless no chain references it"
                );
                continue;
            }
        };
        let provider: Arc<dyn LlmProvider> = match entry.kind {
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(api_key)),
            ProviderKind::Google => Arc::new(GoogleProvider::new(api_key)),
            ProviderKind::Openai => Arc::new(OpenAiCompatProvider::openai(api_key)),
            ProviderKind::Xai => Arc::new(OpenAiCompatProvider::xai(api_key)),
        };
        let client = Arc::new(LlmClient::new(provider, event_bus.clone()));
        providers.insert(provider_id, ProviderEntry { client, model: entry.model });
    }

    if providers.is_empty() {
        bail!("no usable llm providers: every configured provider is missing its api key");
    }
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_a_chain_with_stage_overrides_preserving_file_order() {
        let file = write_temp(
            r#"
chains:
  kubernetes-default:
    matching_alert_types: [kubernetes]
    chat_enabled: true
    stages:
      - stage_id: collect
        agent: kubernetes-agent
        iteration_strategy: react-tools
        mcp_servers: [kubernetes]
      - stage_id: analyze
        agent: base-agent
        iteration_strategy: react-final-analysis
        llm_provider: fast-anthropic
"#,
        );
        let chains = load_chains(file.path()).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].chain_id, "kubernetes-default");
        assert!(chains[0].chat_enabled);
        assert_eq!(chains[0].stages[0].iteration_strategy, IterationStrategyKind::ReactTools);
        assert_eq!(chains[0].stages[1].llm_provider.as_deref(), Some("fast-anthropic"));
    }

    #[test]
    fn an_mcp_server_with_an_unresolved_variable_is_skipped_not_fatal() {
        let file = write_temp(
            r#"
servers:
  - server_id: kubernetes
    transport:
      command: "${TARSY_TEST_MISSING_KUBECTL_PATH}"
      args: []
  - server_id: filesystem
    transport:
      command: "/usr/bin/true"
      args: []
"#,
        );
        let registry = load_mcp_servers(file.path()).unwrap();
        assert!(registry.get("kubernetes").is_none());
        assert!(registry.get("filesystem").is_some());
    }

    #[test]
    fn a_provider_missing_its_api_key_is_skipped_and_others_still_load() {
        std::env::remove_var("TARSY_TEST_UNSET_KEY");
        std::env::set_var("TARSY_TEST_SET_KEY", "sk-test-123");
        let file = write_temp(
            r#"
providers:
  primary:
    type: anthropic
    model: claude-sonnet-4
    api_key_env: TARSY_TEST_SET_KEY
  secondary:
    type: google
    model: gemini-2.0-flash
    api_key_env: TARSY_TEST_UNSET_KEY
"#,
        );
        let bus = Arc::new(EventBus::new());
        let providers = load_providers(file.path(), bus).unwrap();
        assert!(providers.contains_key("primary"));
        assert!(!providers.contains_key("secondary"));
        std::env::remove_var("TARSY_TEST_SET_KEY");
    }
}
