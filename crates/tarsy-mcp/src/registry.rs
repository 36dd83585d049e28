//! MCP server registry (C4): holds each configured server's transport and
//! masking config, resolves `${VAR}` environment references, and caches the
//! last `list_tools` response per server.
//!
//! Grounded on the teacher's `openclaw_config.rs` lenient-default config
//! loading idiom, adapted from filesystem-path expansion to `${VAR}`
//! environment-variable substitution.

use dashmap::DashMap;
use regex::Regex;
use std::sync::OnceLock;
use tarsy_core::types::{McpServerConfig, ToolDefinition};

fn env_var_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Replaces every `${VAR}` in `input` with the value of the matching
/// environment variable, leaving it untouched (not blanked) if the variable
/// isn't set, so a missing var surfaces as an obviously-wrong literal
/// instead of silently becoming an empty string.
pub fn resolve_env(input: &str) -> String {
    env_var_pattern()
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

pub struct McpServerRegistry {
    servers: DashMap<String, McpServerConfig>,
    tool_cache: DashMap<String, Vec<ToolDefinition>>,
}

impl Default for McpServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl McpServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            tool_cache: DashMap::new(),
        }
    }

    pub fn register(&self, mut config: McpServerConfig) {
        config.transport.command = config.transport.command.map(|c| resolve_env(&c));
        config.transport.args = config.transport.args.iter().map(|a| resolve_env(a)).collect();
        config.transport.url = config.transport.url.map(|u| resolve_env(&u));
        for value in config.transport.env.values_mut() {
            *value = resolve_env(value);
        }
        self.servers.insert(config.server_id.clone(), config);
    }

    pub fn get(&self, server_id: &str) -> Option<McpServerConfig> {
        self.servers.get(server_id).map(|r| r.clone())
    }

    pub fn enabled_server_ids(&self) -> Vec<String> {
        self.servers
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.server_id.clone())
            .collect()
    }

    pub fn cache_tools(&self, server_id: &str, tools: Vec<ToolDefinition>) {
        self.tool_cache.insert(server_id.to_string(), tools);
    }

    pub fn cached_tools(&self, server_id: &str) -> Option<Vec<ToolDefinition>> {
        self.tool_cache.get(server_id).map(|r| r.clone())
    }

    pub fn invalidate_cache(&self, server_id: &str) {
        self.tool_cache.remove(server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_a_set_variable_and_leaves_an_unset_one_alone() {
        std::env::set_var("TARSY_TEST_TOKEN", "abc123");
        assert_eq!(resolve_env("Bearer ${TARSY_TEST_TOKEN}"), "Bearer abc123");
        assert_eq!(resolve_env("Bearer ${TARSY_TEST_UNSET_VAR}"), "Bearer ${TARSY_TEST_UNSET_VAR}");
        std::env::remove_var("TARSY_TEST_TOKEN");
    }

    #[test]
    fn registering_a_server_resolves_its_env_and_command_fields() {
        std::env::set_var("TARSY_TEST_CMD", "/usr/local/bin/mcp-server");
        let registry = McpServerRegistry::new();
        registry.register(McpServerConfig {
            server_id: "kubernetes".into(),
            enabled: true,
            transport: tarsy_core::types::TransportConfig {
                kind: tarsy_core::types::TransportKind::Stdio,
                command: Some("${TARSY_TEST_CMD}".into()),
                args: vec![],
                url: None,
                env: Default::default(),
            },
            instructions: None,
            masking: Default::default(),
        });
        let resolved = registry.get("kubernetes").unwrap();
        assert_eq!(resolved.transport.command.as_deref(), Some("/usr/local/bin/mcp-server"));
        std::env::remove_var("TARSY_TEST_CMD");
    }
}
