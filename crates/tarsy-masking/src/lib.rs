//! Data masking engine (C6): redacts sensitive substrings out of MCP tool
//! results and arguments before they reach an LLM conversation or the
//! history store.
//!
//! Structure-preserving: objects and arrays keep their shape, only string
//! leaves are rewritten. A pattern that fails to compile is logged and
//! disabled rather than aborting the whole request — one bad custom pattern
//! in a server's config shouldn't take masking out for every other server.

use regex::Regex;
use tarsy_core::types::{CustomPattern, MaskingConfig};
use tracing::warn;

struct CompiledPattern {
    name: String,
    regex: Regex,
    replacement: String,
}

/// Named bundles of common secret shapes, each entry `(name, pattern,
/// replacement)`. Concrete contents are this engine's own choice (no
/// upstream source carries the original regex literals — see DESIGN.md's
/// Open Question resolution): `basic` covers the credential-shaped
/// key/value pairs any server is likely to echo back, `security` covers
/// generic secret-material shapes, `kubernetes` covers the
/// service-account/kubeconfig shapes a Kubernetes-facing MCP server is most
/// likely to leak.
pub fn pattern_group(name: &str) -> Vec<(&'static str, &'static str, &'static str)> {
    match name {
        "basic" => vec![
            (
                "api_key",
                r#"(?i)(?:api[_-]?key|apikey)"?\s*[:=]\s*"?[A-Za-z0-9\-_./+]{8,}"?"#,
                "__MASKED_API_KEY__",
            ),
            (
                "password",
                r#"(?i)(?:password|passwd)"?\s*[:=]\s*"?\S+"?"#,
                "__MASKED_PASSWORD__",
            ),
            (
                "bearer_token",
                r"(?i)bearer\s+[A-Za-z0-9\-_.]+",
                "__MASKED_TOKEN__",
            ),
        ],
        "security" => vec![
            (
                "private_key_block",
                r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
                "__MASKED_PRIVATE_KEY__",
            ),
            (
                "aws_access_key",
                r"\bAKIA[0-9A-Z]{16}\b",
                "__MASKED_AWS_KEY__",
            ),
        ],
        "kubernetes" => vec![
            (
                "service_account_jwt",
                r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\b",
                "__MASKED_K8S_TOKEN__",
            ),
            (
                "client_certificate_data",
                r#"(?i)client-certificate-data"?\s*:\s*"?[A-Za-z0-9+/=]{20,}"?"#,
                "__MASKED_K8S_CERT__",
            ),
        ],
        other => {
            warn!(group = other, "unknown masking pattern group, ignoring");
            Vec::new()
        }
    }
}

pub struct MaskingEngine {
    patterns: Vec<CompiledPattern>,
}

impl MaskingEngine {
    pub fn new(config: &MaskingConfig) -> Self {
        let mut patterns = Vec::new();

        for group in &config.pattern_groups {
            for (name, pattern, replacement) in pattern_group(group) {
                match Regex::new(pattern) {
                    Ok(regex) => patterns.push(CompiledPattern {
                        name: name.to_string(),
                        regex,
                        replacement: replacement.to_string(),
                    }),
                    Err(e) => warn!(pattern_name = name, error = %e, "built-in masking pattern failed to compile"),
                }
            }
        }

        for custom in &config.custom_patterns {
            match compile_custom(custom) {
                Ok(compiled) => patterns.push(compiled),
                Err(e) => warn!(
                    pattern_name = %custom.name,
                    error = %e,
                    "custom masking pattern failed to compile, disabling it"
                ),
            }
        }

        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn mask_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.patterns {
            out = pattern.regex.replace_all(&out, pattern.replacement.as_str()).into_owned();
        }
        out
    }

    /// Structure-preserving traversal: only `Value::String` leaves are
    /// rewritten, objects/arrays/numbers/bools/null pass through unchanged.
    pub fn mask_value(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.mask_text(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.mask_value(v)).collect())
            }
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.mask_value(v));
                }
                serde_json::Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

fn compile_custom(custom: &CustomPattern) -> Result<CompiledPattern, regex::Error> {
    let regex = Regex::new(&custom.pattern)?;
    Ok(CompiledPattern {
        name: custom.name.clone(),
        regex,
        replacement: custom.replacement.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_core::types::CustomPattern;

    fn config(groups: &[&str]) -> MaskingConfig {
        MaskingConfig {
            pattern_groups: groups.iter().map(|s| s.to_string()).collect(),
            custom_patterns: Vec::new(),
        }
    }

    #[test]
    fn masks_an_api_key_in_the_basic_group() {
        let engine = MaskingEngine::new(&config(&["basic"]));
        let masked = engine.mask_text(r#"api_key: AKIAABCDEF1234567890"#);
        assert!(!masked.contains("AKIAABCDEF1234567890"));
        assert!(masked.contains("__MASKED_API_KEY__"));
    }

    #[test]
    fn preserves_object_shape_while_masking_leaves() {
        let engine = MaskingEngine::new(&config(&["basic"]));
        let value = serde_json::json!({
            "headers": { "authorization": "Bearer abc123xyz789" },
            "count": 3,
        });
        let masked = engine.mask_value(&value);
        assert_eq!(masked["count"], 3);
        assert_eq!(masked["headers"]["authorization"], "__MASKED_TOKEN__");
    }

    #[test]
    fn masks_an_aws_access_key_in_the_security_group() {
        let engine = MaskingEngine::new(&config(&["security"]));
        let masked = engine.mask_text("found credential AKIA1234567890ABCDEF in logs");
        assert!(!masked.contains("AKIA1234567890ABCDEF"));
        assert!(masked.contains("__MASKED_AWS_KEY__"));
    }

    #[test]
    fn a_broken_custom_pattern_is_disabled_not_fatal() {
        let mut config = config(&[]);
        config.custom_patterns.push(CustomPattern {
            name: "broken".into(),
            pattern: "(unterminated".into(),
            replacement: "***MASKED***".into(),
        });
        config.custom_patterns.push(CustomPattern {
            name: "ok".into(),
            pattern: "secret-\\d+".into(),
            replacement: "***MASKED***".into(),
        });
        let engine = MaskingEngine::new(&config);
        assert_eq!(engine.patterns.len(), 1);
        assert_eq!(engine.mask_text("value secret-42"), "value ***MASKED***");
    }

    #[test]
    fn unknown_pattern_group_yields_no_patterns_but_does_not_panic() {
        let engine = MaskingEngine::new(&config(&["nonexistent"]));
        assert!(engine.is_empty());
    }
}
