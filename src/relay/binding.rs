// Provider binding: one configured upstream instance. The config layer
// builds these and hands them to the relay core; the core never reads
// configuration itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which upstream family a binding talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// AWS-hosted code assistant; binary event-stream responses.
    Cwr,
    OpenaiCompatible,
    Gemini,
    AnthropicPassthrough,
}

/// Credential selection strategy for a binding.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    HealthBased,
    LeastUsed,
}

/// Per-binding rotation and health-tracking policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RotationPolicy {
    pub strategy: RotationStrategy,
    pub cooldown_ms: u64,
    pub max_errors_before_temp_disable: u32,
    pub temp_disable_ms: u64,
    pub max_refresh_failures: u32,
    /// Minimum interval between refresh attempts per credential.
    pub refresh_backoff_ms: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy {
            strategy: RotationStrategy::RoundRobin,
            cooldown_ms: 1_000,
            max_errors_before_temp_disable: 3,
            temp_disable_ms: 300_000,
            max_refresh_failures: 3,
            refresh_backoff_ms: 60_000,
        }
    }
}

/// A configured upstream provider instance.
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub name: String,
    pub kind: ProviderKind,
    /// Base endpoint, e.g. `https://codewhisperer.us-east-1.amazonaws.com`
    /// or an OpenAI-compatible server root.
    pub endpoint: String,
    /// Credential file paths owned by this binding.
    pub credential_paths: Vec<String>,
    /// Canonical model name → upstream model id.
    pub model_map: HashMap<String, String>,
    pub rotation: RotationPolicy,
    /// Pass-through only: strip tool blocks for upstreams known not to
    /// support them. Decided by configuration, never probed.
    pub passthrough_strip_tools: bool,
    /// Outbound HTTP timeout in seconds.
    pub http_timeout_secs: u64,
}

impl ProviderBinding {
    pub fn new(name: impl Into<String>, kind: ProviderKind, endpoint: impl Into<String>) -> Self {
        ProviderBinding {
            name: name.into(),
            kind,
            endpoint: endpoint.into(),
            credential_paths: Vec::new(),
            model_map: HashMap::new(),
            rotation: RotationPolicy::default(),
            passthrough_strip_tools: false,
            http_timeout_secs: 120,
        }
    }

    /// Upstream model id for a canonical model name. Names absent from the
    /// map pass through unchanged.
    pub fn upstream_model(&self, canonical: &str) -> String {
        self.model_map
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| canonical.to_string())
    }

    /// Reverse lookup: canonical model name for an upstream id, falling
    /// back to the id itself when unmapped.
    pub fn canonical_model(&self, upstream: &str) -> String {
        self.model_map
            .iter()
            .find(|(_, v)| v.as_str() == upstream)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| upstream.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_policy_defaults() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.strategy, RotationStrategy::RoundRobin);
        assert_eq!(policy.refresh_backoff_ms, 60_000);
        assert_eq!(policy.max_refresh_failures, 3);
    }

    #[test]
    fn test_model_mapping_round_trip() {
        let mut binding = ProviderBinding::new("cwr", ProviderKind::Cwr, "https://example.test");
        binding
            .model_map
            .insert("claude-sonnet".to_string(), "CLAUDE_SONNET_V1".to_string());

        assert_eq!(binding.upstream_model("claude-sonnet"), "CLAUDE_SONNET_V1");
        assert_eq!(binding.upstream_model("unmapped"), "unmapped");
        assert_eq!(binding.canonical_model("CLAUDE_SONNET_V1"), "claude-sonnet");
        assert_eq!(binding.canonical_model("other"), "other");
    }
}
