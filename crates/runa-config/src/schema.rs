// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tool_protocol: ToolProtocolConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Chat-completion provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Model identifier forwarded to the provider API.
    pub model: String,
    /// API base that ends before `/chat/completions`,
    /// e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable holding the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "ProviderConfig::default_timeout_s")]
    pub timeout_s: u64,
}

impl ProviderConfig {
    fn default_timeout_s() -> u64 {
        300
    }

    /// Resolve the effective API key: explicit value wins, then the named
    /// environment variable.  `None` means an unauthenticated local server.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            timeout_s: Self::default_timeout_s(),
        }
    }
}

/// Per-session defaults copied into each new session's request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Total-token count that triggers history compaction.
    pub compaction_threshold: u64,
    /// Messages preserved verbatim at the start of the logical history.
    pub compaction_keep_head: usize,
    /// Messages preserved verbatim at the end of the logical history.
    pub compaction_keep_tail: usize,
    /// Optional cheaper model used for the summarization request only.
    /// The provider connection is shared either way so the prefix KV cache
    /// stays warm.
    pub compaction_model: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 150_000,
            compaction_keep_head: 2,
            compaction_keep_tail: 6,
            compaction_model: None,
        }
    }
}

/// Skill discovery roots.  Project directories shadow global ones by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default)]
    pub global_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub project_dirs: Vec<PathBuf>,
}

/// Named hooks to load, in order.  Unknown names fail pipeline construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    pub enabled: Vec<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["skills_injector".into(), "compactor".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the SQLite database file.  `:memory:` is accepted for tests.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("runa").join("runa.db"),
        }
    }
}

/// One MCP tool server to connect to at session creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ToolServerSpec {
    Stdio {
        /// Server name used to disambiguate colliding tool names.
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: std::collections::HashMap<String, String>,
    },
    Http {
        name: String,
        url: String,
    },
    Sse {
        name: String,
        url: String,
    },
}

impl ToolServerSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Stdio { name, .. } | Self::Http { name, .. } | Self::Sse { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolProtocolConfig {
    #[serde(default)]
    pub servers: Vec<ToolServerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Safety ceiling on model↔tool rounds within one prompt call.
    pub max_turns: u32,
    /// Persist the accumulator after every streamed chunk instead of only at
    /// cancellation points.  Trades write latency for the tightest possible
    /// cancellation window.
    #[serde(default)]
    pub checkpoint_on_every_token: bool,
    /// Retry attempts for transient provider failures before surfacing them.
    #[serde(default = "EngineConfig::default_provider_retries")]
    pub provider_retries: u32,
    /// Cap on persisted tool-result size, in approximate tokens.  Zero
    /// disables truncation.
    #[serde(default = "EngineConfig::default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
}

impl EngineConfig {
    fn default_provider_retries() -> u32 {
        3
    }
    fn default_tool_result_token_cap() -> usize {
        8_192
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 1_000,
            checkpoint_on_every_token: false,
            provider_retries: Self::default_provider_retries(),
            tool_result_token_cap: Self::default_tool_result_token_cap(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_complete() {
        let c = Config::default();
        assert_eq!(c.provider.model, "gpt-4o");
        assert_eq!(c.session.compaction_keep_head, 2);
        assert!(c.engine.max_turns >= 100);
        assert!(c.hooks.enabled.contains(&"compactor".to_string()));
    }

    #[test]
    fn provider_api_key_explicit_wins_over_env() {
        let p = ProviderConfig {
            api_key: Some("sk-explicit".into()),
            api_key_env: Some("PATH".into()), // guaranteed set, must be ignored
            ..ProviderConfig::default()
        };
        assert_eq!(p.resolve_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn provider_api_key_env_fallback() {
        let p = ProviderConfig {
            api_key: None,
            api_key_env: Some("RUNA_TEST_KEY_VAR_UNSET_XYZ".into()),
            ..ProviderConfig::default()
        };
        assert_eq!(p.resolve_api_key(), None);
    }

    #[test]
    fn tool_server_spec_parses_tagged_yaml() {
        let yaml = r#"
transport: stdio
name: files
command: mcp-files
args: ["--root", "/tmp"]
"#;
        let spec: ToolServerSpec = serde_yaml::from_str(yaml).unwrap();
        match &spec {
            ToolServerSpec::Stdio { name, command, args, .. } => {
                assert_eq!(name, "files");
                assert_eq!(command, "mcp-files");
                assert_eq!(args, &["--root", "/tmp"]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert_eq!(spec.name(), "files");
    }

    #[test]
    fn tool_server_spec_sse_variant() {
        let yaml = "transport: sse\nname: search\nurl: https://example.com/mcp\n";
        let spec: ToolServerSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec, ToolServerSpec::Sse { name: "search".into(), url: "https://example.com/mcp".into() });
    }

    #[test]
    fn engine_config_defaults_via_serde() {
        let e: EngineConfig = serde_yaml::from_str("max_turns: 10").unwrap();
        assert_eq!(e.max_turns, 10);
        assert!(!e.checkpoint_on_every_token);
        assert_eq!(e.provider_retries, 3);
    }
}
