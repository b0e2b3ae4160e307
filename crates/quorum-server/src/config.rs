//! Server configuration.
//!
//! Loaded from an optional TOML file named by `QUORUM_CONFIG`, then
//! overridden by environment variables. API keys come from the environment
//! only, never from the file.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on (default: 3000).
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub provider: ProviderSection,
    /// Path to the static YAML action table.
    #[serde(default)]
    pub actions_path: Option<String>,
    /// Nodes sessions may dispatch into by default.
    #[serde(default)]
    pub allowed_nodes: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Provider-round cap per turn.
    #[serde(default)]
    pub max_rounds: Option<usize>,
    #[serde(default)]
    pub delegation: DelegationSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSection {
    /// `anthropic` (default) or `openai`.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DelegationSection {
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub fail_fast: Option<bool>,
}

impl ServerConfig {
    /// Load the file named by `QUORUM_CONFIG` (if set) and apply env
    /// overrides on top.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("QUORUM_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path, e))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path, e))?
            }
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.port = Some(port);
            }
        }
        if let Ok(format) = std::env::var("QUORUM_PROVIDER") {
            self.provider.format = Some(format);
        }
        if let Ok(model) = std::env::var("QUORUM_MODEL") {
            self.provider.model = Some(model);
        }
        if let Ok(base_url) = std::env::var("QUORUM_BASE_URL") {
            self.provider.base_url = Some(base_url);
        }
        if let Ok(path) = std::env::var("QUORUM_ACTIONS") {
            self.actions_path = Some(path);
        }
        if let Ok(nodes) = std::env::var("QUORUM_ALLOWED_NODES") {
            self.allowed_nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(prompt) = std::env::var("QUORUM_SYSTEM_PROMPT") {
            self.system_prompt = Some(prompt);
        }
        if let Ok(rounds) = std::env::var("QUORUM_MAX_ROUNDS") {
            if let Ok(rounds) = rounds.parse() {
                self.max_rounds = Some(rounds);
            }
        }
        if let Ok(secs) = std::env::var("QUORUM_DELEGATION_DEADLINE_SECS") {
            if let Ok(secs) = secs.parse() {
                self.delegation.deadline_secs = Some(secs);
            }
        }
        if let Ok(fail_fast) = std::env::var("QUORUM_DELEGATION_FAIL_FAST") {
            self.delegation.fail_fast = Some(fail_fast == "1" || fail_fast == "true");
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(3000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_toml() {
        let raw = r#"
port = 8080
actions_path = "actions.yaml"
allowed_nodes = ["math", "crm"]
system_prompt = "Be brief."
max_rounds = 20

[provider]
format = "openai"
model = "gpt-4o"
base_url = "http://localhost:9999/v1/chat/completions"

[delegation]
deadline_secs = 60
fail_fast = true
"#;
        let config: ServerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.port(), 8080);
        assert_eq!(config.allowed_nodes, vec!["math", "crm"]);
        assert_eq!(config.provider.format.as_deref(), Some("openai"));
        assert_eq!(config.delegation.deadline_secs, Some(60));
        assert_eq!(config.delegation.fail_fast, Some(true));
        assert_eq!(config.max_rounds, Some(20));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.port(), 3000);
        assert!(config.allowed_nodes.is_empty());
        assert!(config.provider.format.is_none());
    }
}
