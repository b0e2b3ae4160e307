//! Provider client configuration.
//!
//! Provider-agnostic settings for one LLM endpoint plus per-call options.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ai::types::AiTool;

const DEFAULT_MAX_TOKENS: usize = 8192;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Wire format of the provider API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    #[default]
    Anthropic,
    OpenAI,
}

/// How the API key is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthHeader {
    /// `x-api-key: <key>` (Anthropic style)
    #[default]
    XApiKey,
    /// `Authorization: Bearer <key>` (OpenAI style)
    Bearer,
}

/// Configuration for one provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Model ID sent in every request.
    pub model: String,
    /// Maximum output tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Base URL override (defaults to the format's canonical endpoint).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth_header: AuthHeader,
    #[serde(default)]
    pub api_format: ApiFormat,
    /// API key; loaded from the environment by the server, never from disk.
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Extra headers to send with every request.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// Per-call HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            base_url: None,
            auth_header: AuthHeader::default(),
            api_format: ApiFormat::default(),
            api_key: String::new(),
            custom_headers: HashMap::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ProviderConfig {
    /// The endpoint to POST streaming requests to.
    pub fn api_url(&self) -> String {
        if let Some(base) = &self.base_url {
            return base.clone();
        }
        match self.api_format {
            ApiFormat::Anthropic => "https://api.anthropic.com/v1/messages".to_string(),
            ApiFormat::OpenAI => "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-call options for one provider round.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Node-scoped tool schema visible to this session.
    pub tools: Option<Vec<AiTool>>,
    pub system_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_defaults_per_format() {
        let anthropic = ProviderConfig {
            api_format: ApiFormat::Anthropic,
            ..Default::default()
        };
        assert!(anthropic.api_url().contains("anthropic.com"));

        let openai = ProviderConfig {
            api_format: ApiFormat::OpenAI,
            ..Default::default()
        };
        assert!(openai.api_url().contains("openai.com"));

        let custom = ProviderConfig {
            base_url: Some("http://localhost:9999/v1/messages".to_string()),
            ..Default::default()
        };
        assert_eq!(custom.api_url(), "http://localhost:9999/v1/messages");
    }
}
