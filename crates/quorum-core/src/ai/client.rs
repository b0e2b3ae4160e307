//! Provider adapter.
//!
//! `Provider` is the seam the agent session drives: one streaming call per
//! provider round, vendor differences normalized into `StreamPart` events.
//! `HttpProvider` is the production implementation over reqwest SSE.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::ai::config::{ApiFormat, AuthHeader, CallOptions, ProviderConfig};
use crate::ai::format;
use crate::ai::parsers::{AnthropicParser, OpenAIParser, SseParser};
use crate::ai::retry::is_retryable_status;
use crate::ai::sse::SseBuffer;
use crate::ai::streaming::StreamPart;
use crate::ai::types::ModelMessage;
use crate::error::EngineError;

const ERROR_BODY_EXCERPT: usize = 500;

/// A black-box streaming chat-completion channel.
///
/// Restartable: each turn gets a fresh receiver from a fresh call.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn stream_turn(
        &self,
        messages: Vec<ModelMessage>,
        options: &CallOptions,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>, EngineError>;
}

/// HTTP SSE provider for Anthropic- and OpenAI-format endpoints.
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn build_request(
        &self,
        messages: &[ModelMessage],
        options: &CallOptions,
    ) -> reqwest::RequestBuilder {
        let body = match self.config.api_format {
            ApiFormat::Anthropic => format::anthropic_request_body(&self.config, messages, options),
            ApiFormat::OpenAI => format::openai_request_body(&self.config, messages, options),
        };

        let mut request = self.client.post(self.config.api_url()).json(&body);

        request = match self.config.auth_header {
            AuthHeader::XApiKey => request
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", "2023-06-01"),
            AuthHeader::Bearer => request.bearer_auth(&self.config.api_key),
        };

        for (name, value) in &self.config.custom_headers {
            request = request.header(name, value);
        }

        request
    }

    fn make_parser(&self) -> Box<dyn SseParser> {
        match self.config.api_format {
            ApiFormat::Anthropic => Box::new(AnthropicParser::new()),
            ApiFormat::OpenAI => Box::new(OpenAIParser::new()),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn stream_turn(
        &self,
        messages: Vec<ModelMessage>,
        options: &CallOptions,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>, EngineError> {
        info!(
            model = %self.config.model,
            format = ?self.config.api_format,
            messages = messages.len(),
            tools = options.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "provider stream starting"
        );

        let response = self
            .build_request(&messages, options)
            .send()
            .await
            .map_err(|e| EngineError::provider(format!("request failed: {}", e), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
            error!(status = status.as_u16(), "provider returned error status");
            return Err(EngineError::Provider {
                message: format!("provider status {}: {}", status.as_u16(), excerpt),
                retryable: is_retryable_status(status.as_u16()),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut parser = self.make_parser();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = SseBuffer::new();
            let mut chunk_count: u64 = 0;

            while let Some(chunk) = stream.next().await {
                chunk_count += 1;
                match chunk {
                    Ok(bytes) => {
                        for payload in buffer.push(&bytes) {
                            for part in parser.parse_data(&payload) {
                                let done = matches!(
                                    part,
                                    StreamPart::TurnDone { .. } | StreamPart::Error { .. }
                                );
                                if tx.send(part).is_err() {
                                    return; // receiver dropped, turn cancelled
                                }
                                if done {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("provider read error at chunk #{}: {}", chunk_count, e);
                        let _ = tx.send(StreamPart::Error {
                            error: format!("stream read error: {}", e),
                            retryable: true,
                        });
                        return;
                    }
                }
            }

            // Stream ended without an explicit done marker; never leave the
            // receiver waiting on a silently-dead channel.
            debug!("provider stream ended after {} chunks", chunk_count);
            for part in parser.finish() {
                let _ = tx.send(part);
            }
        });

        Ok(rx)
    }
}
