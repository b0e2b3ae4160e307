//! Quorum Server
//!
//! WebSocket and HTTP transport for the quorum agent runtime. This is a
//! library crate — the server is started via `start_server()`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::Method, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use quorum_core::{
    ActionHandler, ActionRegistry, ActionRegistryBuilder, ApiFormat, AuthHeader, DelegationConfig,
    Engine, EngineConfig, HttpProvider, ProviderConfig, SessionConfig,
};

pub mod config;
pub mod error;
pub mod routes;
pub mod types;
pub mod ws;

pub use config::ServerConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Build the provider from config. The matching `*_API_KEY` environment
/// variable must be set; keys are never read from the config file.
fn build_provider(config: &ServerConfig) -> anyhow::Result<HttpProvider> {
    let format = match config.provider.format.as_deref() {
        Some("openai") => ApiFormat::OpenAI,
        Some("anthropic") | None => ApiFormat::Anthropic,
        Some(other) => anyhow::bail!("unknown provider '{}'", other),
    };

    let (key_var, auth_header, default_model) = match format {
        ApiFormat::Anthropic => (
            "ANTHROPIC_API_KEY",
            AuthHeader::XApiKey,
            "claude-sonnet-4-20250514",
        ),
        ApiFormat::OpenAI => ("OPENAI_API_KEY", AuthHeader::Bearer, "gpt-4o"),
    };
    let api_key = std::env::var(key_var)
        .map_err(|_| anyhow::anyhow!("{} is not set; chat is unavailable without it", key_var))?;

    let provider_config = ProviderConfig {
        model: config
            .provider
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        base_url: config.provider.base_url.clone(),
        auth_header,
        api_format: format,
        api_key,
        ..ProviderConfig::default()
    };
    Ok(HttpProvider::new(provider_config))
}

/// Load the static action table, if configured.
fn build_actions(config: &ServerConfig) -> anyhow::Result<ActionRegistryBuilder> {
    let builder = ActionRegistry::builder();
    let Some(path) = &config.actions_path else {
        return Ok(builder);
    };
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read action table {}: {}", path, e))?;
    // The table binds handlers by name; the server only ships direct-call
    // entries, so no handler refs resolve here.
    let handlers: HashMap<String, Arc<dyn ActionHandler>> = HashMap::new();
    let builder = builder
        .load_table(&yaml, &handlers)
        .map_err(|e| anyhow::anyhow!("invalid action table {}: {}", path, e))?;
    tracing::info!(path, "loaded action table");
    Ok(builder)
}

fn engine_config(config: &ServerConfig) -> EngineConfig {
    let mut session = SessionConfig {
        allowed_nodes: config.allowed_nodes.iter().cloned().collect(),
        system_prompt: config.system_prompt.clone(),
        ..SessionConfig::default()
    };
    if let Some(max_rounds) = config.max_rounds {
        session.max_rounds = max_rounds;
    }

    let mut delegation = DelegationConfig::default();
    if let Some(secs) = config.delegation.deadline_secs {
        delegation.deadline = Duration::from_secs(secs);
    }
    if let Some(fail_fast) = config.delegation.fail_fast {
        delegation.fail_fast = fail_fast;
    }

    EngineConfig {
        session,
        delegation,
        ..EngineConfig::default()
    }
}

/// Build the Axum router and its shared state.
pub fn build_router(config: &ServerConfig) -> anyhow::Result<(Router, AppState)> {
    let provider = build_provider(config)?;
    let actions = build_actions(config)?;
    let engine = Engine::new(Arc::new(provider), actions, engine_config(config));
    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws/chat", get(ws::handler))
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    Ok((app, state))
}

/// Start the server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port()).parse()?;
    let (app, _state) = build_router(&config)?;

    tracing::info!("Quorum server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: HashMap::from([("chat".to_string(), true), ("delegation".to_string(), true)]),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    features: HashMap<String, bool>,
}
