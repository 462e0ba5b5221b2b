use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use bridge_server::alerts::{AlertService, AlertSink};
use bridge_server::api::RetryPolicy;
use bridge_server::config::Config;
use bridge_server::github::GitHubClient;
use bridge_server::graph::GraphClient;
use bridge_server::inbound::InboundProcessor;
use bridge_server::outbound::OutboundProcessor;
use bridge_server::store::Store;
use bridge_server::webhook::webhook_router;
use bridge_server::AppState;

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "env": state.config.app_env,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting GitHub issue email bridge");

    let config = Config::from_env()?;

    let store = Arc::new(Store::new(&config.database_path)?);
    info!(database = %config.database_path.display(), "Opened bridge database");

    let policy = RetryPolicy::new(
        config.api_retry_max_attempts,
        config.api_retry_base_delay_seconds,
        config.api_retry_max_delay_seconds,
    );
    let graph_client = Arc::new(GraphClient::new(
        config.graph_tenant_id.clone(),
        config.graph_client_id.clone(),
        config.graph_client_secret.clone(),
        policy,
    ));
    let github_client = Arc::new(GitHubClient::new(config.github_token.clone(), policy));
    let alerts: Arc<dyn AlertSink> = Arc::new(AlertService::new(&config, graph_client.clone()));

    let inbound = InboundProcessor::new(
        &config,
        store.clone(),
        graph_client.clone(),
        github_client,
        alerts.clone(),
    );
    let outbound = OutboundProcessor::new(&config, store.clone(), graph_client, alerts.clone());

    let bind_addr = format!("{}:{}", config.app_host, config.app_port);
    let app_state = Arc::new(AppState {
        config,
        store,
        inbound,
        outbound,
        alerts,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
