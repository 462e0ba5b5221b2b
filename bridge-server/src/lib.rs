pub mod alerts;
pub mod api;
pub mod config;
pub mod email;
pub mod github;
pub mod graph;
pub mod inbound;
pub mod issue_body;
pub mod outbound;
pub mod retry_queue;
pub mod store;
pub mod subscription;
pub mod token;
pub mod webhook;

use std::sync::Arc;

use alerts::AlertSink;
use config::Config;
use inbound::InboundProcessor;
use outbound::OutboundProcessor;
use store::Store;

/// Shared state handed to every axum handler.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub inbound: InboundProcessor,
    pub outbound: OutboundProcessor,
    pub alerts: Arc<dyn AlertSink>,
}
