pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod session;
pub mod websocket;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::SyncClient;
use crate::config::Config;
use crate::session::{resolve_access_token, StreamQuery};

/// Shared handler state: the resolved configuration plus one reqwest client
/// whose connection pool is reused across bridge instances. All sync state is
/// per-connection; nothing here is shared between bridges.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            // no client-side timeout: long polls block as long as the
            // upstream's own timeout allows
            http: reqwest::Client::new(),
        }
    }

    /// Shared per-connection construction: resolve the credential and build
    /// the upstream client. Both streaming endpoints go through here.
    pub fn sync_client(&self, headers: &HeaderMap, query: &StreamQuery) -> SyncClient {
        SyncClient::new(
            self.http.clone(),
            self.config.upstream_url.clone(),
            resolve_access_token(headers, query),
            self.config.sync_timeout_ms,
        )
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stream", get(websocket::stream_handler))
        .route("/events", get(events::events_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "ok"
}
