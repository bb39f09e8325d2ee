//! Axum-based control gateway.
//!
//! Serves the JSON interface the dashboard talks to: tunnel status,
//! credential validation, custom-mode provisioning/teardown, public-mode
//! enable/disable, and service catalog management. Body limits and request
//! timeouts are enforced at the router layer.

mod handlers;

use crate::broker::{BrokerClient, BrokerHandle};
use crate::config::Config;
use crate::store::{StateStore, keys};
use crate::supervisor::{LocalSupervisor, ProcessSupervisor};
use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use handlers::{
    handle_provision, handle_public_disable, handle_public_enable, handle_public_status,
    handle_service_add, handle_service_remove, handle_service_rename, handle_status,
    handle_teardown, handle_validate,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout — long enough for a full reconciliation pass.
pub const REQUEST_TIMEOUT_SECS: u64 = 90;

/// Shared state for all axum handlers. The broker handle is the explicit
/// context-owned singleton; no module-level globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<StateStore>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub broker: BrokerHandle,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<StateStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        let broker = BrokerHandle::new(BrokerClient::new(
            config.broker.url.clone(),
            config.broker.secret.clone(),
            Arc::clone(&store),
            Arc::clone(&supervisor),
            config.cloudflared.binary.clone(),
            config.cloudflared.metrics_port,
        ));
        Self {
            config,
            store,
            supervisor,
            broker,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tunnel/status", get(handle_status))
        .route("/api/tunnel/validate", post(handle_validate))
        .route("/api/tunnel/provision", post(handle_provision))
        .route("/api/tunnel/teardown", post(handle_teardown))
        .route("/api/tunnel/public/enable", post(handle_public_enable))
        .route("/api/tunnel/public/disable", post(handle_public_disable))
        .route("/api/tunnel/public/status", get(handle_public_status))
        .route("/api/tunnel/services/add", post(handle_service_add))
        .route("/api/tunnel/services/remove", post(handle_service_remove))
        .route("/api/tunnel/services/rename", post(handle_service_rename))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Run the gateway, restoring a persisted public registration first so a
/// process restart self-heals without operator action.
pub async fn run_gateway(config: Config) -> Result<()> {
    let store = Arc::new(StateStore::open(config.state_path.clone())?);
    let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(LocalSupervisor::new());
    let config = Arc::new(config);
    let state = AppState::new(Arc::clone(&config), Arc::clone(&store), supervisor);

    if store.get_str(keys::TUNNEL_MODE).as_deref() == Some("public") {
        let services = crate::services::specs(&store);
        match state.broker.restore(&services).await {
            Ok(registration) => {
                tracing::info!("public tunnel restored: {}", registration.random_id);
            }
            Err(e) => tracing::error!("failed to restore public tunnel: {e}"),
        }
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🚇 comfycarry gateway listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
