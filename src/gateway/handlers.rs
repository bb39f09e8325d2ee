use super::AppState;
use crate::broker::BrokerCapacity;
use crate::cloudflare::CloudflareApi;
use crate::error::{CarryError, ConfigError};
use crate::reconciler::{Reconciler, TunnelStatus, generate_subdomain};
use crate::services::{self, Protocol, ServiceSpec};
use crate::status::{effective_status, probe_ready};
use crate::store::keys;
use crate::supervisor::{CLOUDFLARED, cloudflared_args};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

// ─── Request bodies ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct ValidateBody {
    pub api_token: String,
    pub domain: String,
}

#[derive(Deserialize)]
pub(super) struct ProvisionBody {
    pub api_token: String,
    pub domain: String,
    pub subdomain: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct ServiceAddBody {
    pub name: String,
    pub port: u16,
    pub suffix: String,
    pub protocol: Protocol,
}

#[derive(Deserialize)]
pub(super) struct ServiceNameBody {
    pub name: String,
}

#[derive(Deserialize)]
pub(super) struct ServiceRenameBody {
    pub name: String,
    pub suffix: String,
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Mutating-endpoint error contract: `{ok: false, error}` with a non-2xx
/// status. Config problems are the caller's to fix (400); the rest is an
/// upstream failure (502).
fn error_response(err: &CarryError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        CarryError::Config(_) => StatusCode::BAD_REQUEST,
        CarryError::Provider(_) | CarryError::Broker(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"ok": false, "error": err.to_string()})))
}

struct CustomCredentials {
    api_token: String,
    domain: String,
    subdomain: String,
}

fn custom_credentials(state: &AppState) -> Result<CustomCredentials, CarryError> {
    let api_token = state
        .store
        .get_str(keys::CF_API_TOKEN)
        .ok_or(ConfigError::Missing { field: "api_token" })?;
    let domain = state
        .store
        .get_str(keys::CF_DOMAIN)
        .ok_or(ConfigError::Missing { field: "domain" })?;
    let subdomain = state
        .store
        .get_str(keys::CF_SUBDOMAIN)
        .ok_or(ConfigError::Missing { field: "subdomain" })?;
    Ok(CustomCredentials {
        api_token,
        domain,
        subdomain,
    })
}

fn reconciler_for(state: &AppState, creds: &CustomCredentials) -> Reconciler {
    Reconciler::new(
        CloudflareApi::new(state.config.api_base.clone(), creds.api_token.clone()),
        creds.domain.clone(),
        creds.subdomain.clone(),
    )
}

fn clear_custom_keys(state: &AppState) -> Result<(), CarryError> {
    state.store.remove(keys::CF_API_TOKEN)?;
    state.store.remove(keys::CF_DOMAIN)?;
    state.store.remove(keys::CF_SUBDOMAIN)?;
    state.store.remove(keys::TUNNEL_MODE)?;
    Ok(())
}

/// Catalog mutations converge the provider immediately when a custom tunnel
/// is live; public-mode layouts stay fixed until the next registration.
async fn reprovision_if_custom(state: &AppState) -> Result<(), CarryError> {
    if state.store.get_str(keys::TUNNEL_MODE).as_deref() != Some("custom") {
        return Ok(());
    }
    let creds = custom_credentials(state)?;
    let reconciler = reconciler_for(state, &creds);
    let provisioned = reconciler.ensure(&services::specs(&state.store)).await?;
    state
        .supervisor
        .start(
            CLOUDFLARED,
            &state.config.cloudflared.binary,
            &cloudflared_args(
                &provisioned.tunnel_token,
                state.config.cloudflared.metrics_port,
            ),
        )
        .await
}

// ─── Status ─────────────────────────────────────────────────────────────────

/// GET /api/tunnel/status — always 200 with best-effort data; a transient
/// provider outage must never break the dashboard.
pub(super) async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let mode = state.store.get_str(keys::TUNNEL_MODE);
    let domain = state.store.get_str(keys::CF_DOMAIN);
    let subdomain = state.store.get_str(keys::CF_SUBDOMAIN);
    let configured = mode.is_some();

    let tunnel = match custom_credentials(&state) {
        Ok(creds) => reconciler_for(&state, &creds)
            .tunnel_status()
            .await
            .unwrap_or_else(|e| {
                tracing::debug!("tunnel status unavailable: {e}");
                TunnelStatus::default()
            }),
        Err(_) => TunnelStatus::default(),
    };

    let urls: HashMap<String, String> = match mode.as_deref() {
        Some("custom") => match (subdomain.as_deref(), domain.as_deref()) {
            (Some(sub), Some(dom)) => services::specs(&state.store)
                .iter()
                .map(|s| (s.name.clone(), s.public_url(sub, dom)))
                .collect(),
            _ => HashMap::new(),
        },
        Some("public") => {
            let client = state.broker.lock().await;
            client
                .registration()
                .map(|r| r.urls.clone())
                .unwrap_or_default()
        }
        _ => HashMap::new(),
    };

    let daemon_running = state.supervisor.is_running(CLOUDFLARED).await;
    let probe = probe_ready(state.config.cloudflared.metrics_port).await;
    let effective = effective_status(probe, daemon_running, configured);

    Json(json!({
        "configured": configured,
        "domain": domain,
        "subdomain": subdomain,
        "tunnel": tunnel,
        "urls": urls,
        "services": services::catalog(&state.store),
        "cloudflared_daemon_status": if daemon_running { "running" } else { "stopped" },
        "effective_status": effective.as_str(),
        "tunnel_mode": mode.unwrap_or_else(|| "none".into()),
    }))
}

// ─── Custom mode ────────────────────────────────────────────────────────────

/// POST /api/tunnel/validate — read-only scope check, never mutates.
pub(super) async fn handle_validate(
    State(state): State<AppState>,
    Json(body): Json<ValidateBody>,
) -> impl IntoResponse {
    let api = CloudflareApi::new(state.config.api_base.clone(), body.api_token);
    // Subdomain is irrelevant for validation; any placeholder works.
    let reconciler = Reconciler::new(api, body.domain, "validate");
    Json(reconciler.validate().await)
}

/// POST /api/tunnel/provision — converge the provider, then persist the
/// credential. Rejection by the provider persists nothing.
pub(super) async fn handle_provision(
    State(state): State<AppState>,
    Json(body): Json<ProvisionBody>,
) -> impl IntoResponse {
    // Mode exclusivity: a live public registration is released first.
    {
        let registered = state.broker.lock().await.registration().is_some();
        if registered {
            if let Err(e) = state.broker.release().await {
                return error_response(&e);
            }
            let _ = state.store.remove(keys::TUNNEL_MODE);
        }
    }

    let subdomain = body
        .subdomain
        .filter(|s| !s.is_empty())
        .or_else(|| state.store.get_str(keys::CF_SUBDOMAIN))
        .unwrap_or_else(generate_subdomain);

    let api = CloudflareApi::new(state.config.api_base.clone(), body.api_token.clone());
    let reconciler = Reconciler::new(api, body.domain.clone(), subdomain.clone());
    let provisioned = match reconciler.ensure(&services::specs(&state.store)).await {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    let persisted = state
        .store
        .set(keys::CF_API_TOKEN, &body.api_token)
        .and_then(|()| state.store.set(keys::CF_DOMAIN, &body.domain))
        .and_then(|()| state.store.set(keys::CF_SUBDOMAIN, &subdomain))
        .and_then(|()| state.store.set(keys::TUNNEL_MODE, "custom"));
    if let Err(e) = persisted {
        return error_response(&e);
    }

    if let Err(e) = state
        .supervisor
        .start(
            CLOUDFLARED,
            &state.config.cloudflared.binary,
            &cloudflared_args(
                &provisioned.tunnel_token,
                state.config.cloudflared.metrics_port,
            ),
        )
        .await
    {
        return error_response(&e);
    }

    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "tunnel_id": provisioned.tunnel_id,
            "subdomain": subdomain,
            "urls": provisioned.urls,
        })),
    )
}

/// POST /api/tunnel/teardown
pub(super) async fn handle_teardown(State(state): State<AppState>) -> impl IntoResponse {
    let creds = match custom_credentials(&state) {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };
    let reconciler = reconciler_for(&state, &creds);
    if let Err(e) = reconciler.teardown(state.supervisor.as_ref()).await {
        return error_response(&e);
    }
    if let Err(e) = clear_custom_keys(&state) {
        return error_response(&e);
    }
    (StatusCode::OK, Json(json!({"ok": true})))
}

// ─── Public mode ────────────────────────────────────────────────────────────

/// POST /api/tunnel/public/enable — tears down a configured custom tunnel
/// first, then registers with the broker.
pub(super) async fn handle_public_enable(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.get_str(keys::TUNNEL_MODE).as_deref() == Some("custom") {
        let creds = match custom_credentials(&state) {
            Ok(c) => c,
            Err(e) => return error_response(&e),
        };
        let reconciler = reconciler_for(&state, &creds);
        if let Err(e) = reconciler.teardown(state.supervisor.as_ref()).await {
            return error_response(&e);
        }
        if let Err(e) = clear_custom_keys(&state) {
            return error_response(&e);
        }
    }

    let registration = match state.broker.register(&services::specs(&state.store)).await {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    if let Err(e) = state.store.set(keys::TUNNEL_MODE, "public") {
        return error_response(&e);
    }

    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "urls": registration.urls,
            "random_id": registration.random_id,
        })),
    )
}

/// POST /api/tunnel/public/disable
pub(super) async fn handle_public_disable(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.broker.release().await {
        return error_response(&e);
    }
    if state.store.get_str(keys::TUNNEL_MODE).as_deref() == Some("public") {
        if let Err(e) = state.store.remove(keys::TUNNEL_MODE) {
            return error_response(&e);
        }
    }
    (StatusCode::OK, Json(json!({"ok": true})))
}

/// GET /api/tunnel/public/status — always 200, capacity best-effort.
pub(super) async fn handle_public_status(State(state): State<AppState>) -> impl IntoResponse {
    let (registration, heartbeat) = {
        let client = state.broker.lock().await;
        (client.registration().cloned(), client.heartbeat_state())
    };
    let capacity = state.broker.capacity().await.unwrap_or_else(|e| {
        tracing::debug!("broker capacity unavailable: {e}");
        BrokerCapacity::default()
    });
    let daemon_running = state.supervisor.is_running(CLOUDFLARED).await;

    Json(json!({
        "mode": state.store.get_str(keys::TUNNEL_MODE).unwrap_or_else(|| "none".into()),
        "random_id": registration.as_ref().map(|r| r.random_id.clone()),
        "urls": registration.as_ref().map(|r| r.urls.clone()).unwrap_or_default(),
        "daemon_running": daemon_running,
        "degraded": heartbeat.degraded,
        "heartbeat_failures": heartbeat.consecutive_failures,
        "active_tunnels": capacity.active_tunnels,
        "max_tunnels": capacity.max_tunnels,
        "available": capacity.available,
    }))
}

// ─── Service catalog ────────────────────────────────────────────────────────

/// POST /api/tunnel/services/add
pub(super) async fn handle_service_add(
    State(state): State<AppState>,
    Json(body): Json<ServiceAddBody>,
) -> impl IntoResponse {
    let spec = ServiceSpec {
        name: body.name,
        port: body.port,
        suffix: body.suffix,
        protocol: body.protocol,
    };
    if let Err(e) = services::add_custom(&state.store, spec) {
        return error_response(&e);
    }
    if let Err(e) = reprovision_if_custom(&state).await {
        return error_response(&e);
    }
    (StatusCode::OK, Json(json!({"ok": true})))
}

/// POST /api/tunnel/services/remove
pub(super) async fn handle_service_remove(
    State(state): State<AppState>,
    Json(body): Json<ServiceNameBody>,
) -> impl IntoResponse {
    if let Err(e) = services::remove_custom(&state.store, &body.name) {
        return error_response(&e);
    }
    if let Err(e) = reprovision_if_custom(&state).await {
        return error_response(&e);
    }
    (StatusCode::OK, Json(json!({"ok": true})))
}

/// POST /api/tunnel/services/rename
pub(super) async fn handle_service_rename(
    State(state): State<AppState>,
    Json(body): Json<ServiceRenameBody>,
) -> impl IntoResponse {
    if let Err(e) = services::rename(&state.store, &body.name, &body.suffix) {
        return error_response(&e);
    }
    if let Err(e) = reprovision_if_custom(&state).await {
        return error_response(&e);
    }
    (StatusCode::OK, Json(json!({"ok": true})))
}
