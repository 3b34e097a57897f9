//! Liveness and readiness oracle over the OpenVPN status file.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::Local;

use crate::constants::{READINESS_PORT, SEED_CLIENT_PREFIX, SHOOT_CLIENT_PREFIX};

use super::status::OpenVpnStatus;

/// Interval in seconds at which OpenVPN rewrites the status file.
pub const STATUS_UPDATE_INTERVAL: i64 = 15;

/// Configuration of the health endpoint server.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub status_path: String,
    pub update_interval: i64,
    pub is_ha: bool,
}

impl HealthConfig {
    pub fn new(status_path: String, is_ha: bool) -> Self {
        Self {
            status_path,
            update_interval: STATUS_UPDATE_INTERVAL,
            is_ha,
        }
    }
}

/// The tunnel is alive while the status file keeps being rewritten: the last
/// update must lie within `update_interval` plus a two second grace.
pub fn is_up(status: &OpenVpnStatus, update_interval: i64) -> bool {
    let Some(updated_at) = status.updated_at else {
        return false;
    };
    let last_update = Local::now().naive_local() - updated_at;
    let alive = last_update.num_seconds() <= update_interval + 2;
    if !alive {
        tracing::info!(?last_update, "OpenVPN status is stale");
    }
    alive
}

/// Whether the tunnel exchange has converged.
///
/// HA mode needs at least one seed client and one shoot client connected.
/// Non-HA mode is ready with no clients at all (the shoot connects after the
/// rollout) or with at least one shoot client.
pub fn is_ready(status: &OpenVpnStatus, is_ha: bool) -> bool {
    if is_ha {
        let found_seed = status
            .clients
            .iter()
            .any(|c| c.common_name.starts_with(SEED_CLIENT_PREFIX));
        let found_shoot = status
            .clients
            .iter()
            .any(|c| c.common_name.starts_with(SHOOT_CLIENT_PREFIX));
        let ready = found_seed && found_shoot;
        if !ready {
            tracing::info!(found_seed, found_shoot, "missing required clients for HA mode");
        }
        return ready;
    }

    if status.clients.is_empty() {
        return true;
    }
    if status
        .clients
        .iter()
        .any(|c| c.common_name.starts_with(SHOOT_CLIENT_PREFIX))
    {
        return true;
    }
    tracing::info!(clients = status.clients.len(), "no shoot client connected yet");
    false
}

pub fn router(config: Arc<HealthConfig>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(config)
}

/// Serves `/healthz` (liveness) and `/readyz` (readiness) on the readiness
/// port, parsing the status file per request.
pub async fn serve(config: HealthConfig) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("::", READINESS_PORT)).await?;
    tracing::info!(port = READINESS_PORT, "serving OpenVPN health endpoints");
    axum::serve(listener, router(Arc::new(config))).await
}

async fn healthz(State(config): State<Arc<HealthConfig>>) -> (StatusCode, &'static str) {
    match OpenVpnStatus::parse_file(&config.status_path) {
        Ok(status) if is_up(&status, config.update_interval) => (StatusCode::OK, "ok"),
        Ok(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ok"),
        Err(e) => {
            tracing::error!(path = %config.status_path, error = %e, "failed to parse status file");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn readyz(State(config): State<Arc<HealthConfig>>) -> (StatusCode, &'static str) {
    match OpenVpnStatus::parse_file(&config.status_path) {
        Ok(status) if is_ready(&status, config.is_ha) => (StatusCode::OK, "ready"),
        Ok(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        Err(e) => {
            tracing::error!(path = %config.status_path, error = %e, "failed to parse status file");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
