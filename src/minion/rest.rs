//! Runtime spot configuration over HTTP.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/spot_instance_config` | Persisted `{status, asgs}` |
//! | PUT | `/spot_instance_config?enabled=<bool>&asgs=<names>` | Persist and apply |

use crate::config::parse_bool;
use crate::kubernetes::SettingsStore;
use crate::minion::MinionManager;
use crate::utils::split_names;
use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct RestState {
    pub settings: Arc<dyn SettingsStore>,
    pub manager: Arc<MinionManager>,
}

pub fn router(state: RestState) -> Router {
    Router::new()
        .route("/spot_instance_config", get(get_config).put(update_config))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: RestState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Minion manager REST API listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (status, Json(json!({ "status": "error", "error": msg }))).into_response()
}

async fn get_config(State(state): State<RestState>) -> Response {
    match state.settings.load().await {
        Ok(s) => Json(json!({ "status": s.enabled, "asgs": s.asgs })).into_response(),
        Err(e) => {
            error!("Reading spot settings failed: {:#}", e);
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateParams {
    pub enabled: Option<String>,
    pub asgs: Option<String>,
}

async fn update_config(State(state): State<RestState>, Query(params): Query<UpdateParams>) -> Response {
    let Some(raw) = params.enabled.as_deref() else {
        return error_response("enabled is required", StatusCode::BAD_REQUEST);
    };
    let enabled = match parse_bool("enabled", raw) {
        Ok(b) => b,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    // Stored the way the config map has always held it.
    let enabled_str = if enabled { "True" } else { "False" };
    let asgs = params.asgs.as_deref().filter(|a| !a.trim().is_empty());

    if let Err(e) = state.settings.save(enabled_str, asgs).await {
        error!("Saving spot settings failed: {:#}", e);
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    if let Some(asgs) = asgs
        && let Err(e) = state.manager.set_scaling_groups(split_names(asgs)).await
    {
        error!("Reloading autoscaling groups failed: {:#}", e);
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    state.manager.advisor().set_spot_enabled(enabled);
    Json(json!({ "status": "ok" })).into_response()
}
