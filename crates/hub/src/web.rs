use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::{now_ms, Db};
use crate::registry::Registry;
use crate::state::SharedState;
use crate::ws;

const DEFAULT_READINGS_LIMIT: i64 = 100;
const MAX_READINGS_LIMIT: i64 = 1000;
const ALERTS_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub registry: Registry,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Store failure surfaced as a 500.
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("api error: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

fn not_found(what: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": what }))).into_response()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sensors", get(api_sensors))
        .route("/api/sensors/{sensor_id}/readings", get(api_readings))
        .route("/api/alerts", get(api_alerts))
        .route("/api/alerts/{id}/resolve", post(api_resolve_alert))
        .route("/ws", get(ws::upgrade))
        .with_state(state)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let clients = app.registry.connection_count();
    let st = app.shared.read().await;
    Json(st.to_status(clients))
}

async fn api_sensors(State(app): State<AppState>) -> Result<Response, ApiError> {
    let sensors = app.db.load_sensors().await?;
    Ok(Json(sensors).into_response())
}

#[derive(Deserialize)]
struct ReadingsQuery {
    limit: Option<i64>,
}

async fn api_readings(
    State(app): State<AppState>,
    Path(sensor_id): Path<String>,
    Query(q): Query<ReadingsQuery>,
) -> Result<Response, ApiError> {
    if app.db.get_sensor(&sensor_id).await?.is_none() {
        return Ok(not_found(format!("unknown sensor '{sensor_id}'")));
    }
    let limit = q
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .clamp(1, MAX_READINGS_LIMIT);
    let readings = app.db.readings_for_sensor(&sensor_id, limit).await?;
    Ok(Json(readings).into_response())
}

#[derive(Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    include_resolved: bool,
}

async fn api_alerts(
    State(app): State<AppState>,
    Query(q): Query<AlertsQuery>,
) -> Result<Response, ApiError> {
    let alerts = app.db.list_alerts(q.include_resolved, ALERTS_LIMIT).await?;
    Ok(Json(alerts).into_response())
}

async fn api_resolve_alert(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    if !app.db.resolve_alert(id, now_ms()).await? {
        return Ok(not_found(format!("no open alert with id {id}")));
    }
    let alert = app.db.get_alert(id).await?;
    info!(alert = id, "alert resolved");
    Ok(Json(alert).into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
