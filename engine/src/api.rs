// --- HTTP API ------------------------------------------------------------------
//
//   GET  /api/stream/status   -> { playing, state }
//   POST /api/stream/start    { stationId? }  -> { success, message } | 500 { error, message, details }
//   POST /api/stream/stop                     -> { success, message } | 500 { error }
//   POST /api/stream/volume   { volume }      -> { success, message } | 400/500 { error }
//
// Everything else falls through to the static dashboard. The whole router sits
// behind Basic auth.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    auth::{require_basic_auth, Credentials},
    supervisor::{StreamStatus, StreamSupervisor},
    volume::VolumeError,
};

type AppState = Arc<StreamSupervisor>;

pub fn build_router(supervisor: AppState, creds: Credentials, public_dir: &str) -> Router {
    let stream = Router::new()
        .route("/status", get(api_stream_status))
        .route("/start", post(api_stream_start))
        .route("/stop", post(api_stream_stop))
        .route("/volume", post(api_stream_volume))
        .with_state(supervisor);

    Router::new()
        .nest("/api/stream", stream)
        .fallback_service(ServeDir::new(public_dir))
        .layer(middleware::from_fn_with_state(Arc::new(creds), require_basic_auth))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartReq {
    station_id: Option<String>,
}

async fn api_stream_status(State(sup): State<AppState>) -> Json<StreamStatus> {
    Json(sup.status().await)
}

// A missing or unparsable body just means "default station".
async fn api_stream_start(State(sup): State<AppState>, body: Option<Json<StartReq>>) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    match sup.start(req.station_id).await {
        Ok(url) => Json(json!({
            "success": true,
            "message": "Stream started",
            "url": url,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Failed to start stream",
                "message": e.to_string(),
                "details": e.details(),
            })),
        )
            .into_response(),
    }
}

async fn api_stream_stop(State(sup): State<AppState>) -> Response {
    match sup.stop().await {
        Ok(_) => Json(json!({"success": true, "message": "Stream stopped"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Integral JSON numbers only: 50 and 50.0 pass, 50.5 and "50" do not.
fn volume_level(body: &Value) -> Option<i64> {
    let v = body.get("volume")?;
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    let f = v.as_f64()?;
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
}

fn invalid_volume() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Volume must be a number between 0 and 100"})),
    )
        .into_response()
}

async fn api_stream_volume(State(sup): State<AppState>, body: Option<Json<Value>>) -> Response {
    let level = body.as_ref().and_then(|Json(v)| volume_level(v));
    let Some(level) = level else {
        return invalid_volume();
    };

    match sup.set_volume(level).await {
        Ok(percent) => Json(json!({
            "success": true,
            "message": format!("Volume set to {percent}%"),
        }))
        .into_response(),
        Err(VolumeError::InvalidInput(_)) => invalid_volume(),
        Err(e @ VolumeError::Mixer(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
