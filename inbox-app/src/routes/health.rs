use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let database = state.store.ping().await;
    let ready = database.is_ok();
    let database_error = database.err().map(|e| e.to_string());
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ok" } else { "degraded" },
            "ready": ready,
            "checked_at": Utc::now(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "checks": {
                "database": {
                    "ok": ready,
                    "error": database_error,
                },
                "ai_replies": state.scheduler.is_some(),
                "channels": state.channels.channels(),
            }
        })),
    )
}
