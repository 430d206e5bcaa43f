pub mod api;
pub mod health;
pub mod internal;
pub mod webhooks;

use crate::http_auth;
use axum::{Json, Router, middleware};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use inbox_store::StoreError;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

/// Only health and operator routes are bounded by `request_timeout`;
/// webhook ingest and sweeps always run to completion.
pub fn router(request_timeout: Duration) -> Router {
    let bounded = Router::new()
        .merge(health::router())
        .merge(api::router().layer(middleware::from_fn(http_auth::require_operator_auth)))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));
    Router::new()
        .merge(bounded)
        .merge(webhooks::router())
        .merge(internal::router())
}

pub(crate) fn error_response(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": error.to_string() })),
    )
        .into_response()
}

/// Store lookups that miss map to 404; everything else is a 500.
pub(crate) fn internal_error(err: anyhow::Error) -> Response {
    let not_found = err
        .downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_not_found);
    if not_found {
        return error_response(StatusCode::NOT_FOUND, err);
    }
    tracing::error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
}
