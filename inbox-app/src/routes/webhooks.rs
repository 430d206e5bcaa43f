//! Provider webhook ingress. POST handlers always answer 200 so providers
//! never retry into the dedup layer; failures are logged and dropped.

use crate::ingest::IngestReport;
use crate::server::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use inbox_channels::{
    Channel, SubscriptionQuery, TELEGRAM_SECRET_HEADER, verify_meta_signature,
    verify_subscription, verify_telegram_secret,
};
use inbox_store::WorkspaceId;
use std::sync::Arc;

const META_SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/webhooks/{channel}",
            get(verify_meta_subscription).post(receive_meta),
        )
        .route("/webhooks/telegram/{workspace_id}", post(receive_telegram))
}

fn meta_channel(raw: &str) -> Option<Channel> {
    raw.parse::<Channel>().ok().filter(|c| c.is_meta())
}

fn accepted(stored: usize) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "stored": stored })),
    )
        .into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Ingest runs on its own task so a dropped connection cannot cancel it
/// between the dedup insert and profile enrichment.
fn flatten(
    joined: Result<anyhow::Result<IngestReport>, tokio::task::JoinError>,
) -> anyhow::Result<IngestReport> {
    joined.map_err(|e| anyhow::anyhow!("ingest task failed: {e}"))?
}

fn log_report(channel: Channel, report: &IngestReport) {
    tracing::info!(
        %channel,
        received = report.received,
        stored = report.stored,
        duplicates = report.duplicates,
        echoes = report.echoes,
        unrouted = report.unrouted,
        failed = report.failed,
        "webhook processed"
    );
}

#[tracing::instrument(level = "info", skip_all, fields(channel = %channel))]
async fn verify_meta_subscription(
    Extension(state): Extension<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<SubscriptionQuery>,
) -> Response {
    if meta_channel(&channel).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    match verify_subscription(&query, &state.config.webhooks.meta_verify_token) {
        Some(challenge) => {
            tracing::info!("webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        None => {
            tracing::warn!(mode = ?query.mode, "webhook subscription rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(channel = %channel, bytes = body.len()))]
async fn receive_meta(
    Extension(state): Extension<Arc<AppState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(channel) = meta_channel(&channel) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(secret) = state.config.webhooks.meta_app_secret.as_deref() {
        let signature = header_str(&headers, META_SIGNATURE_HEADER);
        if !verify_meta_signature(signature, &body, secret) {
            tracing::warn!(
                signature_present = signature.is_some(),
                "dropping webhook with invalid signature"
            );
            return accepted(0);
        }
    }
    let ingest = tokio::spawn({
        let state = Arc::clone(&state);
        async move { state.ingestor.ingest_meta(channel, &body).await }
    });
    match flatten(ingest.await) {
        Ok(report) => {
            log_report(channel, &report);
            accepted(report.stored)
        }
        Err(e) => {
            tracing::error!(error = %e, "webhook processing failed");
            accepted(0)
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(workspace_id = %workspace_id, bytes = body.len()))]
async fn receive_telegram(
    Extension(state): Extension<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(workspace_id) = workspace_id.parse::<WorkspaceId>() else {
        tracing::warn!("dropping telegram update for malformed workspace id");
        return accepted(0);
    };
    let secret = header_str(&headers, TELEGRAM_SECRET_HEADER);
    if !verify_telegram_secret(secret, state.config.webhooks.telegram_secret.as_deref()) {
        tracing::warn!(
            secret_present = secret.is_some(),
            "dropping telegram update with invalid secret token"
        );
        return accepted(0);
    }
    let ingest = tokio::spawn({
        let state = Arc::clone(&state);
        async move { state.ingestor.ingest_telegram(workspace_id, &body).await }
    });
    match flatten(ingest.await) {
        Ok(report) => {
            log_report(Channel::Telegram, &report);
            accepted(report.stored)
        }
        Err(e) => {
            tracing::error!(error = %e, "telegram update processing failed");
            accepted(0)
        }
    }
}
