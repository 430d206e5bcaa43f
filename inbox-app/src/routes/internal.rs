use crate::http_auth::{self, SWEEP_SECRET_HEADER};
use crate::routes::{error_response, internal_error};
use crate::server::AppState;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/internal/sweep", post(trigger_sweep))
}

/// External scheduler tick (cron, systemd timer, platform scheduler).
#[tracing::instrument(level = "info", skip_all)]
async fn trigger_sweep(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let expected = state.config.scheduler.trigger_secret.as_deref();
    if !http_auth::shared_secret_ok(&headers, SWEEP_SECRET_HEADER, expected) {
        return http_auth::unauthorized("invalid_sweep_secret", "invalid sweep secret");
    }
    let Some(scheduler) = state.scheduler.as_ref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "AI replies are disabled: no llm api key configured",
        );
    };
    // Own task: a caller that disconnects must not abort turns mid-delivery.
    let scheduler = Arc::clone(scheduler);
    match tokio::spawn(async move { scheduler.sweep(Utc::now()).await }).await {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(anyhow::anyhow!("sweep task failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::InboxConfig;
    use crate::testing::{Fixture, RecordingAdapter, ScriptedModel, ScriptedReply};
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode};
    use chrono::{Duration, Utc};
    use inbox_channels::Channel;
    use inbox_store::DeliveryStatus;
    use tower::util::ServiceExt;

    fn sweep_request(secret: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::POST).uri("/internal/sweep");
        if let Some(secret) = secret {
            builder = builder.header("x-sweep-secret", secret);
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn sweep_requires_secret_and_replies_to_settled_batches() {
        let fixture = Fixture::new(Channel::Whatsapp).await;
        let conversation = fixture.conversation("970567900601").await;
        fixture
            .customer_message(&conversation, "بكم الكريم؟", Utc::now() - Duration::seconds(30))
            .await;
        let model = ScriptedModel::new(vec![ScriptedReply::text("الكريم بخمسين شيكل")]);
        let mut config = InboxConfig::default();
        config.scheduler.trigger_secret = Some("tick".to_string());

        let denied = fixture
            .app(Some(model.clone()), config.clone())
            .oneshot(sweep_request(Some("nope")))
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(model.calls(), 0);

        let response = fixture
            .app(Some(model.clone()), config)
            .oneshot(sweep_request(Some("tick")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let report: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(report["turns"].as_array().map(Vec::len), Some(1));
        assert_eq!(model.calls(), 1);
        assert_eq!(fixture.adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn sweep_without_model_is_unavailable() {
        let fixture = Fixture::new(Channel::Whatsapp).await;
        let response = fixture
            .app(None, InboxConfig::default())
            .oneshot(sweep_request(None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn sweep_outlasting_the_request_timeout_still_delivers() {
        let adapter = RecordingAdapter::new(Channel::Telegram)
            .with_send_delay(std::time::Duration::from_millis(1500));
        let fixture = Fixture::with_adapter(adapter, true).await;
        let conversation = fixture.conversation("42").await;
        fixture
            .customer_message(&conversation, "hello", Utc::now() - Duration::seconds(30))
            .await;
        let model = ScriptedModel::new(vec![ScriptedReply::text("hi!")]);
        let mut config = InboxConfig::default();
        config.server.http_timeout_seconds = 1;

        let response = fixture
            .app(Some(model.clone()), config)
            .oneshot(sweep_request(None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fixture.adapter.sent(), vec![("42".to_string(), "hi!".to_string())]);

        let history = fixture
            .store
            .recent_history(conversation.id, 10)
            .await
            .expect("history");
        let reply = history.last().expect("reply row");
        assert_eq!(reply.delivery_status, Some(DeliveryStatus::Delivered));
    }
}
