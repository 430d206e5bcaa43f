//! Operator API. Mutating routes sit behind the bearer guard.

use crate::backfill;
use crate::dispatch::Delivery;
use crate::routes::{error_response, internal_error};
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use inbox_channels::Channel;
use inbox_store::{ConversationId, MessageId, WorkspaceId};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/conversations/{id}/reply", post(agent_reply))
        .route("/api/v1/conversations/{id}/ai", post(set_ai))
        .route("/api/v1/messages/{id}/retry", post(retry_delivery))
        .route(
            "/api/v1/workspaces/{id}/channels/{channel}/backfill",
            post(backfill_channel),
        )
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AiToggleRequest {
    enabled: bool,
}

fn delivery_status(delivery: &Delivery) -> StatusCode {
    if delivery.is_delivered() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    }
}

#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
async fn agent_reply(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ConversationId>,
    Json(req): Json<ReplyRequest>,
) -> Response {
    if req.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "reply text is empty");
    }
    let answer_since = match reply_window_start(&state, id).await {
        Ok(at) => at,
        Err(e) => return internal_error(e),
    };
    match state
        .dispatcher
        .reply_as_agent(id, &req.text, answer_since)
        .await
    {
        Ok((message, delivery)) => (
            delivery_status(&delivery),
            Json(serde_json::json!({
                "status": if delivery.is_delivered() { "ok" } else { "error" },
                "message": message,
                "delivery": delivery,
            })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

/// Pending customer messages inside the workspace's lookback window are the
/// ones an agent reply answers.
async fn reply_window_start(
    state: &AppState,
    conversation_id: ConversationId,
) -> anyhow::Result<chrono::DateTime<Utc>> {
    let conversation = state.store.get_conversation(conversation_id).await?;
    let workspace = state.store.get_workspace(conversation.workspace_id).await?;
    let lookback = workspace
        .reply_lookback_seconds
        .unwrap_or(state.config.pipeline.reply_lookback_seconds);
    Ok(Utc::now() - Duration::seconds(lookback))
}

#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id, enabled = req.enabled))]
async fn set_ai(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ConversationId>,
    Json(req): Json<AiToggleRequest>,
) -> Response {
    match state.store.set_ai_enabled(id, req.enabled).await {
        Ok(()) => Json(serde_json::json!({ "status": "ok", "ai_enabled": req.enabled }))
            .into_response(),
        Err(e) => internal_error(e.into()),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(message_id = %id))]
async fn retry_delivery(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<MessageId>,
) -> Response {
    match state.dispatcher.retry_failed(id).await {
        Ok(Some(delivery)) => (
            delivery_status(&delivery),
            Json(serde_json::json!({
                "status": if delivery.is_delivered() { "ok" } else { "error" },
                "delivery": delivery,
            })),
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::CONFLICT, "message is not in failed state"),
        Err(e) => internal_error(e),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(workspace_id = %id, channel = %channel))]
async fn backfill_channel(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, channel)): Path<(WorkspaceId, String)>,
) -> Response {
    let channel: Channel = match channel.parse() {
        Ok(channel) => channel,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match backfill::import_channel_history(
        &state.store,
        &state.channels,
        id,
        channel,
        state.config.pipeline.reply_lookback_seconds,
        Utc::now(),
    )
    .await
    {
        Ok(report) => Json(serde_json::json!({ "status": "ok", "report": report })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::InboxConfig;
    use crate::testing::{Fixture, RecordingAdapter};
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode};
    use chrono::{Duration, Utc};
    use inbox_channels::Channel;
    use inbox_store::{ConversationId, DeliveryStatus, SenderType};
    use tower::util::ServiceExt;

    fn post(uri: &str, body: serde_json::Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn call(app: axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    fn guarded_config() -> InboxConfig {
        let mut config = InboxConfig::default();
        config.server.control_api_token = Some("op-token".to_string());
        config
    }

    #[tokio::test]
    async fn agent_reply_requires_token_and_answers_pending_messages() {
        let fixture = Fixture::new(Channel::Instagram).await;
        let conversation = fixture.conversation("IGSID-1").await;
        fixture
            .customer_message(&conversation, "متوفر؟", Utc::now() - Duration::seconds(15))
            .await;
        let uri = format!("/api/v1/conversations/{}/reply", conversation.id);
        let body = serde_json::json!({ "text": "نعم متوفر" });

        let (status, _) = call(
            fixture.app(None, guarded_config()),
            post(&uri, body.clone(), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(fixture.adapter.sent().is_empty());

        let (status, reply) = call(
            fixture.app(None, guarded_config()),
            post(&uri, body, Some("op-token")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["delivery"]["status"], "delivered");
        assert_eq!(fixture.adapter.sent(), vec![("IGSID-1".to_string(), "نعم متوفر".to_string())]);

        let pending = fixture
            .store
            .unreplied_batch(conversation.id, Utc::now() - Duration::seconds(300))
            .await
            .expect("batch");
        assert!(pending.is_empty());
        let history = fixture
            .store
            .recent_history(conversation.id, 10)
            .await
            .expect("history");
        assert!(history.iter().any(|m| m.sender_type == SenderType::Agent));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let fixture = Fixture::new(Channel::Instagram).await;
        let uri = format!("/api/v1/conversations/{}/reply", ConversationId::new());
        let (status, body) = call(
            fixture.app(None, InboxConfig::default()),
            post(&uri, serde_json::json!({ "text": "hi" }), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn retry_redispatches_only_failed_messages() {
        let fixture =
            Fixture::with_adapter(RecordingAdapter::new(Channel::Facebook).failing_sends(), true)
                .await;
        let conversation = fixture.conversation("PSID-7").await;
        let (message, delivery) = fixture
            .dispatcher()
            .reply_as_agent(conversation.id, "hello", Utc::now())
            .await
            .expect("reply");
        assert!(!delivery.is_delivered());
        let uri = format!("/api/v1/messages/{}/retry", message.id);

        let (status, body) = call(
            fixture.app(None, InboxConfig::default()),
            post(&uri, serde_json::json!({}), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["delivery"]["status"], "failed");

        fixture
            .store
            .mark_delivered(message.id, "mid.manual")
            .await
            .expect("mark delivered");
        let (status, _) = call(
            fixture.app(None, InboxConfig::default()),
            post(&uri, serde_json::json!({}), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let stored = fixture.store.get_message(message.id).await.expect("message");
        assert_eq!(stored.delivery_status, Some(DeliveryStatus::Delivered));
    }

    #[tokio::test]
    async fn ai_toggle_updates_conversation() {
        let fixture = Fixture::new(Channel::Telegram).await;
        let conversation = fixture.conversation("42").await;
        assert!(conversation.ai_enabled);
        let (status, _) = call(
            fixture.app(None, InboxConfig::default()),
            post(
                &format!("/api/v1/conversations/{}/ai", conversation.id),
                serde_json::json!({ "enabled": false }),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let reloaded = fixture
            .store
            .get_conversation(conversation.id)
            .await
            .expect("conversation");
        assert!(!reloaded.ai_enabled);
    }

    #[tokio::test]
    async fn backfill_rejects_unknown_channel_and_imports_known_one() {
        let fixture = Fixture::new(Channel::Instagram).await;
        let base = format!("/api/v1/workspaces/{}/channels", fixture.workspace.id);

        let (status, _) = call(
            fixture.app(None, InboxConfig::default()),
            post(&format!("{base}/discord/backfill"), serde_json::json!({}), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            fixture.app(None, InboxConfig::default()),
            post(&format!("{base}/instagram/backfill"), serde_json::json!({}), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["fetched"], 0);
    }
}
