use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub const SWEEP_SECRET_HEADER: &str = "x-sweep-secret";

#[derive(Debug, Clone, Default)]
pub struct OperatorAuthPolicy {
    /// Unset leaves mutating operator routes open.
    pub control_api_token: Option<String>,
}

impl OperatorAuthPolicy {
    pub fn new(control_api_token: Option<&str>) -> Self {
        Self {
            control_api_token: control_api_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorAuthPolicyExt(pub OperatorAuthPolicy);

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub(crate) fn secrets_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// True when no secret is configured, or `header` carries exactly it.
pub(crate) fn shared_secret_ok(headers: &HeaderMap, header: &str, expected: Option<&str>) -> bool {
    let Some(expected) = expected.map(str::trim).filter(|s| !s.is_empty()) else {
        return true;
    };
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|provided| secrets_match(provided.trim(), expected))
}

pub(crate) fn unauthorized(code: &str, message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::warn!(error_code = code, error = %message, "operator auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "status": "error",
            "error": message,
            "error_code": code,
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_operator_auth(req: Request<Body>, next: Next) -> Response {
    if !is_mutating(req.method()) {
        return next.run(req).await;
    }
    let policy = req
        .extensions()
        .get::<OperatorAuthPolicyExt>()
        .map(|v| v.0.clone())
        .unwrap_or_default();
    let Some(expected) = policy.control_api_token.as_deref() else {
        return next.run(req).await;
    };
    let Some(provided) = parse_bearer_token(req.headers()) else {
        return unauthorized("missing_bearer_token", "missing bearer token");
    };
    if !secrets_match(&provided, expected) {
        return unauthorized("invalid_bearer_token", "invalid bearer token");
    }
    next.run(req).await
}
