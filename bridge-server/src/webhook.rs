//! HTTP surface: GitHub and Graph webhook endpoints.

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::inbound::GraphNotificationBatch;
use crate::outbound::GitHubEventPayload;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Request-scoped id carried through log lines for one webhook delivery.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if !signature.starts_with("sha256=") {
        return false;
    }

    let signature_hex = &signature["sha256=".len()..];
    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // Constant-time verification.
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Whether a delivery passes signature checks. Unsigned payloads are
/// accepted only in dev with no secret configured; everywhere else a
/// missing secret fails closed.
fn signature_accepted(
    app_env: &str,
    webhook_secret: &str,
    signature: Option<&str>,
    payload: &[u8],
) -> bool {
    if app_env == "dev" && webhook_secret.is_empty() {
        return true;
    }
    if webhook_secret.is_empty() {
        return false;
    }
    match signature {
        Some(signature) => verify_github_signature(webhook_secret, payload, signature),
        None => false,
    }
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok());

    if !signature_accepted(
        &state.config.app_env,
        &state.config.github_webhook_secret,
        signature,
        &bytes,
    ) {
        warn!(correlation_id = %correlation_id.0, "Rejected GitHub webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(correlation_id);

    Ok(next.run(new_request).await)
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, StatusCode> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let event = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    info!(correlation_id = %correlation_id, github_event = %event, "Received GitHub webhook");

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: GitHubEventPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    match state.outbound.handle_github_event(&event, &payload).await {
        Ok(outcome) => {
            info!(
                correlation_id = %correlation_id,
                github_event = %event,
                "GitHub webhook processed"
            );
            Ok(Json(outcome).into_response())
        }
        Err(e) => {
            state
                .alerts
                .notify(
                    "github_webhook_processing_error",
                    "Unhandled error while processing GitHub webhook",
                    serde_json::json!({ "github_event": event }),
                    Some(&format!("{:#}", e)),
                )
                .await;
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ValidationQuery {
    #[serde(default, rename = "validationToken")]
    pub validation_token: Option<String>,
}

/// Graph endpoint-validation handshake: echo the token back as plain text.
pub async fn graph_validation_handler(
    Query(query): Query<ValidationQuery>,
) -> Result<Response, StatusCode> {
    match query.validation_token {
        Some(token) if !token.is_empty() => Ok(token.into_response()),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

pub async fn graph_webhook_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ValidationQuery>,
    request: Request,
) -> Result<Response, StatusCode> {
    // Graph repeats the validation handshake on the POST route.
    if let Some(token) = query.validation_token {
        if !token.is_empty() {
            return Ok(token.into_response());
        }
    }

    info!("Received Graph webhook");

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let batch: GraphNotificationBatch = match serde_json::from_slice(&bytes) {
        Ok(batch) => batch,
        Err(_) => {
            warn!("Invalid Graph webhook payload");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    match state.inbound.handle_notification(&batch).await {
        Ok(summary) => {
            info!(
                processed = summary.processed,
                skipped = summary.skipped,
                "Graph webhook processed"
            );
            Ok(Json(summary).into_response())
        }
        Err(e) => {
            state
                .alerts
                .notify(
                    "graph_webhook_processing_error",
                    "Unhandled error while processing Graph webhook",
                    serde_json::json!({}),
                    Some(&format!("{:#}", e)),
                )
                .await;
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/github", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
        .route(
            "/webhooks/graph",
            axum::routing::get(graph_validation_handler).post(graph_webhook_handler),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_is_accepted() {
        let payload = br#"{"action":"opened"}"#;
        let signature = sign("webhook-secret", payload);
        assert!(verify_github_signature("webhook-secret", payload, &signature));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let payload = br#"{"action":"opened"}"#;
        let signature = sign("other-secret", payload);
        assert!(!verify_github_signature("webhook-secret", payload, &signature));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let signature = sign("webhook-secret", br#"{"action":"opened"}"#);
        assert!(!verify_github_signature(
            "webhook-secret",
            br#"{"action":"closed"}"#,
            &signature
        ));
    }

    #[test]
    fn test_malformed_signature_headers_are_rejected() {
        let payload = b"payload";
        assert!(!verify_github_signature("secret", payload, ""));
        assert!(!verify_github_signature("secret", payload, "sha1=abcdef"));
        assert!(!verify_github_signature("secret", payload, "sha256=zznothex"));
    }

    #[test]
    fn test_dev_without_secret_accepts_unsigned_payloads() {
        assert!(signature_accepted("dev", "", None, b"payload"));
        assert!(signature_accepted("dev", "", Some("sha256=junk"), b"payload"));
    }

    #[test]
    fn test_prod_without_secret_fails_closed() {
        assert!(!signature_accepted("prod", "", None, b"payload"));
        assert!(!signature_accepted("prod", "", Some("sha256=junk"), b"payload"));
    }

    #[test]
    fn test_signed_payload_accepted_outside_dev() {
        let payload = b"payload";
        let signature = sign("webhook-secret", payload);
        assert!(signature_accepted(
            "prod",
            "webhook-secret",
            Some(&signature),
            payload
        ));
        assert!(!signature_accepted("prod", "webhook-secret", None, payload));
    }
}
