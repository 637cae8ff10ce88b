//! Webhook endpoint and operational HTTP surface.
//!
//! `POST /webhooks/payments` is the single inbound door. The signature
//! middleware authenticates the raw body before anything else runs;
//! unauthenticated requests never reach the event store, so they cannot
//! pollute dedup state. The handler itself does the minimum on the hot
//! path: parse the envelope, durably record the event, enqueue a
//! reconcile job, acknowledge. It never blocks on provider calls or
//! reconciliation - those happen on the scheduler's workers.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::provider::ChargeRef;
use crate::repository::{IngestOutcome, NewEvent};
use crate::scheduler::ReconcileJob;
use crate::signature::verify_signature;
use crate::state_machine::state::ProviderEventId;
use crate::AppState;

/// Maximum webhook body size (1MB). Payloads are typically well under
/// 64KB; the limit bounds memory per request.
const MAX_WEBHOOK_BODY_SIZE: usize = 1024 * 1024;

/// Header carrying `t=<unix>,v1=<hex>`.
const SIGNATURE_HEADER: &str = "payment-signature";

/// Provider event envelope: `{id, type, data: {object: {...}}}`.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: IntentObject,
}

/// The payment object inside the envelope. Fields are defaulted because
/// the provider populates them unevenly across event kinds; the
/// reconciler validates what each kind actually needs.
#[derive(Debug, Deserialize)]
pub struct IntentObject {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub metadata: IntentMetadata,
    #[serde(default)]
    pub latest_charge: Option<ChargeRef>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentErrorDetail>,
}

/// Marketplace context attached to the intent at creation time.
#[derive(Debug, Default, Deserialize)]
pub struct IntentMetadata {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub course_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentErrorDetail {
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

/// Middleware: authenticate the delivery before anything else runs.
async fn verify_payment_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_SIZE)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;

    let header = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            warn!("webhook delivery without signature header");
            StatusCode::BAD_REQUEST
        })?;

    let now_secs = Utc::now().timestamp();
    if let Err(err) = verify_signature(
        &state.webhook_secret,
        &bytes,
        header,
        now_secs,
        state.signature_tolerance_secs,
    ) {
        // Rejected deliveries are never recorded; an attacker must not be
        // able to pre-poison the dedup gate with a forged event id.
        warn!("webhook signature rejected: {}", err);
        return Err(StatusCode::BAD_REQUEST);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

/// `POST /webhooks/payments`.
pub async fn payments_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_SIZE)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let envelope: EventEnvelope =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;
    if envelope.id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let provider_event_id = ProviderEventId(envelope.id.clone());
    let payload_hash = hex::encode(Sha256::digest(&bytes));

    let outcome = state
        .repository
        .ingest_event(NewEvent {
            provider_event_id: provider_event_id.clone(),
            kind: envelope.kind.clone(),
            payload: String::from_utf8_lossy(&bytes).into_owned(),
            payload_hash,
            received_at: Utc::now(),
        })
        .await
        .map_err(|e| {
            warn!("failed to record webhook event {}: {}", envelope.id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let message = match outcome {
        IngestOutcome::Fresh => {
            info!("event {} ({}) queued", envelope.id, envelope.kind);
            state
                .scheduler
                .enqueue(ReconcileJob::new(provider_event_id))
                .await;
            "queued"
        }
        // Idempotent ack: the provider must not retry either way, and no
        // side effects are re-applied.
        IngestOutcome::AlreadyInFlight => {
            info!("event {} already in flight", envelope.id);
            "already queued"
        }
        IngestOutcome::AlreadyProcessed => {
            info!("event {} already processed", envelope.id);
            "already processed"
        }
    };

    Ok(Json(WebhookResponse {
        message: message.to_string(),
    }))
}

/// `GET /healthz`.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "coursepay",
    }))
}

/// `GET /dead-letters`: the operator surface for parked failures.
///
/// Requires `Authorization: Bearer <token>` matching the configured
/// token. With no token configured the endpoint is disabled entirely.
pub async fn dead_letters_handler(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !bearer_token_matches(&headers, state.deadletter_auth_token.as_deref()) {
        return Err(StatusCode::FORBIDDEN);
    }

    let records = state
        .repository
        .list_dead_letters()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(serde_json::json!({ "dead_letters": records })))
}

fn bearer_token_matches(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        // No token configured: endpoint disabled rather than open.
        return false;
    };
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

/// Router for the signed webhook endpoint.
pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/payments", post(payments_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_payment_signature,
        ))
}
