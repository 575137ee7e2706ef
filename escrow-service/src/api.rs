//! HTTP surface. Identity arrives as a gateway-injected `x-user-id`
//! header (authentication itself is an upstream concern); every money
//! field in a response is integer cents with an explicit currency code.

use crate::contract;
use crate::error::EscrowError;
use crate::models::Payment;
use crate::orchestrator::{self, PaymentHandle};
use crate::processor::ProcessorClient;
use crate::promotions;
use crate::schema::payments;
use crate::webhook;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::{Cents, PaymentStatus, CURRENCY};
use std::sync::Arc;
use uuid::Uuid;

type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub processor: Arc<dyn ProcessorClient>,
    pub webhook_secret: String,
    pub webhook_tolerance_seconds: i64,
}

/// Caller identity as injected by the API gateway.
pub struct GatewayUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for GatewayUser
where
    S: Send + Sync,
{
    type Rejection = EscrowError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .map(GatewayUser)
            .ok_or(EscrowError::Unauthorized)
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/payments", post(create_payment))
        .route("/jobs/:job_id/payment", get(get_payment_status))
        .route("/promotions/apply", post(apply_promotion_code))
        .route("/contracts/:contract_id/authorize", post(authorize_contract))
        .route("/contracts/:contract_id/capture", post(capture_contract))
        .route("/webhooks/processor", post(processor_webhook))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub success: bool,
    pub currency: &'static str,
    #[serde(flatten)]
    pub payment: PaymentHandle,
}

pub async fn create_payment(
    State(state): State<AppState>,
    GatewayUser(user_id): GatewayUser,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<PaymentResponse>, EscrowError> {
    let mut conn = state.pool.get().await?;
    let payment = orchestrator::create_or_get_payment(
        &mut conn,
        state.processor.as_ref(),
        user_id,
        request.job_id,
    )
    .await?;

    Ok(Json(PaymentResponse {
        success: true,
        currency: CURRENCY,
        payment,
    }))
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub amount_cents: Cents,
    pub platform_fee_cents: Cents,
    pub currency: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub async fn get_payment_status(
    State(state): State<AppState>,
    GatewayUser(user_id): GatewayUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<PaymentStatusResponse>, EscrowError> {
    let mut conn = state.pool.get().await?;

    let payment = payments::table
        .filter(payments::job_id.eq(job_id))
        .order(payments::created_at.desc())
        .first::<Payment>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| EscrowError::not_found("No payment for this job"))?;

    if payment.customer_id != user_id && payment.mechanic_id != user_id {
        return Err(EscrowError::Forbidden("Not a party to this payment"));
    }

    Ok(Json(PaymentStatusResponse {
        payment_id: payment.id,
        status: payment.status,
        amount_cents: payment.amount_cents,
        platform_fee_cents: payment.platform_fee_cents,
        currency: CURRENCY,
        paid_at: payment.paid_at,
        error_message: payment.error_message,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ApplyPromotionRequest {
    pub code: String,
    pub amount_cents: Cents,
}

pub async fn apply_promotion_code(
    State(state): State<AppState>,
    GatewayUser(user_id): GatewayUser,
    Json(request): Json<ApplyPromotionRequest>,
) -> Result<Json<promotions::ApplyCodeOutcome>, EscrowError> {
    let amount = request
        .amount_cents
        .require_non_negative()
        .map_err(|_| EscrowError::validation("amount_cents must be non-negative"))?;

    let mut conn = state.pool.get().await?;
    let outcome = promotions::apply_code(&mut conn, user_id, &request.code, amount).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize, Default)]
pub struct AuthorizeContractRequest {
    #[serde(default)]
    pub hold_id: Option<String>,
}

pub async fn authorize_contract(
    State(state): State<AppState>,
    GatewayUser(user_id): GatewayUser,
    Path(contract_id): Path<Uuid>,
    Json(request): Json<AuthorizeContractRequest>,
) -> Result<Json<contract::AuthorizeOutcome>, EscrowError> {
    let mut conn = state.pool.get().await?;
    let outcome = contract::authorize_contract(
        &mut conn,
        state.processor.as_ref(),
        user_id,
        contract_id,
        request.hold_id,
    )
    .await?;
    Ok(Json(outcome))
}

pub async fn capture_contract(
    State(state): State<AppState>,
    GatewayUser(user_id): GatewayUser,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<contract::CaptureOutcome>, EscrowError> {
    let mut conn = state.pool.get().await?;
    let outcome = contract::capture_contract_payment(
        &mut conn,
        state.processor.as_ref(),
        user_id,
        contract_id,
    )
    .await?;
    Ok(Json(outcome))
}

/// Signed event intake. 2xx only after the event's side effects are
/// durable (or it was already processed); 5xx asks the transport to
/// redeliver.
pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut conn = match state.pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!("webhook: no database connection: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "temporarily unavailable" })),
            )
                .into_response();
        }
    };

    let signature = headers
        .get("processor-signature")
        .and_then(|v| v.to_str().ok());

    match webhook::handle_event(
        &mut conn,
        signature,
        &body,
        &state.webhook_secret,
        state.webhook_tolerance_seconds,
    )
    .await
    {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
