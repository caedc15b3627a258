//! Payment endpoints: intent creation, lifecycle actions and the webhook
//! intake route.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::payment::{self, PaymentState, ProviderKind};
use crate::errors::ServiceError;
use crate::webhooks::Disposition;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/intent", post(create_intent))
        .route("/:id", get(get_payment))
        .route("/:id/confirm", post(confirm_payment))
        .route("/:id/capture", post(capture_payment))
        .route("/:id/cancel", post(cancel_payment))
        .route("/:id/refund", post(create_refund))
        .route("/webhooks/:provider", post(receive_webhook))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateIntentRequest {
    pub order_id: Uuid,
    /// One of `card`, `wallet`, `bnpl`.
    pub provider: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefundRequest {
    /// Major units. Omitted means the full remaining amount.
    pub amount: Option<Decimal>,
}

/// Payment attempt as returned to clients. Follows the payment row but
/// omits nothing sensitive: the client secret is meant for the caller.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentResponse {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    #[schema(value_type = String, example = "card")]
    pub provider: ProviderKind,
    #[schema(value_type = String, example = "pending")]
    pub status: PaymentState,
    pub amount: Decimal,
    pub currency: String,
    pub refunded_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_snippet: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<payment::Model> for PaymentResponse {
    fn from(p: payment::Model) -> Self {
        Self {
            payment_id: p.id,
            order_id: p.order_id,
            provider: p.provider,
            status: p.status,
            amount: p.amount,
            currency: p.currency,
            refunded_amount: p.refunded_amount,
            transaction_id: p.provider_transaction_id,
            client_secret: p.client_secret,
            checkout_url: p.checkout_url,
            embedded_snippet: p.embedded_snippet,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

fn parse_provider(raw: &str) -> Result<ProviderKind, ServiceError> {
    raw.parse::<ProviderKind>().map_err(ServiceError::BadRequest)
}

/// Starts a payment attempt with the chosen provider.
#[utoipa::path(
    post,
    path = "/api/v1/payments/intent",
    request_body = CreateIntentRequest,
    responses(
        (status = 201, description = "Payment intent created", body = PaymentResponse),
        (status = 400, description = "Unknown provider or order not payable"),
        (status = 404, description = "Order not found"),
        (status = 500, description = "Provider call failed"),
    ),
    tag = "payments"
)]
async fn create_intent(
    State(state): State<AppState>,
    Json(body): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let provider = parse_provider(&body.provider)?;
    let payment = state
        .services
        .payments
        .create_intent(body.order_id, provider)
        .await?;
    Ok((StatusCode::CREATED, Json(PaymentResponse::from(payment))))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/{id}",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, body = PaymentResponse),
        (status = 404, description = "Payment not found"),
    ),
    tag = "payments"
)]
async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let payment = state.services.payments.get_payment(id).await?;
    Ok(Json(PaymentResponse::from(payment)))
}

/// Polls the provider and applies the reported state.
#[utoipa::path(
    post,
    path = "/api/v1/payments/{id}/confirm",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, body = PaymentResponse),
        (status = 404, description = "Payment not found"),
    ),
    tag = "payments"
)]
async fn confirm_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let payment = state.services.payments.confirm_payment(id).await?;
    Ok(Json(PaymentResponse::from(payment)))
}

/// Settles an authorized two-phase payment.
#[utoipa::path(
    post,
    path = "/api/v1/payments/{id}/capture",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, body = PaymentResponse),
        (status = 400, description = "Payment is not authorized"),
    ),
    tag = "payments"
)]
async fn capture_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let payment = state.services.payments.capture_payment(id).await?;
    Ok(Json(PaymentResponse::from(payment)))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/{id}/cancel",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, body = PaymentResponse),
        (status = 400, description = "Payment can no longer be cancelled"),
    ),
    tag = "payments"
)]
async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let payment = state.services.payments.cancel_payment(id).await?;
    Ok(Json(PaymentResponse::from(payment)))
}

/// Refunds a settled payment, partially or in full.
#[utoipa::path(
    post,
    path = "/api/v1/payments/{id}/refund",
    params(("id" = Uuid, Path, description = "Payment id")),
    request_body = RefundRequest,
    responses(
        (status = 200, body = PaymentResponse),
        (status = 400, description = "Payment not settled or amount out of range"),
    ),
    tag = "payments"
)]
async fn create_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RefundRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let payment = state
        .services
        .payments
        .create_refund(id, body.amount)
        .await?;
    Ok(Json(PaymentResponse::from(payment)))
}

/// Provider webhook intake. The body stays raw bytes until the signature
/// over it has been verified, so this route takes no typed request body
/// and carries no OpenAPI annotation.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let provider = parse_provider(&provider)?;
    let disposition = state
        .services
        .reconciler
        .handle(provider, &headers, &body)
        .await?;

    let label = match disposition {
        Disposition::Applied { .. } => "applied",
        Disposition::Duplicate => "duplicate",
        Disposition::Ignored => "ignored",
        Disposition::Stale => "stale",
    };
    Ok(Json(json!({ "received": true, "disposition": label })))
}
