//! Order endpoints: checkout, lookup, cancellation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::services::orders::NewOrder;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/payments", get(list_order_payments))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    pub cart_id: Uuid,
    pub customer_id: Option<Uuid>,
    #[validate(email)]
    pub email: String,
    pub phone: Option<String>,
    #[validate(length(min = 1, message = "billing address is required"))]
    pub billing_address: String,
    #[validate(length(min = 1, message = "shipping address is required"))]
    pub shipping_address: String,
}

/// Converts an active cart into a pending order.
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created"),
        (status = 400, description = "Empty cart, price mismatch or insufficient stock"),
        (status = 404, description = "Cart not found"),
        (status = 409, description = "Order number collision, retry"),
    ),
    tag = "orders"
)]
async fn create_order(
    State(state): State<AppState>,
    Json(body): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    body.validate()?;

    let input = NewOrder {
        cart_id: body.cart_id,
        customer_id: body.customer_id,
        email: body.email,
        phone: body.phone,
        billing_address: body.billing_address,
        shipping_address: body.shipping_address,
    };
    let created = state.services.orders.create_order(&input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with its lines"),
        (status = 404, description = "Order not found"),
    ),
    tag = "orders"
)]
async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    Ok(Json(order))
}

/// Cancels an unpaid order and restores its stock.
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order cancelled"),
        (status = 400, description = "Order is no longer cancellable"),
        (status = 404, description = "Order not found"),
    ),
    tag = "orders"
)]
async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cancelled = state.services.orders.cancel_order(id).await?;
    Ok(Json(cancelled))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/payments",
    params(("id" = Uuid, Path, description = "Order id")),
    responses((status = 200, description = "Payment attempts for the order")),
    tag = "orders"
)]
async fn list_order_payments(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let payments = state.services.payments.list_for_order(id).await?;
    let payments: Vec<super::payments::PaymentResponse> =
        payments.into_iter().map(Into::into).collect();
    Ok(Json(payments))
}
