//! Catalog read endpoints used by the storefront while building carts.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::{ApiResponse, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_product))
        .route("/:id/availability", get(get_availability))
}

#[utoipa::path(
    get,
    path = "/api/v1/products/{id}",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Product"),
        (status = 404, description = "Product not found"),
    ),
    tag = "products"
)]
async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let product = state.services.inventory.get_product(id).await?;
    Ok(Json(ApiResponse::new(product)))
}

/// Sellable units right now; `null` means the product is untracked and
/// effectively unlimited. Bundles report their scarcest component.
#[utoipa::path(
    get,
    path = "/api/v1/products/{id}/availability",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Available units, null when untracked"),
        (status = 404, description = "Product not found"),
    ),
    tag = "products"
)]
async fn get_availability(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let available = state.services.inventory.availability(id).await?;
    Ok(Json(json!({ "product_id": id, "available": available })))
}
