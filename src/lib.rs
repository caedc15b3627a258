//! Order and payment lifecycle service for the supplements storefront:
//! cart checkout with atomic stock accounting, payment attempts through a
//! closed set of provider adapters, webhook reconciliation and refunds.

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod notifications;
pub mod payments;
pub mod services;
pub mod webhooks;

use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Json, Router};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::json;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::payments::PaymentGateways;
use crate::services::inventory::InventoryService;
use crate::services::orders::OrderService;
use crate::services::payments::PaymentService;
use crate::webhooks::Reconciler;

/// Everything a handler needs, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub event_sender: EventSender,
    pub gateways: Arc<PaymentGateways>,
    pub services: AppServices,
}

#[derive(Clone)]
pub struct AppServices {
    pub inventory: InventoryService,
    pub orders: OrderService,
    pub payments: PaymentService,
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(
        db: DatabaseConnection,
        config: AppConfig,
        event_sender: EventSender,
        gateways: PaymentGateways,
    ) -> Self {
        let db = Arc::new(db);
        let gateways = Arc::new(gateways);

        let services = AppServices {
            inventory: InventoryService::new(db.clone()),
            orders: OrderService::new(db.clone(), event_sender.clone(), config.shipping.clone()),
            payments: PaymentService::new(db.clone(), gateways.clone(), event_sender.clone()),
            reconciler: Reconciler::new(db.clone(), gateways.clone(), event_sender.clone()),
        };

        Self {
            db,
            config: Arc::new(config),
            event_sender,
            gateways,
            services,
        }
    }
}

/// Standard success envelope used by the status endpoints.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn api_status() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(api_status))
        .nest("/orders", handlers::orders::routes())
        .nest("/payments", handlers::payments::routes())
        .nest("/products", handlers::products::routes())
}

/// The complete application router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
}
