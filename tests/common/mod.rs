//! Shared harness: in-memory database, seeded catalog and a full app
//! router the tests drive through `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, Database, DatabaseConnection};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use nutriorder_api::config::{
    AppConfig, BnplProviderConfig, CardProviderConfig, PaymentsConfig, ShippingConfig,
    WalletProviderConfig,
};
use nutriorder_api::db::ensure_schema;
use nutriorder_api::entities::{
    bundle_component, cart, cart_item,
    cart::CartStatus,
    payment::{self, PaymentState, ProviderKind},
    product,
};
use nutriorder_api::events::{Event, EventSender};
use nutriorder_api::payments::PaymentGateways;
use nutriorder_api::{app_router, AppState};

pub const CARD_WEBHOOK_SECRET: &str = "whsec_card_test";

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    // Held open so event sends do not fail with a closed channel.
    _event_rx: mpsc::Receiver<Event>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        host: "127.0.0.1".into(),
        port: 0,
        environment: "test".into(),
        log_level: "warn".into(),
        log_json: false,
        auto_migrate: true,
        db_max_connections: 5,
        shipping: ShippingConfig {
            flat_fee: Decimal::new(990, 2),
            free_threshold: Decimal::new(1500, 0),
        },
        payments: PaymentsConfig {
            card: CardProviderConfig {
                base_url: "http://127.0.0.1:9".into(),
                secret_key: "sk_test".into(),
                webhook_secret: CARD_WEBHOOK_SECRET.into(),
            },
            wallet: WalletProviderConfig {
                base_url: "http://127.0.0.1:9".into(),
                client_id: "cid".into(),
                client_secret: "csec".into(),
                webhook_secret: "whsec_wallet_test".into(),
            },
            bnpl: BnplProviderConfig {
                base_url: "http://127.0.0.1:9".into(),
                username: "merchant".into(),
                password: "secret".into(),
                webhook_secret: "whsec_bnpl_test".into(),
            },
            webhook_tolerance_secs: 300,
            provider_timeout_secs: 2,
        },
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

/// Builds the app against a fresh in-memory database. Pass a config with
/// provider base URLs pointing at a stub server to exercise gateways.
pub async fn spawn_app_with(config: AppConfig) -> TestApp {
    // One pooled connection: each sqlite in-memory connection is its own
    // database, so the pool must not fan out.
    let mut options = sea_orm::ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).min_connections(1);
    let db = Database::connect(options)
        .await
        .expect("in-memory sqlite");
    ensure_schema(&db).await.expect("schema");

    let (tx, rx) = mpsc::channel(256);
    let event_sender = EventSender::new(tx);
    let gateways = PaymentGateways::from_config(&config.payments).expect("gateways");

    let state = AppState::new(db, config, event_sender, gateways);
    let router = app_router(state.clone());

    TestApp {
        state,
        router,
        _event_rx: rx,
    }
}

impl TestApp {
    pub fn db(&self) -> &DatabaseConnection {
        self.state.db.as_ref()
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Posts a raw webhook body with the given signature headers.
    pub async fn post_webhook(
        &self,
        provider: &str,
        timestamp: i64,
        signature: &str,
        body: &[u8],
    ) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/payments/webhooks/{}", provider))
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-timestamp", timestamp.to_string())
            .header("x-signature", signature)
            .body(Body::from(body.to_vec()))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub async fn response_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn assert_status(response: &Response<Body>, expected: StatusCode) {
    assert_eq!(response.status(), expected);
}

/// Money fields serialize as decimal strings but lose trailing zeros on
/// the round trip through sqlite, so compare them numerically.
pub fn money(value: &serde_json::Value) -> Decimal {
    use rust_decimal::prelude::FromPrimitive;
    value
        .as_str()
        .map(|s| s.parse().expect("decimal string"))
        .or_else(|| value.as_f64().and_then(Decimal::from_f64))
        .unwrap_or_else(|| panic!("not a money value: {}", value))
}

pub async fn seed_product(
    db: &DatabaseConnection,
    name: &str,
    price: Decimal,
    track_quantity: bool,
    quantity: i32,
) -> product::Model {
    seed_product_full(db, name, price, track_quantity, quantity, false).await
}

pub async fn seed_product_full(
    db: &DatabaseConnection,
    name: &str,
    price: Decimal,
    track_quantity: bool,
    quantity: i32,
    is_bundle: bool,
) -> product::Model {
    let now = Utc::now();
    let row = product::ActiveModel {
        id: Set(Uuid::new_v4()),
        // Suffixed so the same product name can be seeded repeatedly
        // without tripping the unique sku constraint.
        sku: Set(format!(
            "SKU-{}-{}",
            name.to_uppercase().replace(' ', "-"),
            &Uuid::new_v4().simple().to_string()[..8]
        )),
        name: Set(name.to_string()),
        price: Set(price),
        currency: Set("EUR".into()),
        track_quantity: Set(track_quantity),
        quantity: Set(quantity),
        is_bundle: Set(is_bundle),
        image_url: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };
    row.insert(db).await.expect("seed product")
}

pub async fn seed_bundle_component(
    db: &DatabaseConnection,
    bundle: &product::Model,
    component: &product::Model,
    per_bundle_quantity: i32,
    position: i32,
) {
    let row = bundle_component::ActiveModel {
        id: Set(Uuid::new_v4()),
        bundle_id: Set(bundle.id),
        component_id: Set(component.id),
        per_bundle_quantity: Set(per_bundle_quantity),
        position: Set(position),
    };
    row.insert(db).await.expect("seed bundle component");
}

pub async fn seed_cart(db: &DatabaseConnection) -> cart::Model {
    let now = Utc::now();
    let row = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        session_id: Set(Some("test-session".into())),
        customer_id: Set(None),
        currency: Set("EUR".into()),
        status: Set(CartStatus::Active),
        created_at: Set(now),
        updated_at: Set(now),
    };
    row.insert(db).await.expect("seed cart")
}

pub async fn seed_cart_item(
    db: &DatabaseConnection,
    cart: &cart::Model,
    product: &product::Model,
    quantity: i32,
) -> cart_item::Model {
    let now = Utc::now();
    let row = cart_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        cart_id: Set(cart.id),
        product_id: Set(product.id),
        quantity: Set(quantity),
        created_at: Set(now),
        updated_at: Set(now),
    };
    row.insert(db).await.expect("seed cart item")
}

/// Inserts a payment row directly, the state a create-intent call leaves
/// behind, so webhook tests need no live provider.
pub async fn seed_payment(
    db: &DatabaseConnection,
    order_id: Uuid,
    provider: ProviderKind,
    transaction_id: &str,
    amount: Decimal,
    status: PaymentState,
) -> payment::Model {
    let now = Utc::now();
    let row = payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        provider: Set(provider),
        provider_transaction_id: Set(Some(transaction_id.to_string())),
        amount: Set(amount),
        currency: Set("EUR".into()),
        status: Set(status),
        client_secret: Set(None),
        checkout_url: Set(None),
        embedded_snippet: Set(None),
        refunded_amount: Set(Decimal::ZERO),
        authorized_at: Set(None),
        confirmed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        version: Set(1),
    };
    row.insert(db).await.expect("seed payment")
}

pub fn checkout_body(cart_id: Uuid) -> serde_json::Value {
    serde_json::json!({
        "cart_id": cart_id,
        "email": "jo@example.com",
        "billing_address": "1 Main St, Springfield",
        "shipping_address": "1 Main St, Springfield",
    })
}
