//! Webhook intake end to end: signature checks, idempotent reconciliation,
//! the order mirror and the notification outbox.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use uuid::Uuid;

use common::*;
use nutriorder_api::entities::{
    order::{self, OrderStatus},
    outbox_notification,
    payment::{self, PaymentState, ProviderKind},
    product, webhook_event,
};
use nutriorder_api::webhooks::sign_payload;

async fn checkout(app: &TestApp) -> Uuid {
    let whey = seed_product(app.db(), "Whey Isolate", dec!(49.99), true, 10).await;
    let cart = seed_cart(app.db()).await;
    seed_cart_item(app.db(), &cart, &whey, 2).await;
    let response = app.post_json("/api/v1/orders", checkout_body(cart.id)).await;
    assert_status(&response, StatusCode::CREATED);
    let body = response_json(response).await;
    Uuid::parse_str(body["id"].as_str().unwrap()).unwrap()
}

fn succeeded_event(event_id: &str, transaction_id: &str) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": transaction_id, "status": "succeeded" } }
    })
    .to_string()
    .into_bytes()
}

async fn deliver(app: &TestApp, body: &[u8]) -> axum::response::Response {
    let timestamp = Utc::now().timestamp();
    let signature = sign_payload(CARD_WEBHOOK_SECRET, timestamp, body);
    app.post_webhook("card", timestamp, &signature, body).await
}

#[tokio::test]
async fn settlement_webhook_marks_payment_paid_and_confirms_the_order() {
    let app = spawn_app().await;
    let order_id = checkout(&app).await;
    let paid = seed_payment(
        app.db(),
        order_id,
        ProviderKind::Card,
        "pi_100",
        dec!(109.88),
        PaymentState::Pending,
    )
    .await;

    let body = succeeded_event("evt_1", "pi_100");
    let response = deliver(&app, &body).await;
    assert_status(&response, StatusCode::OK);
    let json = response_json(response).await;
    assert_eq!(json["disposition"], "applied");

    let payment_after = payment::Entity::find_by_id(paid.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, PaymentState::Paid);
    assert!(payment_after.confirmed_at.is_some());

    let order_after = order::Entity::find_by_id(order_id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, OrderStatus::Confirmed);
    assert_eq!(order_after.payment_status, PaymentState::Paid);

    let outbox = outbox_notification::Entity::find().all(app.db()).await.unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].order_id, order_id);
}

#[tokio::test]
async fn redelivered_webhook_is_a_no_op() {
    let app = spawn_app().await;
    let order_id = checkout(&app).await;
    seed_payment(
        app.db(),
        order_id,
        ProviderKind::Card,
        "pi_200",
        dec!(109.88),
        PaymentState::Pending,
    )
    .await;

    let body = succeeded_event("evt_dup", "pi_200");
    let first = deliver(&app, &body).await;
    assert_status(&first, StatusCode::OK);

    let second = deliver(&app, &body).await;
    assert_status(&second, StatusCode::OK);
    let json = response_json(second).await;
    assert_eq!(json["disposition"], "duplicate");

    // One dedup record, one notification, despite two deliveries.
    let events = webhook_event::Entity::find().all(app.db()).await.unwrap();
    assert_eq!(events.len(), 1);
    let outbox = outbox_notification::Entity::find().all(app.db()).await.unwrap();
    assert_eq!(outbox.len(), 1);
}

#[tokio::test]
async fn out_of_order_authorization_after_settlement_is_stale() {
    let app = spawn_app().await;
    let order_id = checkout(&app).await;
    seed_payment(
        app.db(),
        order_id,
        ProviderKind::Card,
        "pi_300",
        dec!(109.88),
        PaymentState::Paid,
    )
    .await;

    let body = serde_json::json!({
        "id": "evt_late_auth",
        "type": "payment_intent.amount_capturable_updated",
        "data": { "object": { "id": "pi_300" } }
    })
    .to_string()
    .into_bytes();

    let response = deliver(&app, &body).await;
    assert_status(&response, StatusCode::OK);
    let json = response_json(response).await;
    assert_eq!(json["disposition"], "stale");

    let payments = payment::Entity::find().all(app.db()).await.unwrap();
    assert_eq!(payments[0].status, PaymentState::Paid);
}

#[tokio::test]
async fn unknown_event_types_are_acknowledged_without_side_effects() {
    let app = spawn_app().await;

    let body = serde_json::json!({
        "id": "evt_noise",
        "type": "customer.created",
        "data": { "object": { "id": "cus_1" } }
    })
    .to_string()
    .into_bytes();

    let response = deliver(&app, &body).await;
    assert_status(&response, StatusCode::OK);
    let json = response_json(response).await;
    assert_eq!(json["disposition"], "ignored");

    let events = webhook_event::Entity::find().all(app.db()).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let app = spawn_app().await;
    let body = succeeded_event("evt_x", "pi_x");
    let timestamp = Utc::now().timestamp();
    let signature = sign_payload("wrong_secret", timestamp, &body);

    let response = app.post_webhook("card", timestamp, &signature, &body).await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let app = spawn_app().await;
    let body = succeeded_event("evt_x", "pi_x");
    let timestamp = Utc::now().timestamp() - 3600;
    let signature = sign_payload(CARD_WEBHOOK_SECRET, timestamp, &body);

    let response = app.post_webhook("card", timestamp, &signature, &body).await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_transaction_is_a_404_so_the_provider_retries() {
    let app = spawn_app().await;
    let body = succeeded_event("evt_orphan", "pi_nobody_knows");
    let response = deliver(&app, &body).await;
    assert_status(&response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_provider_segment_is_rejected() {
    let app = spawn_app().await;
    let body = succeeded_event("evt_1", "pi_1");
    let timestamp = Utc::now().timestamp();
    let signature = sign_payload(CARD_WEBHOOK_SECRET, timestamp, &body);

    let response = app.post_webhook("paypal", timestamp, &signature, &body).await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancellation_webhook_cancels_the_order_and_restores_stock() {
    let app = spawn_app().await;
    let db = app.db();

    let whey = seed_product(db, "Whey Isolate", dec!(49.99), true, 10).await;
    let cart = seed_cart(db).await;
    seed_cart_item(db, &cart, &whey, 2).await;
    let created = app.post_json("/api/v1/orders", checkout_body(cart.id)).await;
    let order_json = response_json(created).await;
    let order_id = Uuid::parse_str(order_json["id"].as_str().unwrap()).unwrap();

    seed_payment(
        db,
        order_id,
        ProviderKind::Card,
        "pi_cxl",
        dec!(109.88),
        PaymentState::Pending,
    )
    .await;

    let body = serde_json::json!({
        "id": "evt_cxl",
        "type": "payment_intent.canceled",
        "data": { "object": { "id": "pi_cxl" } }
    })
    .to_string()
    .into_bytes();

    let response = deliver(&app, &body).await;
    assert_status(&response, StatusCode::OK);

    let order_after = order::Entity::find_by_id(order_id)
        .one(db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, OrderStatus::Cancelled);

    let stock = product::Entity::find_by_id(whey.id)
        .one(db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stock.quantity, 10);
}

#[tokio::test]
async fn order_payment_status_recovers_after_a_failed_attempt() {
    let app = spawn_app().await;
    let order_id = checkout(&app).await;
    seed_payment(
        app.db(),
        order_id,
        ProviderKind::Card,
        "pi_try1",
        dec!(109.88),
        PaymentState::Pending,
    )
    .await;

    let failed = serde_json::json!({
        "id": "evt_fail",
        "type": "payment_intent.payment_failed",
        "data": { "object": { "id": "pi_try1" } }
    })
    .to_string()
    .into_bytes();
    let response = deliver(&app, &failed).await;
    assert_status(&response, StatusCode::OK);

    let order_mid = order::Entity::find_by_id(order_id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_mid.status, OrderStatus::Pending);
    assert_eq!(order_mid.payment_status, PaymentState::Failed);

    // The customer retries with a fresh attempt, which settles.
    seed_payment(
        app.db(),
        order_id,
        ProviderKind::Card,
        "pi_try2",
        dec!(109.88),
        PaymentState::Pending,
    )
    .await;
    let settled = succeeded_event("evt_retry", "pi_try2");
    let response = deliver(&app, &settled).await;
    assert_status(&response, StatusCode::OK);

    let order_after = order::Entity::find_by_id(order_id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, OrderStatus::Confirmed);
    assert_eq!(order_after.payment_status, PaymentState::Paid);
}

#[tokio::test]
async fn refund_webhook_moves_a_paid_payment_to_refunded() {
    let app = spawn_app().await;
    let order_id = checkout(&app).await;
    let paid = seed_payment(
        app.db(),
        order_id,
        ProviderKind::Card,
        "pi_rf",
        dec!(109.88),
        PaymentState::Paid,
    )
    .await;

    let body = serde_json::json!({
        "id": "evt_rf",
        "type": "charge.refunded",
        "data": { "object": { "id": "ch_1", "payment_intent": "pi_rf" } }
    })
    .to_string()
    .into_bytes();

    let response = deliver(&app, &body).await;
    assert_status(&response, StatusCode::OK);

    let payment_after = payment::Entity::find_by_id(paid.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, PaymentState::Refunded);
    assert_eq!(payment_after.refunded_amount, dec!(109.88));
}
