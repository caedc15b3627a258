//! Checkout and order lifecycle. Turning a cart into an order is one
//! database transaction: pricing, order + line inserts, guarded stock
//! decrements and cart conversion all commit or roll back together.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, ConnectionTrait, DatabaseConnection, TransactionTrait};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::ShippingConfig;
use crate::entities::{
    cart, cart_item, order, order_line, stock_reservation,
    cart::CartStatus,
    order::OrderStatus,
    payment::{self, PaymentState},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::{self, ResolvedProduct};

const MAX_ORDER_NUMBER_ATTEMPTS: usize = 3;

/// Checkout input. Contact and address data become immutable snapshots on
/// the order row.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub cart_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub email: String,
    pub phone: Option<String>,
    pub billing_address: String,
    pub shipping_address: String,
}

/// An order with its lines, the read shape returned to the HTTP surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderWithLines {
    #[serde(flatten)]
    pub order: order::Model,
    pub lines: Vec<order_line::Model>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    shipping: ShippingConfig,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        shipping: ShippingConfig,
    ) -> Self {
        Self {
            db,
            event_sender,
            shipping,
        }
    }

    /// Converts an active cart into a pending order. Prices come from the
    /// catalog, never from the client. Retries on an order-number collision,
    /// which rolls the whole transaction back and re-rolls the number.
    #[instrument(skip(self, input), fields(cart_id = %input.cart_id))]
    pub async fn create_order(&self, input: &NewOrder) -> Result<OrderWithLines, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_create_order(input).await {
                Ok(created) => {
                    info!(order_id = %created.order.id, order_number = %created.order.order_number, "order created");
                    if let Err(e) = self.event_sender.send(Event::OrderCreated(created.order.id)).await {
                        warn!(error = %e, "event channel closed, order event dropped");
                    }
                    return Ok(created);
                }
                Err(e) if e.is_unique_violation() && attempt < MAX_ORDER_NUMBER_ATTEMPTS => {
                    warn!(attempt, "order number collision, retrying");
                }
                Err(e) if e.is_unique_violation() => {
                    return Err(ServiceError::Conflict(
                        "could not allocate a unique order number, please retry".into(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_create_order(&self, input: &NewOrder) -> Result<OrderWithLines, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = cart::Entity::find_by_id(input.cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("cart {} not found", input.cart_id)))?;
        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "cart {} is not active",
                cart.id
            )));
        }

        let items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(&txn)
            .await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError("cart is empty".into()));
        }

        // Resolve every item up front: catalog price, bundle components,
        // advisory availability. Hard guarantees come from the guarded
        // decrements below.
        let mut resolved_items: Vec<(ResolvedProduct, i32)> = Vec::with_capacity(items.len());
        for item in &items {
            if item.quantity < 1 {
                return Err(ServiceError::ValidationError(format!(
                    "cart item {} has non-positive quantity",
                    item.id
                )));
            }
            let resolved = inventory::resolve_product(&txn, item.product_id).await?;
            if resolved.product.currency != cart.currency {
                return Err(ServiceError::ValidationError(format!(
                    "product '{}' is priced in {} but the cart is {}",
                    resolved.product.name, resolved.product.currency, cart.currency
                )));
            }
            inventory::check_availability(&resolved, item.quantity)?;
            resolved_items.push((resolved, item.quantity));
        }

        let subtotal: Decimal = resolved_items
            .iter()
            .map(|(resolved, quantity)| resolved.unit_price() * Decimal::from(*quantity))
            .sum();
        let shipping_amount = compute_shipping(&self.shipping, subtotal);
        let discount_amount = Decimal::ZERO;
        let total_amount = subtotal + shipping_amount - discount_amount;

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = generate_order_number();

        let order_row = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_id: Set(input.customer_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentState::Pending),
            currency: Set(cart.currency.clone()),
            subtotal: Set(subtotal),
            shipping_amount: Set(shipping_amount),
            discount_amount: Set(discount_amount),
            total_amount: Set(total_amount),
            email: Set(input.email.clone()),
            phone: Set(input.phone.clone()),
            billing_address: Set(input.billing_address.clone()),
            shipping_address: Set(input.shipping_address.clone()),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        };
        let order = order_row.insert(&txn).await?;

        let mut lines = Vec::with_capacity(resolved_items.len());
        for (resolved, quantity) in &resolved_items {
            let unit_price = resolved.unit_price();
            let line = order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(resolved.product.id),
                sku: Set(resolved.product.sku.clone()),
                name: Set(resolved.product.name.clone()),
                image_url: Set(resolved.product.image_url.clone()),
                quantity: Set(*quantity),
                unit_price: Set(unit_price),
                total_price: Set(unit_price * Decimal::from(*quantity)),
                tax_rate: Set(Decimal::ZERO),
                tax_amount: Set(Decimal::ZERO),
                created_at: Set(now),
            };
            lines.push(line.insert(&txn).await?);
        }

        take_stock(&txn, order_id, &resolved_items).await?;

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        let mut cart_update: cart::ActiveModel = cart.into();
        cart_update.status = Set(CartStatus::Converted);
        cart_update.updated_at = Set(now);
        cart_update.update(&txn).await?;

        txn.commit().await?;
        Ok(OrderWithLines { order, lines })
    }

    /// Cancels an unpaid order and returns its stock. Only pending orders
    /// qualify; paid orders go through the refund flow instead.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;

        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is {} and can no longer be cancelled",
                order.order_number,
                order.status.as_str()
            )));
        }

        restore_stock_for_order(&txn, order_id).await?;

        // Non-terminal payment attempts against the order die with it.
        payment::Entity::update_many()
            .col_expr(
                payment::Column::Status,
                sea_orm::sea_query::Expr::value(PaymentState::Cancelled),
            )
            .col_expr(
                payment::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(
                payment::Column::Status
                    .is_in([PaymentState::Pending, PaymentState::Authorized]),
            )
            .exec(&txn)
            .await?;

        let version = order.version;
        let mut update: order::ActiveModel = order.into();
        update.status = Set(OrderStatus::Cancelled);
        update.payment_status = Set(PaymentState::Cancelled);
        update.updated_at = Set(Utc::now());
        update.version = Set(version + 1);
        let cancelled = update.update(&txn).await?;

        txn.commit().await?;

        info!(order_number = %cancelled.order_number, "order cancelled, stock restored");
        if let Err(e) = self.event_sender.send(Event::OrderCancelled(order_id)).await {
            warn!(error = %e, "event channel closed, order event dropped");
        }
        Ok(cancelled)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithLines, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;
        let lines = order_line::Entity::find()
            .filter(order_line::Column::OrderId.eq(order_id))
            .all(self.db.as_ref())
            .await?;
        Ok(OrderWithLines { order, lines })
    }
}

/// Flat fee below the free-shipping threshold, free at or above it.
pub fn compute_shipping(cfg: &ShippingConfig, subtotal: Decimal) -> Decimal {
    if subtotal >= cfg.free_threshold {
        Decimal::ZERO
    } else {
        cfg.flat_fee
    }
}

/// `ORD-YYYYMMDD-XXXXXXXX` with an unambiguous random suffix. Uniqueness is
/// enforced by the column constraint, not here.
fn generate_order_number() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Guarded decrements for all tracked stock a checkout consumes, merged so
/// a component shared by several lines is taken once. Each decrement is
/// recorded as a reservation row so cancellation can return exactly what
/// was taken.
async fn take_stock<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    resolved_items: &[(ResolvedProduct, i32)],
) -> Result<(), ServiceError> {
    let mut catalog: HashMap<Uuid, (String, bool)> = HashMap::new();
    let mut demands = Vec::new();

    for (resolved, quantity) in resolved_items {
        catalog.insert(
            resolved.product.id,
            (resolved.product.name.clone(), resolved.product.track_quantity),
        );
        for (component, _) in &resolved.components {
            catalog.insert(component.id, (component.name.clone(), component.track_quantity));
        }
        demands.extend(resolved.demands(*quantity));
    }

    for demand in inventory::merge_demands(demands) {
        let (name, tracked) = catalog
            .get(&demand.product_id)
            .cloned()
            .ok_or_else(|| ServiceError::InternalError("unresolved stock demand".into()))?;
        if tracked {
            inventory::decrement_if_available(conn, demand.product_id, &name, demand.quantity)
                .await?;
            stock_reservation::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(demand.product_id),
                quantity: Set(demand.quantity),
                created_at: Set(Utc::now()),
            }
            .insert(conn)
            .await?;
        }
    }
    Ok(())
}

/// Returns the stock a checkout took, from the reservation rows written at
/// checkout time. The rows are consumed, so a second call restores nothing.
pub(crate) async fn restore_stock_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<(), ServiceError> {
    let reservations = stock_reservation::Entity::find()
        .filter(stock_reservation::Column::OrderId.eq(order_id))
        .all(conn)
        .await?;

    for reservation in &reservations {
        inventory::increment(conn, reservation.product_id, reservation.quantity).await?;
    }

    stock_reservation::Entity::delete_many()
        .filter(stock_reservation::Column::OrderId.eq(order_id))
        .exec(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn shipping() -> ShippingConfig {
        ShippingConfig {
            flat_fee: dec!(9.90),
            free_threshold: dec!(1500),
        }
    }

    #[test]
    fn shipping_is_flat_below_the_threshold() {
        assert_eq!(compute_shipping(&shipping(), dec!(1200)), dec!(9.90));
        assert_eq!(compute_shipping(&shipping(), dec!(0.01)), dec!(9.90));
    }

    #[test]
    fn shipping_is_free_at_and_above_the_threshold() {
        assert_eq!(compute_shipping(&shipping(), dec!(1500)), Decimal::ZERO);
        assert_eq!(compute_shipping(&shipping(), dec!(1600)), Decimal::ZERO);
    }

    #[test]
    fn order_numbers_carry_the_date_and_an_eight_char_suffix() {
        let number = generate_order_number();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1], Utc::now().format("%Y%m%d").to_string());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
