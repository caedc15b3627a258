//! Order-confirmation notifications via a transactional outbox. Rows are
//! enqueued inside the transaction that settles the payment; a background
//! worker drains them with at-least-once delivery and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, ConnectionTrait, DatabaseConnection, QueryOrder, QuerySelect};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    order,
    outbox_notification::{self, OutboxStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

pub const ORDER_CONFIRMATION: &str = "order_confirmation";

const MAX_ATTEMPTS: i32 = 5;
const BATCH_SIZE: u64 = 20;

/// Payload stored on the outbox row and handed to the mail sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_id: Uuid,
    pub order_number: String,
    pub email: String,
    pub total_amount: rust_decimal::Decimal,
    pub currency: String,
}

/// Enqueues the confirmation for a settled order. Must be called inside the
/// transaction that records the settlement, so the notification exists iff
/// the payment does.
pub async fn enqueue_order_confirmation<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
) -> Result<(), ServiceError> {
    let payload = OrderConfirmation {
        order_id: order.id,
        order_number: order.order_number.clone(),
        email: order.email.clone(),
        total_amount: order.total_amount,
        currency: order.currency.clone(),
    };
    let payload = serde_json::to_value(&payload)
        .map_err(|e| ServiceError::InternalError(format!("outbox payload: {}", e)))?;

    let now = Utc::now();
    let row = outbox_notification::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        notification_type: Set(ORDER_CONFIRMATION.to_string()),
        payload: Set(payload),
        status: Set(OutboxStatus::Pending),
        attempts: Set(0),
        available_at: Set(now),
        created_at: Set(now),
        updated_at: Set(now),
    };
    row.insert(conn).await?;

    info!(order_id = %order.id, "order confirmation enqueued");
    Ok(())
}

/// Delay before the next delivery attempt: 30s doubling per attempt.
fn backoff_delay(attempts: i32) -> chrono::Duration {
    let exponent = (attempts - 1).clamp(0, 6) as u32;
    chrono::Duration::seconds(30 * 2_i64.pow(exponent))
}

/// Background worker draining the outbox table.
pub struct NotificationWorker {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    poll_interval: Duration,
}

impl NotificationWorker {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db,
            event_sender,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Runs for the lifetime of the process.
    pub async fn run(self) {
        info!("notification worker started");
        loop {
            match self.drain_once().await {
                Ok(0) => {}
                Ok(delivered) => info!(delivered, "notifications dispatched"),
                Err(e) => error!(error = %e, "notification drain failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Processes one batch of due rows. Exposed separately so tests can
    /// drive the worker deterministically.
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let due = outbox_notification::Entity::find()
            .filter(outbox_notification::Column::Status.eq(OutboxStatus::Pending))
            .filter(outbox_notification::Column::AvailableAt.lte(now))
            .order_by_asc(outbox_notification::Column::CreatedAt)
            .limit(BATCH_SIZE)
            .all(self.db.as_ref())
            .await?;

        let mut delivered = 0;
        for row in due {
            match self.deliver(&row).await {
                Ok(()) => {
                    self.mark(&row, OutboxStatus::Delivered, row.attempts + 1, now)
                        .await?;
                    delivered += 1;
                    if let Err(e) = self
                        .event_sender
                        .send(Event::NotificationDispatched {
                            order_id: row.order_id,
                        })
                        .await
                    {
                        warn!(error = %e, "event channel closed, notification event dropped");
                    }
                }
                Err(e) => {
                    let attempts = row.attempts + 1;
                    if attempts >= MAX_ATTEMPTS {
                        error!(outbox_id = %row.id, error = %e, "notification abandoned after {} attempts", attempts);
                        self.mark(&row, OutboxStatus::Failed, attempts, now).await?;
                    } else {
                        warn!(outbox_id = %row.id, error = %e, attempts, "notification delivery failed, backing off");
                        self.mark_retry(&row, attempts, now + backoff_delay(attempts))
                            .await?;
                    }
                }
            }
        }
        Ok(delivered)
    }

    /// Actual delivery. Wired to the log in this service; a mail provider
    /// integration slots in here.
    async fn deliver(&self, row: &outbox_notification::Model) -> Result<(), ServiceError> {
        let confirmation: OrderConfirmation = serde_json::from_value(row.payload.clone())
            .map_err(|e| ServiceError::InternalError(format!("outbox payload: {}", e)))?;

        info!(
            order_number = %confirmation.order_number,
            email = %confirmation.email,
            amount = %confirmation.total_amount,
            currency = %confirmation.currency,
            "sending order confirmation"
        );
        Ok(())
    }

    async fn mark(
        &self,
        row: &outbox_notification::Model,
        status: OutboxStatus,
        attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut update: outbox_notification::ActiveModel = row.clone().into();
        update.status = Set(status);
        update.attempts = Set(attempts);
        update.updated_at = Set(now);
        update.update(self.db.as_ref()).await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        row: &outbox_notification::Model,
        attempts: i32,
        available_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut update: outbox_notification::ActiveModel = row.clone().into();
        update.attempts = Set(attempts);
        update.available_at = Set(available_at);
        update.updated_at = Set(Utc::now());
        update.update(self.db.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_is_capped() {
        assert_eq!(backoff_delay(1), chrono::Duration::seconds(30));
        assert_eq!(backoff_delay(2), chrono::Duration::seconds(60));
        assert_eq!(backoff_delay(3), chrono::Duration::seconds(120));
        // capped at 2^6
        assert_eq!(backoff_delay(40), chrono::Duration::seconds(30 * 64));
    }
}
