//! Payment lifecycle. All state changes, whether driven by the API or by a
//! webhook, funnel through [`apply_payment_transition`] so the state machine
//! and the order mirror are enforced in exactly one place.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, ConnectionTrait, DatabaseConnection, QueryOrder, TransactionTrait};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    order::{self, OrderStatus},
    order_line,
    payment::{self, PaymentState, ProviderKind},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications;
use crate::payments::{
    to_minor_units, PaymentGateways, PaymentLineItem, PaymentRequest, ProviderStatus,
};
use crate::services::orders::restore_stock_for_order;

/// What applying a target state to a payment actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        old: PaymentState,
        new: PaymentState,
    },
    /// The payment was already in the target state.
    NoOp,
    /// The transition is illegal from the current state. Webhook callers
    /// treat this as a stale event; API callers surface it as an error.
    Stale {
        current: PaymentState,
        attempted: PaymentState,
    },
}

/// Moves a payment to `target` and mirrors the outcome onto its order,
/// inside the caller's transaction.
///
/// Order mirror rules: an authorized or settled payment confirms a pending
/// order; a settlement landing on an already-confirmed order (two-phase
/// capture) moves it to processing and enqueues the confirmation
/// notification; a cancelled payment cancels the order and returns its
/// stock; a failed payment leaves the order pending so the customer can
/// retry with another provider.
pub(crate) async fn apply_payment_transition<C: ConnectionTrait>(
    conn: &C,
    payment: payment::Model,
    target: PaymentState,
) -> Result<(payment::Model, TransitionOutcome), ServiceError> {
    if payment.status == target {
        return Ok((payment, TransitionOutcome::NoOp));
    }
    if !payment.status.can_transition_to(target) {
        let outcome = TransitionOutcome::Stale {
            current: payment.status,
            attempted: target,
        };
        return Ok((payment, outcome));
    }

    let now = Utc::now();
    let old = payment.status;
    let order_id = payment.order_id;
    let version = payment.version;

    let mut update: payment::ActiveModel = payment.into();
    update.status = Set(target);
    update.updated_at = Set(now);
    update.version = Set(version + 1);
    match target {
        PaymentState::Authorized => update.authorized_at = Set(Some(now)),
        PaymentState::Paid => update.confirmed_at = Set(Some(now)),
        _ => {}
    }
    let updated = update.update(conn).await?;

    mirror_onto_order(conn, order_id, target).await?;

    Ok((updated, TransitionOutcome::Applied { old, new: target }))
}

async fn mirror_onto_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    target: PaymentState,
) -> Result<(), ServiceError> {
    let order = order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;

    let mut new_status = order.status;
    let mut settled = false;
    match target {
        PaymentState::Authorized => {
            if order.status == OrderStatus::Pending {
                new_status = OrderStatus::Confirmed;
            }
        }
        PaymentState::Paid => {
            settled = true;
            new_status = match order.status {
                OrderStatus::Pending => OrderStatus::Confirmed,
                OrderStatus::Confirmed => OrderStatus::Processing,
                other => other,
            };
        }
        PaymentState::Cancelled => {
            if order.status.can_transition_to(OrderStatus::Cancelled)
                && order.status != OrderStatus::Cancelled
            {
                new_status = OrderStatus::Cancelled;
                restore_stock_for_order(conn, order_id).await?;
            }
        }
        PaymentState::Failed | PaymentState::Refunded | PaymentState::Pending => {}
    }

    // The payment row's own state machine already vetted this transition.
    // The order mirrors the latest applied state unconditionally: a fresh
    // attempt after a failed one must move the order's payment_status
    // forward again.
    let new_payment_status = target;

    let changed = new_status != order.status || new_payment_status != order.payment_status;
    if changed || settled {
        let version = order.version;
        let mut update: order::ActiveModel = order.clone().into();
        update.status = Set(new_status);
        update.payment_status = Set(new_payment_status);
        update.updated_at = Set(Utc::now());
        update.version = Set(version + 1);
        let updated = update.update(conn).await?;

        if settled {
            notifications::enqueue_order_confirmation(conn, &updated).await?;
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateways: Arc<PaymentGateways>,
    event_sender: EventSender,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateways: Arc<PaymentGateways>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            gateways,
            event_sender,
        }
    }

    /// Starts a payment attempt against a pending order. The provider call
    /// happens before anything is written, so a provider failure leaves no
    /// half-initialized payment row behind.
    #[instrument(skip(self), fields(%order_id, %provider))]
    pub async fn create_intent(
        &self,
        order_id: Uuid,
        provider: ProviderKind,
    ) -> Result<payment::Model, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;

        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is cancelled",
                order.order_number
            )));
        }
        if matches!(
            order.payment_status,
            PaymentState::Paid | PaymentState::Refunded
        ) {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is already paid",
                order.order_number
            )));
        }

        let lines = order_line::Entity::find()
            .filter(order_line::Column::OrderId.eq(order_id))
            .all(self.db.as_ref())
            .await?;
        let line_items: Vec<PaymentLineItem> = lines
            .iter()
            .map(|line| PaymentLineItem {
                name: line.name.clone(),
                sku: line.sku.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                tax_rate: line.tax_rate,
                tax_amount: line.tax_amount,
            })
            .collect();

        let request = PaymentRequest {
            order_id,
            amount: order.total_amount,
            currency: order.currency.clone(),
            customer_email: order.email.clone(),
            line_items,
        };

        let result = self.gateways.get(provider).create_payment(&request).await?;
        if result.status == ProviderStatus::Failed {
            return Err(ServiceError::ProviderError(format!(
                "{}: payment creation reported failure",
                provider
            )));
        }

        let now = Utc::now();
        let row = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            provider: Set(provider),
            provider_transaction_id: Set(Some(result.transaction_id.clone())),
            amount: Set(order.total_amount),
            currency: Set(order.currency.clone()),
            status: Set(result.status.payment_state()),
            client_secret: Set(result.client_secret.clone()),
            checkout_url: Set(result.checkout_url.clone()),
            embedded_snippet: Set(result.embedded_snippet.clone()),
            refunded_amount: Set(Decimal::ZERO),
            authorized_at: Set(None),
            confirmed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        };
        let created = row.insert(self.db.as_ref()).await?;

        info!(payment_id = %created.id, transaction_id = %result.transaction_id, "payment intent created");
        self.emit(Event::PaymentInitiated {
            payment_id: created.id,
            order_id,
            provider,
        })
        .await;
        Ok(created)
    }

    /// Polls the provider for the current state and applies it. The webhook
    /// flow usually gets there first; this is the customer-driven fallback.
    #[instrument(skip(self))]
    pub async fn confirm_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        let payment = self.get_payment(payment_id).await?;
        let transaction_id = required_transaction_id(&payment)?;

        let result = self
            .gateways
            .get(payment.provider)
            .confirm_payment(&transaction_id)
            .await?;
        let target = result.status.payment_state();

        let (updated, outcome) = self.transition_in_txn(payment_id, target).await?;
        if let TransitionOutcome::Applied { old, new } = outcome {
            self.emit(Event::PaymentStatusChanged {
                payment_id,
                old_status: old,
                new_status: new,
            })
            .await;
            if new == PaymentState::Authorized {
                self.acknowledge_best_effort(&updated).await;
            }
        }
        Ok(updated)
    }

    /// Settles an authorized two-phase payment.
    #[instrument(skip(self))]
    pub async fn capture_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        let payment = self.get_payment(payment_id).await?;
        if payment.status != PaymentState::Authorized {
            return Err(ServiceError::InvalidOperation(format!(
                "payment {} is {}, only authorized payments can be captured",
                payment_id,
                payment.status.as_str()
            )));
        }
        let transaction_id = required_transaction_id(&payment)?;
        let amount_minor = to_minor_units(payment.amount, &payment.currency)?;

        self.gateways
            .get(payment.provider)
            .capture_payment(&transaction_id, amount_minor)
            .await?;

        let (updated, outcome) = self.transition_in_txn(payment_id, PaymentState::Paid).await?;
        if let TransitionOutcome::Applied { old, new } = outcome {
            self.emit(Event::PaymentStatusChanged {
                payment_id,
                old_status: old,
                new_status: new,
            })
            .await;
        }
        Ok(updated)
    }

    /// Cancels a payment attempt at the provider and locally. Two-phase
    /// providers only support cancellation of an authorized order.
    #[instrument(skip(self))]
    pub async fn cancel_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        let payment = self.get_payment(payment_id).await?;
        match (payment.provider, payment.status) {
            (_, PaymentState::Paid | PaymentState::Refunded) => {
                return Err(ServiceError::InvalidOperation(
                    "settled payments are refunded, not cancelled".into(),
                ));
            }
            (_, PaymentState::Cancelled | PaymentState::Failed) => {
                return Err(ServiceError::InvalidOperation(format!(
                    "payment {} is already {}",
                    payment_id,
                    payment.status.as_str()
                )));
            }
            (ProviderKind::Bnpl, PaymentState::Pending) => {
                return Err(ServiceError::InvalidOperation(
                    "bnpl payments can only be cancelled after authorization".into(),
                ));
            }
            _ => {}
        }

        let transaction_id = required_transaction_id(&payment)?;
        self.gateways
            .get(payment.provider)
            .cancel_payment(&transaction_id)
            .await?;

        let (updated, outcome) = self
            .transition_in_txn(payment_id, PaymentState::Cancelled)
            .await?;
        if let TransitionOutcome::Applied { old, new } = outcome {
            self.emit(Event::PaymentStatusChanged {
                payment_id,
                old_status: old,
                new_status: new,
            })
            .await;
        }
        Ok(updated)
    }

    /// Refunds a settled payment, partially or in full. A full refund moves
    /// the payment to refunded; the order itself is never touched, return
    /// handling is a human decision.
    #[instrument(skip(self))]
    pub async fn create_refund(
        &self,
        payment_id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<payment::Model, ServiceError> {
        let payment = self.get_payment(payment_id).await?;
        if !matches!(payment.status, PaymentState::Paid) {
            return Err(ServiceError::InvalidOperation(format!(
                "payment {} is {}, only settled payments can be refunded",
                payment_id,
                payment.status.as_str()
            )));
        }

        let remaining = payment.amount - payment.refunded_amount;
        let amount = amount.unwrap_or(remaining);
        if amount <= Decimal::ZERO || amount > remaining {
            return Err(ServiceError::ValidationError(format!(
                "refund amount must be between 0 and the remaining {} {}",
                remaining, payment.currency
            )));
        }

        let transaction_id = required_transaction_id(&payment)?;
        let amount_minor = to_minor_units(amount, &payment.currency)?;
        self.gateways
            .get(payment.provider)
            .refund_payment(&transaction_id, amount_minor)
            .await?;

        let txn = self.db.begin().await?;
        let current = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {} not found", payment_id)))?;

        let refunded_total = current.refunded_amount + amount;
        let fully_refunded = refunded_total >= current.amount;
        let order_id = current.order_id;
        let version = current.version;

        let mut update: payment::ActiveModel = current.into();
        update.refunded_amount = Set(refunded_total);
        update.updated_at = Set(Utc::now());
        update.version = Set(version + 1);
        let updated = update.update(&txn).await?;

        let updated = if fully_refunded {
            let (updated, _) =
                apply_payment_transition(&txn, updated, PaymentState::Refunded).await?;
            updated
        } else {
            updated
        };
        txn.commit().await?;

        info!(%payment_id, %amount, fully_refunded, "refund recorded");
        self.emit(Event::PaymentRefunded {
            payment_id,
            order_id,
        })
        .await;
        Ok(updated)
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        payment::Entity::find_by_id(payment_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {} not found", payment_id)))
    }

    pub async fn list_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }

    /// Re-reads the payment inside a fresh transaction and applies the
    /// target state, so a webhook landing in parallel cannot be clobbered.
    async fn transition_in_txn(
        &self,
        payment_id: Uuid,
        target: PaymentState,
    ) -> Result<(payment::Model, TransitionOutcome), ServiceError> {
        let txn = self.db.begin().await?;
        let payment = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {} not found", payment_id)))?;

        let (updated, outcome) = apply_payment_transition(&txn, payment, target).await?;
        if let TransitionOutcome::Stale { current, attempted } = &outcome {
            return Err(ServiceError::InvalidOperation(format!(
                "payment {} cannot move from {} to {}",
                payment_id,
                current.as_str(),
                attempted.as_str()
            )));
        }
        txn.commit().await?;
        Ok((updated, outcome))
    }

    async fn acknowledge_best_effort(&self, payment: &payment::Model) {
        if let Some(transaction_id) = payment.provider_transaction_id.as_deref() {
            if let Err(e) = self
                .gateways
                .get(payment.provider)
                .acknowledge(transaction_id)
                .await
            {
                warn!(payment_id = %payment.id, error = %e, "provider acknowledgment failed, will rely on retry");
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "event channel closed, payment event dropped");
        }
    }
}

fn required_transaction_id(payment: &payment::Model) -> Result<String, ServiceError> {
    payment
        .provider_transaction_id
        .clone()
        .ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "payment {} has no provider transaction",
                payment.id
            ))
        })
}
