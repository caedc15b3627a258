use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::entities::payment::{PaymentState, ProviderKind};

/// Domain events emitted after a state change commits. Consumers are
/// in-process; durable side effects go through the notification outbox
/// instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    PaymentInitiated {
        payment_id: Uuid,
        order_id: Uuid,
        provider: ProviderKind,
    },
    PaymentStatusChanged {
        payment_id: Uuid,
        old_status: PaymentState,
        new_status: PaymentState,
    },
    PaymentRefunded {
        payment_id: Uuid,
        order_id: Uuid,
    },
    NotificationDispatched {
        order_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Drains the event channel and logs each event. Runs for the lifetime of
/// the process.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "order created");
            }
            Event::OrderCancelled(order_id) => {
                info!(order_id = %order_id, "order cancelled");
            }
            Event::PaymentInitiated {
                payment_id,
                order_id,
                provider,
            } => {
                info!(payment_id = %payment_id, order_id = %order_id, provider = %provider, "payment initiated");
            }
            Event::PaymentStatusChanged {
                payment_id,
                old_status,
                new_status,
            } => {
                info!(
                    payment_id = %payment_id,
                    old_status = old_status.as_str(),
                    new_status = new_status.as_str(),
                    "payment status changed"
                );
            }
            Event::PaymentRefunded {
                payment_id,
                order_id,
            } => {
                info!(payment_id = %payment_id, order_id = %order_id, "payment refunded");
            }
            Event::NotificationDispatched { order_id } => {
                info!(order_id = %order_id, "notification dispatched");
            }
        }
    }
}
