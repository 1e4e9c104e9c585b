use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::{OrderPaymentStatus, OrderStatus};
use crate::entities::payment::PaymentStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Fire-and-forget send for events emitted after a commit. A full or
    /// closed channel is logged and never fails the caller.
    pub async fn emit(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                counter!("storefront.events.dropped", 1);
                warn!(event = event.name(), "event channel full, event dropped");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event = event.name(), "event channel closed, event dropped");
            }
        }
    }
}

/// Domain events published after the owning transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderPlaced {
        order_id: Uuid,
        order_number: String,
        total: Decimal,
    },
    PaymentReconciled {
        order_id: Uuid,
        payment_id: String,
        payment_status: PaymentStatus,
        order_status: OrderStatus,
        order_payment_status: OrderPaymentStatus,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: String,
        refund_requested: bool,
        cancelled_at: DateTime<Utc>,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderPlaced { .. } => "order_placed",
            Event::PaymentReconciled { .. } => "payment_reconciled",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::OrderStatusChanged { .. } => "order_status_changed",
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("storefront.events.processed", 1, "event" => event.name());
        match &event {
            Event::OrderPlaced {
                order_id,
                order_number,
                total,
            } => {
                info!(%order_id, %order_number, %total, "order placed");
            }
            Event::PaymentReconciled {
                order_id,
                payment_id,
                payment_status,
                order_status,
                order_payment_status,
            } => {
                info!(
                    %order_id,
                    %payment_id,
                    %payment_status,
                    %order_status,
                    %order_payment_status,
                    "payment reconciled"
                );
            }
            Event::OrderCancelled {
                order_id,
                reason,
                refund_requested,
                ..
            } => {
                info!(%order_id, %reason, refund_requested, "order cancelled");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
        }
    }

    info!("Event processing loop stopped");
}
