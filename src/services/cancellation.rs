use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{DatabaseConnection, EntityTrait, Set, TransactionTrait};
use serde::Serialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::{self, OrderPaymentStatus, OrderStatus, RefundStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::InventoryLedger;
use crate::services::order_status::is_cancellable;
use crate::services::orders::update_order_versioned;

/// `now - created_at <= window`; the boundary instant is still inside.
pub fn within_cancellation_window(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    now.signed_duration_since(created_at) <= window
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CancellationReceipt {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub cancellation_reason: String,
    pub cancelled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_status: Option<RefundStatus>,
    pub released_lines: u32,
}

/// Customer-initiated cancellation within a fixed window after placement.
#[derive(Clone)]
pub struct CancellationService {
    db: Arc<DatabaseConnection>,
    ledger: InventoryLedger,
    event_sender: Arc<EventSender>,
    window: Duration,
}

impl CancellationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        window_days: i64,
    ) -> Self {
        Self {
            db,
            ledger: InventoryLedger::new(),
            event_sender,
            window: Duration::days(window_days),
        }
    }

    pub async fn cancel(
        &self,
        order_id: Uuid,
        requestor_email: &str,
        reason: &str,
    ) -> Result<CancellationReceipt, ServiceError> {
        self.cancel_at(order_id, requestor_email, reason, Utc::now())
            .await
    }

    /// Cancels as of `now`. Reads, validates and writes in one transaction;
    /// the versioned update makes a concurrent second cancel fail instead
    /// of releasing stock twice.
    #[instrument(skip(self, requestor_email, reason))]
    pub async fn cancel_at(
        &self,
        order_id: Uuid,
        requestor_email: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CancellationReceipt, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "Cancellation reason is required".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_cancel(order_id, requestor_email, reason, now).await {
                Err(ServiceError::ConcurrentModification(_)) if attempt < 2 => {
                    warn!(%order_id, "order changed during cancellation, re-reading");
                }
                other => return other,
            }
        }
    }

    async fn try_cancel(
        &self,
        order_id: Uuid,
        requestor_email: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CancellationReceipt, ServiceError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !order
            .customer_email
            .trim()
            .eq_ignore_ascii_case(requestor_email.trim())
        {
            return Err(ServiceError::Forbidden(
                "Order belongs to another customer".to_string(),
            ));
        }

        if !within_cancellation_window(order.created_at, now, self.window) {
            counter!("storefront.cancellation.rejected", 1, "reason" => "window_expired");
            return Err(ServiceError::CancellationWindowExpired(format!(
                "Orders can only be cancelled within {} days of purchase",
                self.window.num_days()
            )));
        }

        if !is_cancellable(order.status) {
            counter!("storefront.cancellation.rejected", 1, "reason" => "invalid_state");
            return Err(ServiceError::InvalidOrderState(format!(
                "Order {} is {} and can no longer be cancelled",
                order.order_number, order.status
            )));
        }

        let refund_status = if order.payment_status == OrderPaymentStatus::Paid {
            Some(RefundStatus::Requested)
        } else {
            order.refund_status
        };

        let updated = update_order_versioned(
            &txn,
            &order,
            order::ActiveModel {
                status: Set(OrderStatus::Cancelled),
                cancellation_reason: Set(Some(reason.to_string())),
                cancelled_at: Set(Some(now)),
                refund_status: Set(refund_status),
                ..Default::default()
            },
        )
        .await?;

        let released_lines = self.ledger.release_order(&txn, order.id).await?;
        txn.commit().await?;

        let refund_requested = refund_status == Some(RefundStatus::Requested);
        counter!("storefront.cancellation.completed", 1);
        info!(
            %order_id,
            order_number = %order.order_number,
            released_lines,
            refund_requested,
            "order cancelled"
        );
        self.event_sender
            .emit(Event::OrderCancelled {
                order_id,
                reason: reason.to_string(),
                refund_requested,
                cancelled_at: now,
            })
            .await;

        Ok(CancellationReceipt {
            order_id,
            order_number: updated.order_number,
            status: updated.status,
            cancellation_reason: reason.to_string(),
            cancelled_at: now,
            refund_status: updated.refund_status,
            released_lines,
        })
    }
}
