//! Payment reconciliation
//!
//! Applies vendor payment observations (webhooks, callbacks, polls) to
//! orders. Every observation is keyed by the vendor payment id, so replays
//! and out-of-order deliveries are absorbed instead of applied twice.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    NotSet, QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::{self, OrderPaymentStatus, OrderStatus};
use crate::entities::payment::{self, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::InventoryLedger;
use crate::services::order_status::plan_payment_transition;
use crate::services::orders::update_order_versioned;
use crate::services::payments::{
    NotificationParse, PaymentGateway, PaymentNotification, PaymentStatusReport,
};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        order_id: Uuid,
        status: OrderStatus,
        payment_status: OrderPaymentStatus,
    },
    Ignored {
        #[serde(skip_serializing_if = "Option::is_none")]
        order_id: Option<Uuid>,
        reason: String,
    },
    NotFound {
        reference: String,
    },
    Unrecognized {
        reason: String,
    },
}

impl ReconcileOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied { .. } => "applied",
            ReconcileOutcome::Ignored { .. } => "ignored",
            ReconcileOutcome::NotFound { .. } => "not_found",
            ReconcileOutcome::Unrecognized { .. } => "unrecognized",
        }
    }

    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            ReconcileOutcome::Applied { order_id, .. } => Some(*order_id),
            ReconcileOutcome::Ignored { order_id, .. } => *order_id,
            _ => None,
        }
    }
}

/// A payment observation with every field needed to apply it.
#[derive(Debug, Clone)]
struct ResolvedPayment {
    external_payment_id: String,
    order_reference: Option<String>,
    status: PaymentStatus,
    vendor_status: String,
    amount: Option<Decimal>,
    payment_method: Option<String>,
    /// False for ids derived locally from a flat notification
    vendor_issued: bool,
    raw: Value,
}

impl From<PaymentStatusReport> for ResolvedPayment {
    fn from(report: PaymentStatusReport) -> Self {
        Self {
            external_payment_id: report.external_payment_id,
            order_reference: report.order_reference,
            status: report.status,
            vendor_status: report.vendor_status,
            amount: report.amount,
            payment_method: report.payment_method,
            vendor_issued: true,
            raw: report.raw,
        }
    }
}

/// A replay is the same status again, or a non-terminal status arriving
/// after the payment already settled.
fn is_replay(existing: PaymentStatus, incoming: PaymentStatus) -> bool {
    existing == incoming || (existing.is_terminal() && !incoming.is_terminal())
}

#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: InventoryLedger,
    event_sender: Arc<EventSender>,
}

impl ReconciliationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            gateway,
            ledger: InventoryLedger::new(),
            event_sender,
        }
    }

    /// Entry point for webhook and callback bodies.
    #[instrument(skip(self, payload))]
    pub async fn handle_notification(
        &self,
        payload: &Value,
    ) -> Result<ReconcileOutcome, ServiceError> {
        match self.gateway.parse_notification(payload) {
            NotificationParse::Recognized(notification) => self.reconcile(notification).await,
            NotificationParse::Unrecognized(reason) => {
                debug!(%reason, "notification not recognized");
                counter!("storefront.reconciliation.outcome", 1, "outcome" => "unrecognized");
                Ok(ReconcileOutcome::Unrecognized { reason })
            }
        }
    }

    /// Applies one notification, polling the vendor first when it lacks a
    /// status or an order reference.
    #[instrument(skip(self, notification), fields(payment_id = %notification.external_payment_id))]
    pub async fn reconcile(
        &self,
        notification: PaymentNotification,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let resolved = if notification.needs_lookup() {
            let report = self.fetch(&notification.external_payment_id).await?;
            ResolvedPayment {
                order_reference: notification.order_reference.or(report.order_reference.clone()),
                ..ResolvedPayment::from(report)
            }
        } else {
            let status = notification.status.unwrap_or(PaymentStatus::Unknown);
            ResolvedPayment {
                external_payment_id: notification.external_payment_id,
                order_reference: notification.order_reference,
                status,
                vendor_status: notification
                    .vendor_status
                    .unwrap_or_else(|| status.to_string()),
                amount: None,
                payment_method: None,
                vendor_issued: !notification.synthetic_id,
                raw: notification.raw,
            }
        };
        self.apply_with_retry(resolved).await
    }

    /// Polls the vendor for `external_payment_id` and reconciles the answer.
    #[instrument(skip(self))]
    pub async fn reconcile_payment(
        &self,
        external_payment_id: &str,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let report = self.fetch(external_payment_id).await?;
        self.apply_with_retry(report.into()).await
    }

    /// Synchronous poll of the transaction stored on the order.
    #[instrument(skip(self))]
    pub async fn refresh_order(&self, order_id: Uuid) -> Result<ReconcileOutcome, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let Some(transaction_id) = order.payment_transaction_id.clone() else {
            return Ok(ReconcileOutcome::Ignored {
                order_id: Some(order.id),
                reason: "order has no payment transaction yet".to_string(),
            });
        };

        let report = self.fetch(&transaction_id).await?;
        let resolved = ResolvedPayment {
            order_reference: Some(order.order_number.clone()),
            ..ResolvedPayment::from(report)
        };
        self.apply_with_retry(resolved).await
    }

    async fn fetch(&self, external_payment_id: &str) -> Result<PaymentStatusReport, ServiceError> {
        self.gateway
            .fetch_status(external_payment_id)
            .await
            .map_err(|e| {
                warn!(payment_id = external_payment_id, error = %e, "payment status lookup failed");
                counter!("storefront.reconciliation.lookup_failed", 1);
                ServiceError::ExternalServiceError(e.to_string())
            })
    }

    async fn apply_with_retry(
        &self,
        resolved: ResolvedPayment,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let mut attempt = 1;
        loop {
            match self.apply(&resolved).await {
                Ok(outcome) => {
                    counter!("storefront.reconciliation.outcome", 1, "outcome" => outcome.label());
                    return Ok(outcome);
                }
                Err(err)
                    if attempt < MAX_ATTEMPTS
                        && (matches!(err, ServiceError::ConcurrentModification(_))
                            || err.is_unique_violation()) =>
                {
                    warn!(attempt, error = %err, "reconciliation lost a race, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn find_order(
        &self,
        txn: &DatabaseTransaction,
        resolved: &ResolvedPayment,
        existing: Option<&payment::Model>,
    ) -> Result<Option<order::Model>, ServiceError> {
        if let Some(reference) = &resolved.order_reference {
            let found = order::Entity::find()
                .filter(order::Column::OrderNumber.eq(reference.as_str()))
                .one(txn)
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        if let Some(record) = existing {
            return Ok(order::Entity::find_by_id(record.order_id).one(txn).await?);
        }
        Ok(order::Entity::find()
            .filter(order::Column::PaymentTransactionId.eq(resolved.external_payment_id.as_str()))
            .one(txn)
            .await?)
    }

    async fn apply(&self, resolved: &ResolvedPayment) -> Result<ReconcileOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let existing = payment::Entity::find()
            .filter(payment::Column::PaymentId.eq(resolved.external_payment_id.as_str()))
            .one(&txn)
            .await?;

        let Some(order) = self.find_order(&txn, resolved, existing.as_ref()).await? else {
            let reference = resolved
                .order_reference
                .clone()
                .unwrap_or_else(|| resolved.external_payment_id.clone());
            info!(%reference, "no order matches payment notification");
            return Ok(ReconcileOutcome::NotFound { reference });
        };

        if let Some(record) = &existing {
            if record.order_id != order.id {
                warn!(
                    payment_id = %record.payment_id,
                    recorded_order = %record.order_id,
                    order_id = %order.id,
                    "payment already recorded against another order"
                );
                return Ok(ReconcileOutcome::Ignored {
                    order_id: Some(order.id),
                    reason: "payment belongs to another order".to_string(),
                });
            }
            if is_replay(record.status, resolved.status) {
                debug!(status = %resolved.status, "duplicate or stale notification");
                return Ok(ReconcileOutcome::Ignored {
                    order_id: Some(order.id),
                    reason: format!("payment already {}", record.status),
                });
            }
        }

        if let (Some(amount), PaymentStatus::Paid) = (resolved.amount, resolved.status) {
            if amount != order.total {
                warn!(
                    order_id = %order.id,
                    expected = %order.total,
                    received = %amount,
                    "paid amount differs from order total"
                );
            }
        }

        self.upsert_record(&txn, &order, existing, resolved).await?;

        let Some(plan) = plan_payment_transition(&order, resolved.status) else {
            txn.commit().await?;
            info!(order_id = %order.id, vendor_status = %resolved.vendor_status, "unknown payment status recorded");
            return Ok(ReconcileOutcome::Ignored {
                order_id: Some(order.id),
                reason: format!("unknown payment status '{}'", resolved.vendor_status),
            });
        };

        // Only ids the vendor can answer for are kept for later polling.
        let transaction_id = resolved
            .vendor_issued
            .then(|| resolved.external_payment_id.clone());
        let transaction_changed =
            transaction_id.is_some() && order.payment_transaction_id != transaction_id;
        if plan.is_noop(&order) && !transaction_changed {
            txn.commit().await?;
            return Ok(ReconcileOutcome::Ignored {
                order_id: Some(order.id),
                reason: "order already up to date".to_string(),
            });
        }

        let updated = update_order_versioned(
            &txn,
            &order,
            order::ActiveModel {
                payment_status: Set(plan.payment_status),
                status: Set(plan.status),
                refund_status: Set(plan.refund_status),
                payment_transaction_id: match transaction_id {
                    Some(id) => Set(Some(id)),
                    None => NotSet,
                },
                ..Default::default()
            },
        )
        .await?;

        if plan.release_stock {
            self.ledger.release_order(&txn, order.id).await?;
        }

        txn.commit().await?;

        info!(
            order_id = %updated.id,
            payment_id = %resolved.external_payment_id,
            old_status = %order.status,
            status = %updated.status,
            payment_status = %updated.payment_status,
            "payment reconciled"
        );
        self.event_sender
            .emit(Event::PaymentReconciled {
                order_id: updated.id,
                payment_id: resolved.external_payment_id.clone(),
                payment_status: resolved.status,
                order_status: updated.status,
                order_payment_status: updated.payment_status,
            })
            .await;

        Ok(ReconcileOutcome::Applied {
            order_id: updated.id,
            status: updated.status,
            payment_status: updated.payment_status,
        })
    }

    async fn upsert_record(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        existing: Option<payment::Model>,
        resolved: &ResolvedPayment,
    ) -> Result<payment::Model, ServiceError> {
        let now = Utc::now();
        let paid_at = (resolved.status == PaymentStatus::Paid).then_some(now);

        let record = match existing {
            Some(record) => {
                let already_paid = record.paid_at;
                let mut active: payment::ActiveModel = record.into();
                active.status = Set(resolved.status);
                active.vendor_status = Set(Some(resolved.vendor_status.clone()));
                active.payment_data = Set(Some(resolved.raw.clone()));
                active.paid_at = Set(already_paid.or(paid_at));
                if let Some(amount) = resolved.amount {
                    active.amount = Set(amount);
                }
                active.updated_at = Set(now);
                active.update(txn).await?
            }
            None => {
                payment::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order.id),
                    payment_id: Set(resolved.external_payment_id.clone()),
                    preference_id: Set(order.payment_preference_id.clone()),
                    external_reference: Set(order.order_number.clone()),
                    gateway: Set(self.gateway.name().to_string()),
                    amount: Set(resolved.amount.unwrap_or(order.total)),
                    currency: Set(order.currency.clone()),
                    status: Set(resolved.status),
                    vendor_status: Set(Some(resolved.vendor_status.clone())),
                    payment_method: Set(resolved
                        .payment_method
                        .clone()
                        .or_else(|| Some(order.payment_method.as_str().to_string()))),
                    payment_data: Set(Some(resolved.raw.clone())),
                    paid_at: Set(paid_at),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?
            }
        };
        Ok(record)
    }
}
