use crate::{
    config::CheckoutConfig,
    entities::{
        order::{self, OrderPaymentStatus, OrderStatus, PaymentMethod},
        order_item, payment,
        payment::PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        commerce::{
            cart_service::{CartService, CartSnapshot},
            pricing::{OrderTotals, ShippingPolicy},
        },
        inventory::InventoryLedger,
        order_status::plan_payment_transition,
        orders::OrderDetails,
        payments::{
            ChargeResult, GatewayError, PaymentCustomer, PaymentGateway, PaymentInitiation,
            PaymentItem, PaymentRequest, ReturnUrls,
        },
    },
};
use chrono::Utc;
use metrics::{counter, histogram};
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, DatabaseTransaction, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn validate_document(document: &str) -> Result<(), ValidationError> {
    let digits: String = document.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 {
        Ok(())
    } else {
        let mut err = ValidationError::new("document");
        err.message = Some("Document must contain 11 digits".into());
        Err(err)
    }
}

fn default_installments() -> u8 {
    1
}

/// Customer contact, shipping and payment choice for placing an order.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    #[validate(length(min = 2, max = 120))]
    pub customer_name: String,
    #[validate(email)]
    pub customer_email: String,
    #[validate(length(min = 8, max = 20))]
    pub customer_phone: String,
    #[validate(custom = "validate_document")]
    pub customer_document: Option<String>,
    #[validate(length(min = 5, max = 500))]
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub card_token: Option<String>,
    #[serde(default = "default_installments")]
    #[validate(range(min = 1, max = 12))]
    pub installments: u8,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PlacedOrder {
    pub order: OrderDetails,
    pub payment: PaymentInitiation,
}

/// `ORD-` followed by 12 upper-case hex characters.
pub fn generate_order_number() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("ORD-{}", id[..12].to_uppercase())
}

/// Turns a session cart into an order: reserves stock, asks the payment
/// gateway to start collecting, and clears the cart. Everything happens in
/// one transaction; any failure leaves stock, orders and the cart untouched.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    cart: CartService,
    ledger: InventoryLedger,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    shipping: ShippingPolicy,
    currency: String,
    public_base_url: String,
    payment_timeout: Duration,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        config: &CheckoutConfig,
        payment_timeout: Duration,
    ) -> Self {
        Self {
            cart: CartService::new(db.clone()),
            db,
            ledger: InventoryLedger::new(),
            gateway,
            event_sender,
            shipping: ShippingPolicy::from_config(config),
            currency: config.currency.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            payment_timeout,
        }
    }

    #[instrument(skip(self, request), fields(payment_method = request.payment_method.as_str()))]
    pub async fn place_order(
        &self,
        session_id: &str,
        request: CheckoutRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        request.validate()?;

        let cart = self.cart.snapshot(session_id).await?;
        for line in &cart.lines {
            if line.quantity > line.available_stock {
                counter!("storefront.checkout.failed", 1, "reason" => "insufficient_stock");
                return Err(ServiceError::InsufficientStock(format!(
                    "{} (requested {}, available {})",
                    line.product_name, line.quantity, line.available_stock
                )));
            }
        }

        let totals = OrderTotals::compute(
            cart.lines.iter().map(|l| (l.quantity, l.unit_price)),
            &self.shipping,
        );

        let txn = self.db.begin().await?;
        let order = self.insert_order(&txn, &request, &cart, &totals).await?;
        let items = self.insert_items_and_reserve(&txn, &order, &cart).await?;

        let payment_request = self.payment_request(&order, &request, &cart);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.payment_timeout,
            self.gateway.initiate(&payment_request),
        )
        .await;
        histogram!(
            "storefront.checkout.gateway_latency_seconds",
            started.elapsed().as_secs_f64()
        );

        let initiation = match outcome {
            Ok(Ok(initiation)) => initiation,
            Ok(Err(err)) => {
                txn.rollback().await?;
                return Err(self.initiation_failed(&order, err));
            }
            Err(_) => {
                txn.rollback().await?;
                return Err(self.initiation_failed(&order, GatewayError::Timeout(self.payment_timeout)));
            }
        };

        let order = match &initiation {
            PaymentInitiation::Redirect { preference_id, .. } => {
                let version = order.version;
                let mut active: order::ActiveModel = order.into();
                active.payment_preference_id = Set(Some(preference_id.clone()));
                active.version = Set(version + 1);
                active.updated_at = Set(Utc::now());
                active.update(&txn).await?
            }
            PaymentInitiation::Charge(charge) => {
                if matches!(charge.status, PaymentStatus::Failed | PaymentStatus::Cancelled) {
                    txn.rollback().await?;
                    counter!("storefront.checkout.failed", 1, "reason" => "payment_rejected");
                    warn!(
                        order_number = %order.order_number,
                        vendor_status = %charge.vendor_status,
                        "payment rejected at checkout"
                    );
                    return Err(ServiceError::PaymentInitiationFailed(format!(
                        "Payment was rejected: {}",
                        charge.message.as_deref().unwrap_or(&charge.vendor_status)
                    )));
                }
                self.apply_charge(&txn, order, &request, charge).await?
            }
        };

        self.cart.clear(&txn, session_id).await?;
        txn.commit().await?;

        counter!("storefront.checkout.placed", 1);
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total,
            "order placed"
        );
        self.event_sender
            .emit(Event::OrderPlaced {
                order_id: order.id,
                order_number: order.order_number.clone(),
                total: order.total,
            })
            .await;

        Ok(PlacedOrder {
            order: OrderDetails { order, items },
            payment: initiation,
        })
    }

    async fn insert_order(
        &self,
        txn: &DatabaseTransaction,
        request: &CheckoutRequest,
        cart: &CartSnapshot,
        totals: &OrderTotals,
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(generate_order_number()),
            customer_name: Set(request.customer_name.trim().to_string()),
            customer_email: Set(request.customer_email.trim().to_lowercase()),
            customer_phone: Set(request.customer_phone.trim().to_string()),
            customer_document: Set(request.customer_document.clone()),
            shipping_address: Set(request.shipping_address.trim().to_string()),
            subtotal: Set(totals.subtotal),
            shipping_cost: Set(totals.shipping_cost),
            total: Set(totals.total),
            currency: Set(self.currency.clone()),
            status: Set(OrderStatus::Pending),
            payment_status: Set(OrderPaymentStatus::Pending),
            payment_method: Set(request.payment_method),
            payment_transaction_id: Set(None),
            payment_preference_id: Set(None),
            cancellation_reason: Set(None),
            cancelled_at: Set(None),
            refund_status: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        info!(order_number = %order.order_number, lines = cart.lines.len(), "order created");
        Ok(order)
    }

    async fn insert_items_and_reserve(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        cart: &CartSnapshot,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        let mut items = Vec::with_capacity(cart.lines.len());
        for line in &cart.lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name.clone()),
                product_sku: Set(line.product_sku.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                total: Set(line.line_total),
                created_at: Set(order.created_at),
            }
            .insert(txn)
            .await?;

            if let Err(err) = self.ledger.reserve(txn, line.product_id, line.quantity).await {
                counter!("storefront.checkout.failed", 1, "reason" => "insufficient_stock");
                return Err(err);
            }
            items.push(item);
        }
        Ok(items)
    }

    fn payment_request(
        &self,
        order: &order::Model,
        request: &CheckoutRequest,
        cart: &CartSnapshot,
    ) -> PaymentRequest {
        let return_url = |outcome: &str| {
            format!("{}/api/v1/payment/return?outcome={}", self.public_base_url, outcome)
        };
        PaymentRequest {
            order_id: order.id,
            order_number: order.order_number.clone(),
            amount: order.total,
            shipping_cost: order.shipping_cost,
            currency: order.currency.clone(),
            method: order.payment_method,
            card_token: request.card_token.clone(),
            installments: request.installments,
            customer: PaymentCustomer {
                name: order.customer_name.clone(),
                email: order.customer_email.clone(),
                phone: order.customer_phone.clone(),
                document: order.customer_document.clone(),
            },
            items: cart
                .lines
                .iter()
                .map(|line| PaymentItem {
                    sku: line.product_sku.clone(),
                    title: line.product_name.clone(),
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                })
                .collect(),
            notification_url: format!("{}/api/v1/orders/payment-webhook", self.public_base_url),
            return_urls: ReturnUrls {
                success: return_url("success"),
                failure: return_url("failure"),
                pending: return_url("pending"),
            },
        }
    }

    /// Records the first payment observation and moves the order to where
    /// the charge result says it should be.
    async fn apply_charge(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        request: &CheckoutRequest,
        charge: &ChargeResult,
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            payment_id: Set(charge.transaction_id.clone()),
            preference_id: Set(None),
            external_reference: Set(order.order_number.clone()),
            gateway: Set(self.gateway.name().to_string()),
            amount: Set(order.total),
            currency: Set(order.currency.clone()),
            status: Set(charge.status),
            vendor_status: Set(Some(charge.vendor_status.clone())),
            payment_method: Set(Some(request.payment_method.as_str().to_string())),
            payment_data: Set(charge.raw.clone()),
            paid_at: Set((charge.status == PaymentStatus::Paid).then_some(now)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        let plan = plan_payment_transition(&order, charge.status);
        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        if let Some(plan) = plan {
            active.payment_status = Set(plan.payment_status);
            active.status = Set(plan.status);
            active.refund_status = Set(plan.refund_status);
        }
        active.payment_transaction_id = Set(Some(charge.transaction_id.clone()));
        active.version = Set(version + 1);
        active.updated_at = Set(now);
        Ok(active.update(txn).await?)
    }

    fn initiation_failed(&self, order: &order::Model, err: GatewayError) -> ServiceError {
        warn!(
            order_number = %order.order_number,
            gateway = self.gateway.name(),
            error = %err,
            "payment initiation failed, checkout rolled back"
        );
        if err.is_request_side() {
            counter!("storefront.checkout.failed", 1, "reason" => "payment_request");
            ServiceError::BadRequest(err.public_message())
        } else {
            counter!("storefront.checkout.failed", 1, "reason" => "gateway");
            ServiceError::PaymentInitiationFailed(err.public_message())
        }
    }
}
