pub mod cart;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::services::{
    cancellation::CancellationService,
    commerce::{CartService, CheckoutService},
    orders::OrderService,
    payments::PaymentGateway,
    reconciliation::ReconciliationService,
};

pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub cancellation: Arc<CancellationService>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: &AppConfig,
    ) -> Self {
        let cart = Arc::new(CartService::new(db.clone()));
        let orders = Arc::new(OrderService::new(db.clone(), event_sender.clone()));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            gateway.clone(),
            event_sender.clone(),
            &config.checkout,
            config.payment.timeout(),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            gateway.clone(),
            event_sender.clone(),
        ));
        let cancellation = Arc::new(CancellationService::new(
            db,
            event_sender,
            config.checkout.cancellation_window_days,
        ));

        Self {
            cart,
            orders,
            checkout,
            reconciliation,
            cancellation,
            gateway,
        }
    }
}
