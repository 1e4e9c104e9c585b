//! Payment gateway abstraction
//!
//! Checkout and reconciliation talk to the vendor only through
//! [`PaymentGateway`]. Two adapters exist: a hosted-checkout "preference"
//! flow that redirects the customer, and a direct-charge API that returns a
//! transaction immediately. Both normalize vendor statuses into
//! [`PaymentStatus`].

pub mod direct_charge;
pub mod notification;
pub mod preference;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{PaymentConfig, PaymentProvider};
use crate::entities::order::PaymentMethod;
use crate::entities::payment::PaymentStatus;

pub use direct_charge::DirectChargeGateway;
pub use preference::PreferenceGateway;
pub use status::normalize_status;

#[derive(Debug, Clone, Serialize)]
pub struct PaymentCustomer {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub document: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentItem {
    pub sku: String,
    pub title: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

/// Everything a vendor needs to take payment for one order.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    /// Correlation id echoed back in notifications
    pub order_number: String,
    pub amount: Decimal,
    pub shipping_cost: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub card_token: Option<String>,
    pub installments: u8,
    pub customer: PaymentCustomer,
    pub items: Vec<PaymentItem>,
    pub notification_url: String,
    pub return_urls: ReturnUrls,
}

/// Immediate outcome of a direct charge.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChargeResult {
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub vendor_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Pix/boleto page the customer completes payment on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(skip)]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentInitiation {
    /// Customer must be sent to the vendor's hosted checkout
    Redirect {
        preference_id: String,
        checkout_url: String,
    },
    Charge(ChargeResult),
}

/// Authoritative payment state fetched from the vendor.
#[derive(Debug, Clone)]
pub struct PaymentStatusReport {
    pub external_payment_id: String,
    pub order_reference: Option<String>,
    pub status: PaymentStatus,
    pub vendor_status: String,
    pub amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub raw: Value,
}

/// A payment event extracted from a webhook or callback body.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentNotification {
    pub external_payment_id: String,
    pub order_reference: Option<String>,
    /// Absent when the vendor only signals that something changed
    pub status: Option<PaymentStatus>,
    pub vendor_status: Option<String>,
    /// `external_payment_id` was derived from the order reference and
    /// status; the vendor cannot be polled with it
    pub synthetic_id: bool,
    pub raw: Value,
}

impl PaymentNotification {
    /// The vendor must be polled before this notification can be applied.
    pub fn needs_lookup(&self) -> bool {
        self.status.is_none() || self.order_reference.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationParse {
    Recognized(PaymentNotification),
    Unrecognized(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway is not configured: {0}")]
    NotConfigured(String),

    #[error("invalid payment request: {0}")]
    InvalidRequest(String),

    #[error("payment gateway timed out after {0:?}")]
    Timeout(Duration),

    #[error("payment gateway unreachable: {0}")]
    Transport(String),

    #[error("payment gateway returned HTTP {status}: {message}")]
    Vendor { status: u16, message: String },

    #[error("unexpected payment gateway response: {0}")]
    MalformedResponse(String),
}

impl GatewayError {
    /// Failures caused by what the customer sent rather than by the vendor.
    pub fn is_request_side(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidRequest(_) | GatewayError::Vendor { status: 400 | 422, .. }
        )
    }

    /// Short message safe to show to a customer.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::NotConfigured(_) => "payment gateway is not configured".to_string(),
            GatewayError::InvalidRequest(msg) => msg.clone(),
            GatewayError::Timeout(_) => "payment gateway timed out".to_string(),
            GatewayError::Transport(_) => "payment gateway is unreachable".to_string(),
            GatewayError::Vendor { message, .. } => message.clone(),
            GatewayError::MalformedResponse(_) => {
                "unexpected response from payment gateway".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            GatewayError::MalformedResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Stored on payment records as the gateway that observed them.
    fn name(&self) -> &'static str;

    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentInitiation, GatewayError>;

    fn normalize_status(&self, vendor_status: &str) -> PaymentStatus {
        normalize_status(vendor_status)
    }

    async fn fetch_status(
        &self,
        external_payment_id: &str,
    ) -> Result<PaymentStatusReport, GatewayError>;

    fn parse_notification(&self, payload: &Value) -> NotificationParse {
        notification::parse_payload(payload, |raw| self.normalize_status(raw))
    }
}

/// Builds the adapter selected by `payment.provider`.
pub fn build_gateway(config: &PaymentConfig) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
    let gateway: Arc<dyn PaymentGateway> = match config.provider {
        PaymentProvider::Preference => Arc::new(PreferenceGateway::new(
            config.preference.clone(),
            config.timeout(),
        )?),
        PaymentProvider::DirectCharge => Arc::new(DirectChargeGateway::new(
            config.direct_charge.clone(),
            config.timeout(),
        )?),
    };
    Ok(gateway)
}

/// Extracts a short vendor error message from an error response body.
pub(crate) fn vendor_error(status: u16, body: &str) -> GatewayError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "error_description", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| format!("payment gateway returned HTTP {}", status));
    GatewayError::Vendor { status, message }
}
