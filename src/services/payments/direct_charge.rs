//! Direct-charge adapter (NuvemPago).
//!
//! Charges are created server-side and answered synchronously: cards are
//! usually approved or rejected on the spot, pix and boleto come back
//! pending with a page or QR code for the customer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::notification::value_as_string;
use super::{
    vendor_error, ChargeResult, GatewayError, PaymentGateway, PaymentInitiation, PaymentRequest,
    PaymentStatusReport,
};
use crate::config::DirectChargeConfig;
use crate::entities::order::PaymentMethod;

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    transaction_id: Option<String>,
    id: Option<Value>,
    status: String,
    message: Option<String>,
    payment_url: Option<String>,
    qr_code: Option<String>,
    order_reference: Option<String>,
    amount: Option<Decimal>,
    payment_method: Option<String>,
}

impl ChargeResponse {
    fn transaction_id(&self) -> Option<String> {
        self.transaction_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| self.id.as_ref().and_then(value_as_string))
    }
}

pub struct DirectChargeGateway {
    client: Client,
    config: DirectChargeConfig,
    base_url: String,
    timeout: Duration,
}

impl DirectChargeGateway {
    pub fn new(config: DirectChargeConfig, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::NotConfigured(e.to_string()))?;
        let base_url = config.effective_base_url();
        Ok(Self {
            client,
            config,
            base_url,
            timeout,
        })
    }

    fn credentials(&self) -> Result<(&str, &str), GatewayError> {
        if self.config.client_id.is_empty() || self.config.client_secret.is_empty() {
            return Err(GatewayError::NotConfigured(
                "client credentials are missing".to_string(),
            ));
        }
        Ok((self.config.client_id.as_str(), self.config.client_secret.as_str()))
    }

    fn charge_body(&self, request: &PaymentRequest) -> Value {
        let mut body = json!({
            "amount": request.amount.round_dp(2).to_f64().unwrap_or_default(),
            "currency": request.currency,
            "payment_method": request.method.as_str(),
            "order_reference": request.order_number,
            "description": format!("Pedido {}", request.order_number),
            "customer": {
                "name": request.customer.name,
                "email": request.customer.email,
                "phone": request.customer.phone,
                "document": request.customer.document,
            },
            "callback_url": request.notification_url,
        });
        if request.method == PaymentMethod::CreditCard {
            body["card_token"] = json!(request.card_token);
            body["installments"] = json!(request.installments.max(1));
        }
        body
    }

    /// Sandbox answers without a network round trip.
    fn simulate(&self, request: &PaymentRequest) -> ChargeResult {
        let number = &request.order_number;
        let (transaction_id, vendor_status, payment_url, qr_code) = match request.method {
            PaymentMethod::CreditCard => (format!("TXN_{}", number), "approved", None, None),
            PaymentMethod::Pix => (
                format!("PIX_{}", number),
                "pending",
                Some(format!("{}/pix/{}", self.base_url, number)),
                Some(format!("00020126580014br.gov.bcb.pix0136{}", number)),
            ),
            PaymentMethod::Boleto => (
                format!("BOL_{}", number),
                "pending",
                Some(format!("{}/boleto/{}", self.base_url, number)),
                None,
            ),
        };
        info!(%transaction_id, vendor_status, "simulated charge");
        ChargeResult {
            transaction_id,
            status: self.normalize_status(vendor_status),
            vendor_status: vendor_status.to_string(),
            message: Some("simulated".to_string()),
            payment_url,
            qr_code,
            raw: None,
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> GatewayError {
        match GatewayError::from(err) {
            GatewayError::Timeout(_) => GatewayError::Timeout(self.timeout),
            other => other,
        }
    }

    async fn error_from(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        warn!(status, body = %body, "payment vendor returned an error");
        vendor_error(status, &body)
    }
}

#[async_trait]
impl PaymentGateway for DirectChargeGateway {
    fn name(&self) -> &'static str {
        "nuvempago"
    }

    #[instrument(skip(self, request), fields(order_number = %request.order_number, method = request.method.as_str()))]
    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentInitiation, GatewayError> {
        if request.method == PaymentMethod::CreditCard
            && request.card_token.as_deref().map_or(true, str::is_empty)
        {
            return Err(GatewayError::InvalidRequest(
                "card_token is required for credit card payments".to_string(),
            ));
        }

        if self.config.simulate {
            return Ok(PaymentInitiation::Charge(self.simulate(request)));
        }

        let (client_id, client_secret) = self.credentials()?;
        let response = self
            .client
            .post(format!("{}/payments", self.base_url))
            .basic_auth(client_id, Some(client_secret))
            .header("Idempotency-Key", request.order_id.to_string())
            .json(&self.charge_body(request))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let charge: ChargeResponse = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let transaction_id = charge
            .transaction_id()
            .ok_or_else(|| GatewayError::MalformedResponse("charge has no transaction id".into()))?;

        Ok(PaymentInitiation::Charge(ChargeResult {
            transaction_id,
            status: self.normalize_status(&charge.status),
            vendor_status: charge.status,
            message: charge.message,
            payment_url: charge.payment_url,
            qr_code: charge.qr_code,
            raw: Some(raw),
        }))
    }

    #[instrument(skip(self))]
    async fn fetch_status(
        &self,
        external_payment_id: &str,
    ) -> Result<PaymentStatusReport, GatewayError> {
        if self.config.simulate {
            let vendor_status = if external_payment_id.starts_with("TXN_") {
                "approved"
            } else {
                "pending"
            };
            return Ok(PaymentStatusReport {
                external_payment_id: external_payment_id.to_string(),
                order_reference: external_payment_id
                    .split_once('_')
                    .map(|(_, number)| number.to_string()),
                status: self.normalize_status(vendor_status),
                vendor_status: vendor_status.to_string(),
                amount: None,
                payment_method: None,
                raw: json!({ "simulated": true }),
            });
        }

        let (client_id, client_secret) = self.credentials()?;
        let response = self
            .client
            .get(format!("{}/payments/{}", self.base_url, external_payment_id))
            .basic_auth(client_id, Some(client_secret))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let charge: ChargeResponse = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        Ok(PaymentStatusReport {
            external_payment_id: charge
                .transaction_id()
                .unwrap_or_else(|| external_payment_id.to_string()),
            order_reference: charge.order_reference.clone(),
            status: self.normalize_status(&charge.status),
            vendor_status: charge.status,
            amount: charge.amount,
            payment_method: charge.payment_method,
            raw,
        })
    }
}
