//! Hosted-checkout adapter (Mercado Pago "preferences").
//!
//! Initiation creates a checkout preference and hands back the URL the
//! customer is redirected to. The payment itself only becomes known through
//! notifications, which usually carry just an id to poll.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::notification::value_as_string;
use super::{
    vendor_error, GatewayError, PaymentGateway, PaymentInitiation, PaymentRequest,
    PaymentStatusReport,
};
use crate::config::PreferenceGatewayConfig;

const DEFAULT_BASE_URL: &str = "https://api.mercadopago.com";

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    id: String,
    init_point: Option<String>,
    sandbox_init_point: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VendorPayment {
    id: Value,
    status: String,
    external_reference: Option<String>,
    transaction_amount: Option<Decimal>,
    payment_method_id: Option<String>,
}

pub struct PreferenceGateway {
    client: Client,
    config: PreferenceGatewayConfig,
    base_url: String,
    timeout: Duration,
}

fn money(value: Decimal) -> f64 {
    value.round_dp(2).to_f64().unwrap_or_default()
}

impl PreferenceGateway {
    pub fn new(config: PreferenceGatewayConfig, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::NotConfigured(e.to_string()))?;
        let base_url = match config.base_url.trim_end_matches('/') {
            "" => DEFAULT_BASE_URL.to_string(),
            url => url.to_string(),
        };
        Ok(Self {
            client,
            config,
            base_url,
            timeout,
        })
    }

    fn access_token(&self) -> Result<&str, GatewayError> {
        match self.config.access_token.trim() {
            "" => Err(GatewayError::NotConfigured(
                "access token is missing".to_string(),
            )),
            token => Ok(token),
        }
    }

    fn preference_body(&self, request: &PaymentRequest) -> Value {
        let mut items: Vec<Value> = request
            .items
            .iter()
            .map(|item| {
                json!({
                    "id": item.sku,
                    "title": item.title,
                    "quantity": item.quantity,
                    "unit_price": money(item.unit_price),
                    "currency_id": request.currency,
                })
            })
            .collect();

        if request.shipping_cost > Decimal::ZERO {
            items.push(json!({
                "id": "shipping",
                "title": "Frete",
                "quantity": 1,
                "unit_price": money(request.shipping_cost),
                "currency_id": request.currency,
            }));
        }

        let mut payer = json!({
            "name": request.customer.name,
            "email": request.customer.email,
            "phone": { "number": request.customer.phone },
        });
        if let Some(document) = &request.customer.document {
            payer["identification"] = json!({ "type": "CPF", "number": document });
        }

        json!({
            "items": items,
            "payer": payer,
            "external_reference": request.order_number,
            "notification_url": request.notification_url,
            "back_urls": {
                "success": request.return_urls.success,
                "failure": request.return_urls.failure,
                "pending": request.return_urls.pending,
            },
            "auto_return": "approved",
            "statement_descriptor": "STOREFRONT",
        })
    }

    async fn error_from(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        warn!(status, body = %body, "payment vendor returned an error");
        vendor_error(status, &body)
    }

    fn map_transport(&self, err: reqwest::Error) -> GatewayError {
        match GatewayError::from(err) {
            GatewayError::Timeout(_) => GatewayError::Timeout(self.timeout),
            other => other,
        }
    }
}

#[async_trait]
impl PaymentGateway for PreferenceGateway {
    fn name(&self) -> &'static str {
        "mercadopago"
    }

    #[instrument(skip(self, request), fields(order_number = %request.order_number))]
    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentInitiation, GatewayError> {
        let token = self.access_token()?;
        let body = self.preference_body(request);

        let response = self
            .client
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(token)
            .header("X-Idempotency-Key", &request.order_number)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let preference: PreferenceResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let checkout_url = if self.config.sandbox {
            preference.sandbox_init_point.or(preference.init_point)
        } else {
            preference.init_point.or(preference.sandbox_init_point)
        }
        .ok_or_else(|| GatewayError::MalformedResponse("preference has no checkout url".into()))?;

        debug!(preference_id = %preference.id, "checkout preference created");
        Ok(PaymentInitiation::Redirect {
            preference_id: preference.id,
            checkout_url,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_status(
        &self,
        external_payment_id: &str,
    ) -> Result<PaymentStatusReport, GatewayError> {
        let token = self.access_token()?;
        let response = self
            .client
            .get(format!("{}/v1/payments/{}", self.base_url, external_payment_id))
            .bearer_auth(token)
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
        let payment: VendorPayment = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        Ok(PaymentStatusReport {
            external_payment_id: value_as_string(&payment.id)
                .unwrap_or_else(|| external_payment_id.to_string()),
            order_reference: payment.external_reference.filter(|r| !r.is_empty()),
            status: self.normalize_status(&payment.status),
            vendor_status: payment.status,
            amount: payment.transaction_amount,
            payment_method: payment.payment_method_id,
            raw,
        })
    }
}
