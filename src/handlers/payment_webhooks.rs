use axum::{
    extract::{Query, RawQuery, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    entities::order::{OrderPaymentStatus, OrderStatus},
    errors::ServiceError,
    services::reconciliation::ReconcileOutcome,
    ApiResponse, AppState,
};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

// POST /api/v1/orders/payment-webhook
#[utoipa::path(
    post,
    path = "/api/v1/orders/payment-webhook",
    request_body = String,
    responses(
        (status = 200, description = "Notification acknowledged", body = ReconcileOutcome),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment could not be looked up, retry later", body = crate::errors::ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    receive_notification(&state, &headers, query.as_deref(), &body, "webhook").await
}

// POST /api/v1/orders/payment-callback
#[utoipa::path(
    post,
    path = "/api/v1/orders/payment-callback",
    request_body = String,
    responses(
        (status = 200, description = "Notification acknowledged", body = ReconcileOutcome),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    receive_notification(&state, &headers, query.as_deref(), &body, "callback").await
}

async fn receive_notification(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &Bytes,
    source: &'static str,
) -> Result<Json<ApiResponse<ReconcileOutcome>>, ServiceError> {
    if let Some(secret) = state.config.payment.webhook_secret.as_deref() {
        let tolerance = state.config.payment.webhook_tolerance_secs;
        if !verify_signature(headers, body, secret, tolerance, chrono::Utc::now().timestamp()) {
            warn!(source, "payment notification signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let payload = notification_payload(body, query);
    match state
        .services
        .reconciliation
        .handle_notification(&payload)
        .await
    {
        Ok(outcome) => {
            info!(source, ?outcome, "payment notification processed");
            Ok(Json(ApiResponse::success(outcome)))
        }
        // Vendor lookups that fail are reported as not found so the vendor
        // redelivers later.
        Err(ServiceError::ExternalServiceError(reason)) => {
            warn!(source, %reason, "payment lookup failed, asking vendor to retry");
            Err(ServiceError::NotFound(
                "Payment could not be looked up".to_string(),
            ))
        }
        Err(err) => Err(err),
    }
}

/// JSON body, or the query string for vendors that notify with
/// `?topic=payment&id=123` and an empty body.
fn notification_payload(body: &[u8], query: Option<&str>) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value;
    }

    let params: Map<String, Value> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect()
        })
        .unwrap_or_default();

    if params.is_empty() {
        return Value::String(String::from_utf8_lossy(body).into_owned());
    }

    let mut object = params;
    let id = object
        .get("id")
        .or_else(|| object.get("data.id"))
        .cloned();
    if let Some(id) = id {
        if !object.contains_key("data") {
            let mut data = Map::new();
            data.insert("id".to_string(), id);
            object.insert("data".to_string(), Value::Object(data));
        }
    }
    Value::Object(object)
}

/// Checks `x-signature = hex(HMAC-SHA256(secret, "{x-timestamp}.{body}"))`
/// and that the timestamp is within `tolerance_secs` of `now`.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> bool {
    let (Some(ts), Some(sig)) = (
        headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok()),
        headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()),
    ) else {
        return false;
    };

    let Ok(ts_i) = ts.trim().parse::<i64>() else {
        return false;
    };
    if now.abs_diff(ts_i) > tolerance_secs {
        return false;
    }

    constant_time_eq(&sign(secret, ts.trim(), payload), sig.trim())
}

pub fn sign(secret: &str, timestamp: &str, payload: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PaymentReturnParams {
    /// `success`, `failure` or `pending`, set on the return URLs
    pub outcome: Option<String>,
    pub payment_id: Option<String>,
    pub collection_id: Option<String>,
    pub external_reference: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentReturnResponse {
    pub success: bool,
    pub order_id: Option<Uuid>,
    pub redirect_url: String,
}

// GET /api/v1/payment/return
#[utoipa::path(
    get,
    path = "/api/v1/payment/return",
    params(PaymentReturnParams),
    responses((status = 200, description = "Where to send the customer", body = PaymentReturnResponse)),
    tag = "payments"
)]
pub async fn payment_return(
    State(state): State<AppState>,
    Query(params): Query<PaymentReturnParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let payment_id = params
        .payment_id
        .as_deref()
        .or(params.collection_id.as_deref())
        .filter(|id| !id.is_empty() && *id != "null");

    let mut order_id = None;
    if let Some(payment_id) = payment_id {
        match state
            .services
            .reconciliation
            .reconcile_payment(payment_id)
            .await
        {
            Ok(outcome) => order_id = outcome.order_id(),
            Err(err) => warn!(%payment_id, error = %err, "return URL reconciliation failed"),
        }
    }

    let order = match (order_id, params.external_reference.as_deref()) {
        (Some(id), _) => Some(state.services.orders.get_order(id).await?.order),
        (None, Some(reference)) => state.services.orders.find_by_number(reference).await?,
        (None, None) => None,
    };

    let failed_return = params.outcome.as_deref() == Some("failure");
    let success = order.as_ref().is_some_and(|o| {
        o.status != OrderStatus::Cancelled
            && match o.payment_status {
                OrderPaymentStatus::Paid => true,
                OrderPaymentStatus::Pending => !failed_return,
                OrderPaymentStatus::Failed | OrderPaymentStatus::Refunded => false,
            }
    });

    let base = state.config.checkout.public_base_url.trim_end_matches('/');
    let redirect_url = match (&order, success) {
        (Some(o), true) => format!("{}/payment-success/{}", base, o.id),
        (Some(o), false) => format!("{}/payment-error/{}", base, o.id),
        (None, _) => format!("{}/payment-error", base),
    };

    Ok(Json(PaymentReturnResponse {
        success,
        order_id: order.map(|o| o.id),
        redirect_url,
    }))
}
