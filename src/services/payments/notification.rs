//! Notification payload parsing shared by the gateway adapters.
//!
//! Two shapes are accepted:
//! * an envelope `{"type": "payment", "data": {"id": ...}}` (also `topic`,
//!   `event`, or the legacy `resource` URL form), where the status is
//!   usually absent and must be polled;
//! * a flat object carrying the order reference and a status directly.

use serde_json::{Map, Value};

use super::{NotificationParse, PaymentNotification};
use crate::entities::payment::PaymentStatus;

const ORDER_REFERENCE_KEYS: &[&str] = &[
    "external_reference",
    "order_reference",
    "order_number",
    "order_id",
];
const STATUS_KEYS: &[&str] = &["status", "payment_status"];
const PAYMENT_ID_KEYS: &[&str] = &["payment_id", "transaction_id", "id"];

/// Renders a string or number JSON value as a string.
pub(crate) fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(value_as_string))
}

fn is_payment_kind(kind: &str) -> bool {
    let kind = kind.to_ascii_lowercase();
    kind == "payment" || kind.starts_with("payment.") || kind == "charge" || kind.starts_with("charge.")
}

pub fn parse_payload(payload: &Value, normalize: impl Fn(&str) -> PaymentStatus) -> NotificationParse {
    let Some(object) = payload.as_object() else {
        return NotificationParse::Unrecognized("payload is not a JSON object".to_string());
    };

    let kind = first_string(object, &["type", "topic", "event", "action"]);
    let data = object.get("data").and_then(Value::as_object);

    if let Some(kind) = kind.filter(|_| data.is_some() || object.contains_key("resource")) {
        return parse_envelope(object, data, &kind, &normalize);
    }

    parse_flat(object, &normalize)
}

fn parse_envelope(
    object: &Map<String, Value>,
    data: Option<&Map<String, Value>>,
    kind: &str,
    normalize: &impl Fn(&str) -> PaymentStatus,
) -> NotificationParse {
    if !is_payment_kind(kind) {
        return NotificationParse::Unrecognized(format!("unsupported notification type '{}'", kind));
    }

    let payment_id = data
        .and_then(|d| first_string(d, &["id", "payment_id", "transaction_id"]))
        .or_else(|| {
            object
                .get("resource")
                .and_then(value_as_string)
                .and_then(|r| r.rsplit('/').next().map(str::to_string))
                .filter(|id| !id.is_empty())
        });

    let Some(external_payment_id) = payment_id else {
        return NotificationParse::Unrecognized("notification carries no payment id".to_string());
    };

    // "payment.approved" style events carry the status in the event name.
    let vendor_status = data
        .and_then(|d| first_string(d, STATUS_KEYS))
        .or_else(|| first_string(object, STATUS_KEYS))
        .or_else(|| {
            kind.split_once('.')
                .map(|(_, suffix)| suffix.to_string())
                .filter(|suffix| normalize(suffix) != PaymentStatus::Unknown)
        });

    let order_reference = data
        .and_then(|d| first_string(d, ORDER_REFERENCE_KEYS))
        .or_else(|| first_string(object, &["external_reference", "order_reference"]));

    NotificationParse::Recognized(PaymentNotification {
        external_payment_id,
        order_reference,
        status: vendor_status.as_deref().map(normalize),
        vendor_status,
        synthetic_id: false,
        raw: Value::Object(object.clone()),
    })
}

fn parse_flat(
    object: &Map<String, Value>,
    normalize: &impl Fn(&str) -> PaymentStatus,
) -> NotificationParse {
    let order_reference = first_string(object, ORDER_REFERENCE_KEYS);
    let vendor_status = first_string(object, STATUS_KEYS);
    let payment_id = first_string(object, PAYMENT_ID_KEYS);

    let Some(status_raw) = vendor_status else {
        return NotificationParse::Unrecognized("unrecognized payload shape".to_string());
    };

    // Without a vendor id the order/status pair itself is the idempotency key.
    let (external_payment_id, synthetic_id) = match (payment_id, &order_reference) {
        (Some(id), _) => (id, false),
        (None, Some(reference)) => (
            format!("{}:{}", reference, status_raw.to_ascii_lowercase()),
            true,
        ),
        (None, None) => {
            return NotificationParse::Unrecognized(
                "notification identifies neither an order nor a payment".to_string(),
            )
        }
    };

    NotificationParse::Recognized(PaymentNotification {
        external_payment_id,
        order_reference,
        status: Some(normalize(&status_raw)),
        vendor_status: Some(status_raw),
        synthetic_id,
        raw: Value::Object(object.clone()),
    })
}
