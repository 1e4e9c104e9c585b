use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront Checkout API

Cart, checkout, payment reconciliation and cancellation for the storefront.

## Sessions

Cart and checkout endpoints are anonymous and keyed by the `x-session-id`
header. Order listing, cancellation and fulfilment updates require a bearer
token:

```
Authorization: Bearer <your-jwt-token>
```

## Payment notifications

Vendors deliver notifications to `POST /api/v1/orders/payment-webhook`.
When a webhook secret is configured, deliveries must carry `x-timestamp` and
`x-signature` (hex HMAC-SHA256 of `"{timestamp}.{body}"`). Redelivered
notifications are acknowledged without changing the order again.

## Error Handling

```json
{
  "success": false,
  "error": "Bad Request",
  "message": "Insufficient stock: Blue Mug (requested 3, available 1)",
  "request_id": "6f1c0c1e-4d1b-4f0e-9d55-1f7f3a9a2b10",
  "timestamp": "2025-10-01T18:02:15Z"
}
```
"#,
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "cart", description = "Session cart"),
        (name = "orders", description = "Checkout, lookup, cancellation and fulfilment"),
        (name = "payments", description = "Vendor notifications and customer return URLs"),
        (name = "health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::cart::get_cart,
        crate::handlers::cart::add_to_cart,
        crate::handlers::cart::update_cart_item,
        crate::handlers::cart::remove_cart_item,
        crate::handlers::cart::clear_cart,

        crate::handlers::orders::create_order,
        crate::handlers::orders::get_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::refresh_payment,

        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::payment_webhooks::payment_callback,
        crate::handlers::payment_webhooks::payment_return,

        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,

            crate::handlers::cart::AddToCartRequest,
            crate::handlers::cart::UpdateCartItemRequest,
            crate::handlers::cart::CartView,
            crate::services::commerce::CartLine,
            crate::services::commerce::CartSnapshot,

            crate::services::commerce::CheckoutRequest,
            crate::services::commerce::PlacedOrder,
            crate::services::commerce::OrderTotals,
            crate::services::orders::OrderDetails,
            crate::services::payments::PaymentInitiation,
            crate::services::payments::ChargeResult,
            crate::entities::order::OrderStatus,
            crate::entities::order::OrderPaymentStatus,
            crate::entities::order::RefundStatus,
            crate::entities::order::PaymentMethod,
            crate::entities::payment::PaymentStatus,

            crate::handlers::orders::CancelOrderRequest,
            crate::handlers::orders::UpdateOrderStatusRequest,
            crate::services::cancellation::CancellationReceipt,
            crate::services::reconciliation::ReconcileOutcome,
            crate::handlers::payment_webhooks::PaymentReturnResponse,

            crate::handlers::health::HealthResponse,
            crate::handlers::health::ComponentStatus,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
