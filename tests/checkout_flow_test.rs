//! Integration tests for the checkout flow.
//!
//! Tests cover:
//! - Cart → order placement with stock reservation
//! - Payment webhook moving the order to processing
//! - Cancellation releasing stock and requesting a refund
//! - Rollback on empty cart, insufficient stock and gateway failures

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use chrono::Duration;
use common::{
    checkout_body, checkout_request, json_body, money, InitiateScript, TestApp, CUSTOMER_EMAIL,
};
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;
use storefront_api::{
    entities::{
        order::{self, OrderPaymentStatus, OrderStatus, RefundStatus},
        payment::{self, PaymentStatus},
    },
    errors::ServiceError,
};
use uuid::Uuid;

// ==================== Happy Path ====================

#[tokio::test]
async fn checkout_pay_and_cancel_round_trip() {
    let app = TestApp::new().await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-1", 7, 2).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(checkout_body("pix")),
            &[("x-session-id", "sess-1")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;

    let data = &body["data"];
    assert_eq!(data["order"]["status"], "pending");
    assert_eq!(data["order"]["payment_status"], "pending");
    assert_eq!(money(&data["order"]["subtotal"]), dec!(100.00));
    assert_eq!(money(&data["order"]["shipping_cost"]), dec!(15.00));
    assert_eq!(money(&data["order"]["total"]), dec!(115.00));
    assert_eq!(data["payment"]["type"], "redirect");
    assert_eq!(data["order"]["items"].as_array().map(Vec::len), Some(1));

    let order_id: Uuid = data["order"]["id"].as_str().unwrap().parse().unwrap();
    let order_number = data["order"]["order_number"].as_str().unwrap().to_string();

    assert_eq!(app.stock_of(7).await, 3);
    assert!(app.state.services.cart.view("sess-1").await.unwrap().is_empty());

    let sent = app.gateway.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].order_number, order_number);
    assert_eq!(sent[0].amount, dec!(115.00));
    assert!(sent[0].notification_url.ends_with("/api/v1/orders/payment-webhook"));

    // Vendor confirms payment
    let notification = json!({
        "id": "PAY-1",
        "external_reference": order_number,
        "status": "approved"
    });
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders/payment-webhook",
            Some(notification),
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["outcome"], "applied");

    let paid = app.order(order_id).await;
    assert_eq!(paid.status, OrderStatus::Processing);
    assert_eq!(paid.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(paid.payment_transaction_id.as_deref(), Some("PAY-1"));

    // Customer cancels two days later
    let receipt = app
        .state
        .services
        .cancellation
        .cancel_at(
            order_id,
            CUSTOMER_EMAIL,
            "changed my mind",
            paid.created_at + Duration::days(2),
        )
        .await
        .expect("cancellation inside window");
    assert_eq!(receipt.status, OrderStatus::Cancelled);
    assert_eq!(receipt.refund_status, Some(RefundStatus::Requested));
    assert_eq!(receipt.released_lines, 1);

    let cancelled = app.order(order_id).await;
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(cancelled.refund_status, Some(RefundStatus::Requested));
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed my mind"));
    assert_eq!(app.stock_of(7).await, 5);
}

#[tokio::test]
async fn free_shipping_at_threshold() {
    let app = TestApp::new().await;
    app.seed_product(1, "Luminária", dec!(100.00), 10).await;
    app.add_to_cart("sess-free", 1, 2).await;

    let placed = app
        .state
        .services
        .checkout
        .place_order("sess-free", checkout_request("boleto"))
        .await
        .expect("order placed");

    assert_eq!(placed.order.order.subtotal, dec!(200.00));
    assert_eq!(placed.order.order.shipping_cost, dec!(0));
    assert_eq!(placed.order.order.total, dec!(200.00));
}

#[tokio::test]
async fn approved_direct_charge_processes_immediately() {
    let app = TestApp::with_gateway(
        InitiateScript::Charge {
            status: PaymentStatus::Paid,
            vendor_status: "approved",
        },
        |_| {},
    )
    .await;
    app.seed_product(3, "Camiseta", dec!(79.90), 4).await;
    app.add_to_cart("sess-card", 3, 1).await;

    let mut request = checkout_request("credit_card");
    request.card_token = Some("tok_visa".to_string());
    let placed = app
        .state
        .services
        .checkout
        .place_order("sess-card", request)
        .await
        .expect("order placed");

    let order = placed.order.order;
    assert_eq!(order.status, OrderStatus::Processing);
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(order.total, dec!(94.90));
    assert!(order.payment_transaction_id.is_some());

    let records = payment::Entity::find()
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, PaymentStatus::Paid);
    assert!(records[0].paid_at.is_some());
}

// ==================== Failure Paths ====================

#[tokio::test]
async fn empty_cart_is_rejected() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(checkout_body("pix")),
            &[("x-session-id", "nobody")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.gateway.requests().is_empty());
}

#[tokio::test]
async fn missing_session_header_is_rejected() {
    let app = TestApp::new().await;
    let response = app
        .request(Method::POST, "/api/v1/orders", Some(checkout_body("pix")), &[])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn insufficient_stock_leaves_everything_untouched() {
    let app = TestApp::new().await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-2", 7, 4).await;

    // Someone else bought most of it meanwhile
    app.state
        .services
        .cart
        .add_item("sess-other", 7, 3)
        .await
        .unwrap();
    app.state
        .services
        .checkout
        .place_order("sess-other", checkout_request("pix"))
        .await
        .unwrap();
    assert_eq!(app.stock_of(7).await, 2);

    let err = app
        .state
        .services
        .checkout
        .place_order("sess-2", checkout_request("pix"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(msg) if msg.contains("Caneca Azul"));

    assert_eq!(app.stock_of(7).await, 2);
    assert_eq!(app.state.services.cart.view("sess-2").await.unwrap().lines.len(), 1);
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 1);
}

#[tokio::test]
async fn gateway_failure_rolls_back_order_and_stock() {
    let app = TestApp::with_gateway(InitiateScript::Fail(503), |_| {}).await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-3", 7, 2).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(checkout_body("pix")),
            &[("x-session-id", "sess-3")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    assert_eq!(app.stock_of(7).await, 5);
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
    assert_eq!(app.state.services.cart.view("sess-3").await.unwrap().lines.len(), 1);
}

#[tokio::test]
async fn vendor_rejecting_request_is_a_bad_request() {
    let app = TestApp::with_gateway(InitiateScript::Fail(422), |_| {}).await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-4", 7, 1).await;

    let err = app
        .state
        .services
        .checkout
        .place_order("sess-4", checkout_request("pix"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::BadRequest(_));
    assert_eq!(app.stock_of(7).await, 5);
}

#[tokio::test]
async fn declined_charge_rolls_back() {
    let app = TestApp::with_gateway(
        InitiateScript::Charge {
            status: PaymentStatus::Failed,
            vendor_status: "rejected",
        },
        |_| {},
    )
    .await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-5", 7, 2).await;

    let mut request = checkout_request("credit_card");
    request.card_token = Some("tok_declined".to_string());
    let err = app
        .state
        .services
        .checkout
        .place_order("sess-5", request)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentInitiationFailed(msg) if msg.contains("rejected"));

    assert_eq!(app.stock_of(7).await, 5);
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
    assert_eq!(payment::Entity::find().count(&*app.state.db).await.unwrap(), 0);
}

#[tokio::test]
async fn gateway_timeout_rolls_back() {
    let app = TestApp::with_gateway(InitiateScript::Hang, |_| {}).await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-6", 7, 2).await;

    let err = app
        .state
        .services
        .checkout
        .place_order("sess-6", checkout_request("pix"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentInitiationFailed(msg) if msg.contains("timed out"));

    assert_eq!(app.stock_of(7).await, 5);
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_contact_details_fail_validation() {
    let app = TestApp::new().await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-7", 7, 1).await;

    let mut body = checkout_body("pix");
    body["customer_email"] = json!("not-an-email");
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(body),
            &[("x-session-id", "sess-7")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.stock_of(7).await, 5);
}

// ==================== Order Lookup ====================

#[tokio::test]
async fn customer_lists_only_own_orders() {
    let app = TestApp::new().await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 10).await;
    for session in ["a", "b"] {
        app.add_to_cart(session, 7, 1).await;
        app.state
            .services
            .checkout
            .place_order(session, checkout_request("pix"))
            .await
            .unwrap();
    }

    let response = app
        .request(
            Method::GET,
            "/api/v1/orders?page=1&limit=10",
            None,
            &[("authorization", &format!("Bearer {}", app.token()))],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["total"], 2);

    let stranger = app.token_for("someone@example.com", &[]);
    let response = app
        .request(
            Method::GET,
            "/api/v1/orders",
            None,
            &[("authorization", &format!("Bearer {}", stranger))],
        )
        .await;
    let body = json_body(response).await;
    assert_eq!(body["data"]["total"], 0);

    let response = app.request(Method::GET, "/api/v1/orders", None, &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_advances_fulfilment_status() {
    let app = TestApp::with_gateway(
        InitiateScript::Charge {
            status: PaymentStatus::Paid,
            vendor_status: "approved",
        },
        |_| {},
    )
    .await;
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart("sess-8", 7, 1).await;
    let mut request = checkout_request("credit_card");
    request.card_token = Some("tok".to_string());
    let placed = app
        .state
        .services
        .checkout
        .place_order("sess-8", request)
        .await
        .unwrap();
    let uri = format!("/api/v1/orders/{}/status", placed.order.order.id);

    let customer = format!("Bearer {}", app.token());
    let response = app
        .request(Method::PUT, &uri, Some(json!({"status": "shipped"})), &[("authorization", &customer)])
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin = format!("Bearer {}", app.admin_token());
    let response = app
        .request(Method::PUT, &uri, Some(json!({"status": "shipped"})), &[("authorization", &admin)])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.order(placed.order.order.id).await.status, OrderStatus::Shipped);

    // Skipping back is not allowed
    let response = app
        .request(Method::PUT, &uri, Some(json!({"status": "pending"})), &[("authorization", &admin)])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(Method::PUT, &uri, Some(json!({"status": "cancelled"})), &[("authorization", &admin)])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_status_endpoints() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["database"], "up");
    assert_eq!(body["payment_gateway"], "scripted");

    let response = app.request(Method::GET, "/api/v1/status", None, &[]).await;
    let body = json_body(response).await;
    assert_eq!(body["data"]["service"], "storefront-api");

    let response = app.request(Method::GET, "/api-docs/openapi.json", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
}
