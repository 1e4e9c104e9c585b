//! Payment reconciliation through webhooks, callbacks and polling.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{checkout_request, json_body, InitiateScript, TestApp};
use mockall::mock;
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;
use storefront_api::{
    entities::{
        order::{self, OrderPaymentStatus, OrderStatus, RefundStatus},
        payment::{self, PaymentStatus},
    },
    handlers::payment_webhooks::sign,
    services::{
        payments::{
            GatewayError, PaymentGateway, PaymentInitiation, PaymentRequest, PaymentStatusReport,
        },
        reconciliation::{ReconcileOutcome, ReconciliationService},
    },
};

mock! {
    pub Gateway {}

    #[async_trait]
    impl PaymentGateway for Gateway {
        fn name(&self) -> &'static str;
        async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentInitiation, GatewayError>;
        async fn fetch_status(&self, external_payment_id: &str) -> Result<PaymentStatusReport, GatewayError>;
    }
}

/// Places one order for two units of product 7 (stock 5) and returns it.
async fn placed_order(app: &TestApp, session: &str) -> order::Model {
    app.seed_product(7, "Caneca Azul", dec!(50.00), 5).await;
    app.add_to_cart(session, 7, 2).await;
    app.state
        .services
        .checkout
        .place_order(session, checkout_request("pix"))
        .await
        .expect("order placed")
        .order
        .order
}

async fn deliver(app: &TestApp, payload: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = app
        .request(Method::POST, "/api/v1/orders/payment-webhook", Some(payload), &[])
        .await;
    let status = response.status();
    (status, json_body(response).await)
}

// ==================== Idempotency ====================

#[tokio::test]
async fn duplicate_webhook_is_applied_once() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "dup").await;
    let payload = json!({
        "id": "PAY-42",
        "external_reference": order.order_number,
        "status": "approved"
    });

    let (status, body) = deliver(&app, payload.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "applied");
    let after_first = app.order(order.id).await;

    let (status, body) = deliver(&app, payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "ignored");

    let after_second = app.order(order.id).await;
    assert_eq!(after_second.version, after_first.version);
    assert_eq!(after_second.status, OrderStatus::Processing);
    assert_eq!(payment::Entity::find().count(&*app.state.db).await.unwrap(), 1);
    assert_eq!(app.stock_of(7).await, 3);
}

#[tokio::test]
async fn concurrent_duplicates_apply_once() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "race").await;
    let payload = json!({
        "payment_id": "PAY-RACE",
        "order_number": order.order_number,
        "status": "paid"
    });

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let service = app.state.services.reconciliation.clone();
        let payload = payload.clone();
        tasks.push(tokio::spawn(async move {
            service.handle_notification(&payload).await
        }));
    }

    let mut applied = 0;
    for task in tasks {
        if let Ok(ReconcileOutcome::Applied { .. }) = task.await.unwrap() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(payment::Entity::find().count(&*app.state.db).await.unwrap(), 1);
}

#[tokio::test]
async fn late_pending_does_not_regress_paid_order() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "late").await;

    deliver(&app, json!({"id": "P1", "external_reference": order.order_number, "status": "approved"})).await;
    let (_, body) = deliver(
        &app,
        json!({"id": "P1", "external_reference": order.order_number, "status": "pending"}),
    )
    .await;
    assert_eq!(body["data"]["outcome"], "ignored");

    let current = app.order(order.id).await;
    assert_eq!(current.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(current.status, OrderStatus::Processing);
}

// ==================== State Changes ====================

#[tokio::test]
async fn rejected_payment_cancels_and_releases_stock() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "rej").await;
    assert_eq!(app.stock_of(7).await, 3);

    let (_, body) = deliver(
        &app,
        json!({"id": "P-REJ", "external_reference": order.order_number, "status": "rejected"}),
    )
    .await;
    assert_eq!(body["data"]["outcome"], "applied");

    let current = app.order(order.id).await;
    assert_eq!(current.status, OrderStatus::Cancelled);
    assert_eq!(current.payment_status, OrderPaymentStatus::Failed);
    assert_eq!(app.stock_of(7).await, 5);

    // A second attempt succeeds after the order was already cancelled
    let (_, body) = deliver(
        &app,
        json!({"id": "P-OK", "external_reference": order.order_number, "status": "approved"}),
    )
    .await;
    assert_eq!(body["data"]["outcome"], "applied");

    let current = app.order(order.id).await;
    assert_eq!(current.status, OrderStatus::Cancelled);
    assert_eq!(current.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(current.refund_status, Some(RefundStatus::Requested));
    assert_eq!(app.stock_of(7).await, 5);
}

#[tokio::test]
async fn chargeback_marks_refund_completed() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "cb").await;

    deliver(&app, json!({"id": "P-CB", "external_reference": order.order_number, "status": "approved"})).await;
    deliver(&app, json!({"id": "P-CB", "external_reference": order.order_number, "status": "charged_back"})).await;

    let current = app.order(order.id).await;
    assert_eq!(current.status, OrderStatus::Processing);
    assert_eq!(current.payment_status, OrderPaymentStatus::Refunded);
    assert_eq!(current.refund_status, Some(RefundStatus::Completed));
}

#[tokio::test]
async fn unknown_vendor_status_is_recorded_but_ignored() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "unk").await;

    let (status, body) = deliver(
        &app,
        json!({"id": "P-UNK", "external_reference": order.order_number, "status": "weird_state"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "ignored");

    let record = payment::Entity::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Unknown);
    assert_eq!(record.vendor_status.as_deref(), Some("weird_state"));
    assert_eq!(app.order(order.id).await.status, OrderStatus::Pending);
}

// ==================== Unmatched Deliveries ====================

#[tokio::test]
async fn unknown_order_is_acknowledged_as_not_found() {
    let app = TestApp::new().await;
    let (status, body) = deliver(
        &app,
        json!({"id": "P-X", "external_reference": "ORD-DOESNOTEXIST", "status": "approved"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "not_found");
    assert_eq!(payment::Entity::find().count(&*app.state.db).await.unwrap(), 0);
}

#[tokio::test]
async fn unrecognized_payload_is_acknowledged() {
    let app = TestApp::new().await;
    let (status, body) = deliver(&app, json!({"hello": "world"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "unrecognized");

    let (_, body) = deliver(&app, json!({"type": "merchant_order", "data": {"id": "1"}})).await;
    assert_eq!(body["data"]["outcome"], "unrecognized");
}

#[tokio::test]
async fn failed_vendor_lookup_asks_for_redelivery() {
    let app = TestApp::new().await;
    placed_order(&app, "lookup").await;

    let (status, _) = deliver(&app, json!({"type": "payment", "data": {"id": "never-registered"}})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ==================== Polling ====================

#[tokio::test]
async fn envelope_without_status_polls_the_vendor() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "poll").await;

    let order_number = order.order_number.clone();
    let total = order.total;
    let mut gateway = MockGateway::new();
    gateway.expect_name().return_const("mock");
    gateway
        .expect_fetch_status()
        .withf(|id| id == "991")
        .times(1)
        .returning(move |id| {
            Ok(PaymentStatusReport {
                external_payment_id: id.to_string(),
                order_reference: Some(order_number.clone()),
                status: PaymentStatus::Paid,
                vendor_status: "approved".to_string(),
                amount: Some(total),
                payment_method: Some("pix".to_string()),
                raw: json!({"id": 991, "status": "approved"}),
            })
        });

    let service = ReconciliationService::new(
        app.state.db.clone(),
        Arc::new(gateway),
        app.state.event_sender.clone(),
    );
    let outcome = service
        .handle_notification(&json!({"type": "payment", "action": "payment.updated", "data": {"id": 991}}))
        .await
        .unwrap();

    assert_matches!(
        outcome,
        ReconcileOutcome::Applied { order_id, status: OrderStatus::Processing, payment_status: OrderPaymentStatus::Paid }
            if order_id == order.id
    );

    let record = payment::Entity::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(record.payment_id, "991");
    assert_eq!(record.gateway, "mock");
    assert_eq!(record.amount, total);
}

#[tokio::test]
async fn vendor_outage_surfaces_as_external_error() {
    let app = TestApp::new().await;
    placed_order(&app, "outage").await;

    let mut gateway = MockGateway::new();
    gateway.expect_name().return_const("mock");
    gateway
        .expect_fetch_status()
        .returning(|_| Err(GatewayError::Transport("connection refused".to_string())));

    let service = ReconciliationService::new(
        app.state.db.clone(),
        Arc::new(gateway),
        app.state.event_sender.clone(),
    );
    let err = service.reconcile_payment("123").await.unwrap_err();
    assert_matches!(err, storefront_api::errors::ServiceError::ExternalServiceError(_));
}

#[tokio::test]
async fn refresh_endpoint_polls_stored_transaction() {
    let app = TestApp::with_gateway(
        InitiateScript::Charge {
            status: PaymentStatus::Pending,
            vendor_status: "pending",
        },
        |_| {},
    )
    .await;
    let order = placed_order(&app, "refresh").await;
    let transaction_id = order.payment_transaction_id.clone().expect("charge id stored");
    assert_eq!(order.status, OrderStatus::Pending);

    app.gateway
        .report(&transaction_id, Some(&order.order_number), "approved", Some(order.total));

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/payment/refresh", order.id),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["outcome"], "applied");
    assert_eq!(body["data"]["status"], "processing");

    let record = payment::Entity::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(record.payment_id, transaction_id);
    assert_eq!(record.status, PaymentStatus::Paid);
}

#[tokio::test]
async fn flat_notification_without_payment_id_is_not_polled_later() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "flat").await;
    assert_eq!(order.payment_transaction_id, None);

    let (status, body) = deliver(
        &app,
        json!({"external_reference": order.order_number, "status": "approved"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "applied");

    let paid = app.order(order.id).await;
    assert_eq!(paid.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(paid.payment_transaction_id, None);

    let record = payment::Entity::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(record.payment_id, format!("{}:approved", order.order_number));

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/payment/refresh", order.id),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["outcome"], "ignored");
    assert_eq!(app.order(order.id).await.version, paid.version);
}

#[tokio::test]
async fn payment_return_reconciles_and_redirects() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "return").await;
    app.gateway
        .report("777", Some(&order.order_number), "approved", Some(order.total));

    let response = app
        .request(
            Method::GET,
            "/api/v1/payment/return?outcome=success&payment_id=777",
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert!(body["redirect_url"]
        .as_str()
        .unwrap()
        .ends_with(&format!("/payment-success/{}", order.id)));

    let response = app
        .request(
            Method::GET,
            "/api/v1/payment/return?outcome=failure&external_reference=ORD-UNKNOWN",
            None,
            &[],
        )
        .await;
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert!(body["redirect_url"].as_str().unwrap().ends_with("/payment-error"));
}

// ==================== Signed Deliveries ====================

#[tokio::test]
async fn signed_webhooks_are_verified() {
    let app = TestApp::with_gateway(InitiateScript::Redirect, |cfg| {
        cfg.payment.webhook_secret = Some("whsec_test".to_string());
    })
    .await;
    let order = placed_order(&app, "signed").await;
    let body = serde_json::to_vec(&json!({
        "id": "P-SIG",
        "external_reference": order.order_number,
        "status": "approved"
    }))
    .unwrap();

    let response = app.post_raw("/api/v1/orders/payment-webhook", &body, &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.order(order.id).await.status, OrderStatus::Pending);

    let ts = Utc::now().timestamp().to_string();
    let signature = sign("whsec_test", &ts, &body);
    let response = app
        .post_raw(
            "/api/v1/orders/payment-webhook",
            &body,
            &[("x-timestamp", &ts), ("x-signature", &signature)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.order(order.id).await.status, OrderStatus::Processing);
}

#[tokio::test]
async fn callback_route_accepts_query_string_notifications() {
    let app = TestApp::new().await;
    let order = placed_order(&app, "query").await;
    app.gateway
        .report("5150", Some(&order.order_number), "approved", None);

    let response = app
        .post_raw("/api/v1/orders/payment-callback?topic=payment&id=5150", b"", &[])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.order(order.id).await.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(
        order::Entity::find_by_id(order.id)
            .one(&*app.state.db)
            .await
            .unwrap()
            .unwrap()
            .payment_transaction_id
            .as_deref(),
        Some("5150")
    );
}
