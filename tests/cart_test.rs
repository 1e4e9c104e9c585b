//! Cart routes keyed by the `x-session-id` header.

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use common::{json_body, money, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    entities::{cart_item, product},
    errors::ServiceError,
};
use uuid::Uuid;

async fn put_on_sale(app: &TestApp, product_id: i32, sale_price: rust_decimal::Decimal) {
    let current = product::Entity::find_by_id(product_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    let mut active: product::ActiveModel = current.into();
    active.sale_price = Set(Some(sale_price));
    active.update(&*app.state.db).await.unwrap();
}

async fn only_line(app: &TestApp, session: &str) -> Uuid {
    let cart = app.state.services.cart.view(session).await.unwrap();
    assert_eq!(cart.lines.len(), 1);
    cart.lines[0].item_id
}

async fn cart_body(app: &TestApp, session: &str) -> Value {
    let response = app
        .request(Method::GET, "/api/v1/cart", None, &[("x-session-id", session)])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn add_then_view_cart() {
    let app = TestApp::new().await;
    app.seed_product(20, "Camiseta", dec!(59.90), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart",
            Some(json!({"product_id": 20, "quantity": 2})),
            &[("x-session-id", "c-add")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = cart_body(&app, "c-add").await;
    assert_eq!(body["data"]["item_count"], 2);
    assert_eq!(money(&body["data"]["subtotal"]), dec!(119.80));
    assert_eq!(body["data"]["lines"][0]["product_id"], 20);
}

#[tokio::test]
async fn quantity_update_picks_up_current_price() {
    let app = TestApp::new().await;
    app.seed_product(21, "Boné", dec!(50.00), 10).await;
    app.add_to_cart("c-price", 21, 1).await;
    let item_id = only_line(&app, "c-price").await;

    put_on_sale(&app, 21, dec!(40.00)).await;

    let snapshot = app
        .state
        .services
        .cart
        .update_quantity("c-price", item_id, 2)
        .await
        .unwrap();
    assert_eq!(snapshot.lines[0].unit_price, dec!(40.00));
    assert_eq!(snapshot.subtotal, dec!(80.00));

    put_on_sale(&app, 21, dec!(35.00)).await;
    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/{}", item_id),
            Some(json!({"quantity": 3})),
            &[("x-session-id", "c-price")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(money(&body["data"]["lines"][0]["unit_price"]), dec!(35.00));
    assert_eq!(money(&body["data"]["subtotal"]), dec!(105.00));

    let stored = cart_item::Entity::find_by_id(item_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.unit_price, dec!(35.00));
    assert_eq!(stored.quantity, 3);
}

#[tokio::test]
async fn quantity_beyond_stock_is_rejected() {
    let app = TestApp::new().await;
    app.seed_product(22, "Meia", dec!(12.00), 3).await;
    app.add_to_cart("c-stock", 22, 1).await;
    let item_id = only_line(&app, "c-stock").await;

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/{}", item_id),
            Some(json!({"quantity": 4})),
            &[("x-session-id", "c-stock")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_matches!(
        app.state.services.cart.update_quantity("c-stock", item_id, 4).await,
        Err(ServiceError::InsufficientStock(_))
    );
    let body = cart_body(&app, "c-stock").await;
    assert_eq!(body["data"]["lines"][0]["quantity"], 1);
}

#[tokio::test]
async fn lines_of_another_session_are_invisible() {
    let app = TestApp::new().await;
    app.seed_product(23, "Bolsa", dec!(99.00), 5).await;
    app.add_to_cart("c-owner", 23, 1).await;
    let item_id = only_line(&app, "c-owner").await;

    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/cart/{}", item_id),
            None,
            &[("x-session-id", "c-intruder")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/{}", item_id),
            Some(json!({"quantity": 2})),
            &[("x-session-id", "c-intruder")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = cart_body(&app, "c-owner").await;
    assert_eq!(body["data"]["lines"][0]["quantity"], 1);

    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/cart/{}", item_id),
            None,
            &[("x-session-id", "c-owner")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["lines"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn clearing_empties_only_this_cart() {
    let app = TestApp::new().await;
    app.seed_product(24, "Caneca", dec!(30.00), 10).await;
    app.seed_product(25, "Prato", dec!(45.00), 10).await;
    app.add_to_cart("c-clear", 24, 1).await;
    app.add_to_cart("c-clear", 25, 2).await;
    app.add_to_cart("c-keep", 24, 1).await;

    let response = app
        .request(Method::DELETE, "/api/v1/cart", None, &[("x-session-id", "c-clear")])
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let body = cart_body(&app, "c-clear").await;
    assert_eq!(body["data"]["lines"].as_array().map(Vec::len), Some(0));
    assert_eq!(body["data"]["item_count"], 0);

    let kept = cart_body(&app, "c-keep").await;
    assert_eq!(kept["data"]["item_count"], 1);
}

#[tokio::test]
async fn cart_routes_require_a_session() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v1/cart", None, &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
