use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::ServiceError,
    handlers::common::SessionId,
    services::commerce::{cart_service::MAX_LINE_QUANTITY, CartSnapshot},
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddToCartRequest {
    #[validate(range(min = 1))]
    pub product_id: i32,
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateCartItemRequest {
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartView {
    #[serde(flatten)]
    pub cart: CartSnapshot,
    pub item_count: i32,
    pub max_line_quantity: i32,
}

impl From<CartSnapshot> for CartView {
    fn from(cart: CartSnapshot) -> Self {
        Self {
            item_count: cart.item_count(),
            cart,
            max_line_quantity: MAX_LINE_QUANTITY,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/cart",
    params(("x-session-id" = String, Header, description = "Cart session")),
    responses((status = 200, description = "Cart contents", body = CartView)),
    tag = "cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    session: SessionId,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.cart.view(session.as_str()).await?;
    Ok(Json(ApiResponse::success(CartView::from(cart))))
}

#[utoipa::path(
    post,
    path = "/api/v1/cart",
    params(("x-session-id" = String, Header, description = "Cart session")),
    request_body = AddToCartRequest,
    responses(
        (status = 201, description = "Line added or merged", body = CartView),
        (status = 400, description = "Invalid quantity or insufficient stock", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    tag = "cart"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    session: SessionId,
    Json(payload): Json<AddToCartRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;
    let cart = state
        .services
        .cart
        .add_item(session.as_str(), payload.product_id, payload.quantity)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CartView::from(cart))),
    ))
}

#[utoipa::path(
    put,
    path = "/api/v1/cart/{item_id}",
    params(
        ("item_id" = Uuid, Path, description = "Cart line id"),
        ("x-session-id" = String, Header, description = "Cart session")
    ),
    request_body = UpdateCartItemRequest,
    responses(
        (status = 200, description = "Quantity updated", body = CartView),
        (status = 404, description = "Line not in this cart", body = crate::errors::ErrorResponse)
    ),
    tag = "cart"
)]
pub async fn update_cart_item(
    State(state): State<AppState>,
    session: SessionId,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<UpdateCartItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;
    let cart = state
        .services
        .cart
        .update_quantity(session.as_str(), item_id, payload.quantity)
        .await?;
    Ok(Json(ApiResponse::success(CartView::from(cart))))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart/{item_id}",
    params(
        ("item_id" = Uuid, Path, description = "Cart line id"),
        ("x-session-id" = String, Header, description = "Cart session")
    ),
    responses((status = 200, description = "Line removed", body = CartView)),
    tag = "cart"
)]
pub async fn remove_cart_item(
    State(state): State<AppState>,
    session: SessionId,
    Path(item_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .cart
        .remove_item(session.as_str(), item_id)
        .await?;
    Ok(Json(ApiResponse::success(CartView::from(cart))))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart",
    params(("x-session-id" = String, Header, description = "Cart session")),
    responses((status = 204, description = "Cart cleared")),
    tag = "cart"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    session: SessionId,
) -> Result<impl IntoResponse, ServiceError> {
    state
        .services
        .cart
        .clear(&*state.db, session.as_str())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
