use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    entities::order::OrderStatus,
    errors::ServiceError,
    handlers::common::{PaginationParams, SessionId},
    services::commerce::CheckoutRequest,
    ApiResponse, AppState, PaginatedResponse,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CancelOrderRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

/// Place an order from the session cart
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CheckoutRequest,
    params(("x-session-id" = String, Header, description = "Cart session")),
    responses(
        (status = 201, description = "Order placed", body = crate::services::commerce::PlacedOrder),
        (status = 400, description = "Empty cart, insufficient stock or invalid request", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    session: SessionId,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let placed = state
        .services
        .checkout
        .place_order(session.as_str(), payload)
        .await?;

    let mut response = ApiResponse::success(placed);
    response.message = Some("Order placed".to_string());
    Ok((StatusCode::CREATED, Json(response)))
}

/// Get an order with its lines
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order found", body = crate::services::orders::OrderDetails),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// List the caller's orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(PaginationParams),
    responses(
        (status = 200, description = "Orders for the authenticated customer"),
        (status = 401, description = "Missing or invalid token", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let limit = params.limit();
    let (orders, total) = state
        .services
        .orders
        .list_for_customer(&user.email, params.page, limit)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items: orders,
        total,
        page: params.page,
        limit,
        total_pages: params.total_pages(total),
    })))
}

/// Cancel an order within the cancellation window
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled", body = crate::services::cancellation::CancellationReceipt),
        (status = 400, description = "Window expired or order no longer cancellable", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
    Json(payload): Json<CancelOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;

    let receipt = state
        .services
        .cancellation
        .cancel(id, &user.email, &payload.reason)
        .await
        .map_err(|e| match e {
            // Someone else's order is reported exactly like a missing one.
            ServiceError::Forbidden(_) => ServiceError::NotFound(format!("Order {} not found", id)),
            other => other,
        })?;

    let mut response = ApiResponse::success(receipt);
    response.message = Some(format!("Order {} has been cancelled", id));
    Ok(Json(response))
}

/// Advance fulfilment status (admin)
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated"),
        (status = 400, description = "Illegal transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    if !user.is_admin() {
        return Err(ServiceError::Forbidden(
            "Insufficient permissions to update order status".to_string(),
        ));
    }

    let order = state
        .services
        .orders
        .update_status(id, payload.status)
        .await?;
    info!(order_id = %id, status = %order.status, by = %user.user_id, "fulfilment status changed");
    Ok(Json(ApiResponse::success(order)))
}

/// Poll the payment vendor for the order's transaction and reconcile
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payment/refresh",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Reconciliation outcome", body = crate::services::reconciliation::ReconcileOutcome),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "orders"
)]
pub async fn refresh_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.services.reconciliation.refresh_order(id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}
