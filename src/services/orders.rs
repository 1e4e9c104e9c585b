use crate::{
    entities::{
        order::{self, OrderStatus},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::order_status::is_valid_transition,
};
use chrono::Utc;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// An order header together with its lines.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderDetails {
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub order: order::Model,
    #[schema(value_type = Vec<Object>)]
    pub items: Vec<order_item::Model>,
}

/// Writes `changes` to `current` only if nobody else updated the order
/// since it was read. The version is bumped as part of the same statement.
pub(crate) async fn update_order_versioned<C: ConnectionTrait>(
    conn: &C,
    current: &order::Model,
    mut changes: order::ActiveModel,
) -> Result<order::Model, ServiceError> {
    changes.version = Set(current.version + 1);
    changes.updated_at = Set(Utc::now());

    let result = order::Entity::update_many()
        .set(changes)
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Version.eq(current.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }

    order::Entity::find_by_id(current.id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", current.id)))
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        self.with_items(order).await
    }

    pub async fn with_items(&self, order: order::Model) -> Result<OrderDetails, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(OrderDetails { order, items })
    }

    pub async fn find_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?)
    }

    /// Orders placed with `email`, newest first. Returns the page and the
    /// total number of orders.
    #[instrument(skip(self))]
    pub async fn list_for_customer(
        &self,
        email: &str,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let paginator = order::Entity::find()
            .filter(order::Column::CustomerEmail.eq(email.trim().to_lowercase()))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, limit.clamp(1, 100));

        let total = paginator.num_items().await.map_err(|e| {
            error!("Failed to count orders: {}", e);
            ServiceError::DatabaseError(e)
        })?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((orders, total))
    }

    /// Fulfilment transitions (processing → shipped → delivered).
    /// Cancellation has its own flow because it releases stock.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        if new_status == OrderStatus::Cancelled {
            return Err(ServiceError::BadRequest(
                "Orders are cancelled through the cancel endpoint".to_string(),
            ));
        }

        let current = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !is_valid_transition(current.status, new_status) {
            return Err(ServiceError::InvalidTransition(format!(
                "Cannot move order from {} to {}",
                current.status, new_status
            )));
        }

        let updated = update_order_versioned(
            &*self.db,
            &current,
            order::ActiveModel {
                status: Set(new_status),
                ..Default::default()
            },
        )
        .await?;

        info!(%order_id, old_status = %current.status, %new_status, "order status updated");
        self.event_sender
            .emit(Event::OrderStatusChanged {
                order_id,
                old_status: current.status,
                new_status,
            })
            .await;

        Ok(updated)
    }
}
