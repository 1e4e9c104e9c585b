//! Inventory ledger
//!
//! Stock lives on `products.stock` and is only ever changed through a single
//! conditional `UPDATE`, so concurrent reservations cannot oversell. Every
//! operation takes the caller's connection so it joins the caller's
//! transaction.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect,
};
use tracing::{debug, instrument, warn};

use crate::entities::{order_item, product};
use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryLedger;

impl InventoryLedger {
    pub fn new() -> Self {
        Self
    }

    /// Decrements stock by `quantity` only if that much is available.
    #[instrument(skip(self, conn))]
    pub async fn reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: i32,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Reservation quantity must be positive, got {}",
                quantity
            )));
        }

        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            let current = product::Entity::find_by_id(product_id).one(conn).await?;
            counter!("storefront.inventory.reservation_rejected", 1);
            return Err(match current {
                Some(p) => {
                    warn!(product_id, requested = quantity, available = p.stock, "insufficient stock");
                    ServiceError::InsufficientStock(format!(
                        "{} (requested {}, available {})",
                        p.name, quantity, p.stock
                    ))
                }
                None => ServiceError::NotFound(format!("Product {} not found", product_id)),
            });
        }

        debug!(product_id, quantity, "stock reserved");
        Ok(())
    }

    /// Puts `quantity` back. Not capped: the ledger does not know the
    /// product's original stock. A product deleted since the order was
    /// placed is skipped.
    #[instrument(skip(self, conn))]
    pub async fn release<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: i32,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Ok(());
        }

        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(product_id, quantity, "product no longer exists, stock not released");
        } else {
            debug!(product_id, quantity, "stock released");
        }
        Ok(())
    }

    /// Returns every line of an order to stock.
    pub async fn release_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: uuid::Uuid,
    ) -> Result<u32, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await?;

        let mut released = 0;
        for item in &items {
            self.release(conn, item.product_id, item.quantity).await?;
            released += 1;
        }
        counter!("storefront.inventory.order_released", 1);
        Ok(released)
    }

    pub async fn available<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: i32,
    ) -> Result<Option<i32>, ServiceError> {
        let stock: Option<i32> = product::Entity::find_by_id(product_id)
            .select_only()
            .column(product::Column::Stock)
            .into_tuple()
            .one(conn)
            .await?;
        Ok(stock)
    }
}
