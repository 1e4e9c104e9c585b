use crate::{
    entities::{cart_item, product},
    errors::ServiceError,
    services::commerce::pricing::{line_total, round_money},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Largest quantity accepted for a single cart line.
pub const MAX_LINE_QUANTITY: i32 = 99;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CartLine {
    pub item_id: Uuid,
    pub product_id: i32,
    pub product_name: String,
    pub product_sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    /// Stock at read time; zero for products no longer sold
    pub available_stock: i32,
}

/// Read-only view of a session's cart.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CartSnapshot {
    pub session_id: String,
    pub lines: Vec<CartLine>,
    pub subtotal: Decimal,
}

impl CartSnapshot {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn item_count(&self) -> i32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

/// Session-keyed cart. Carts are anonymous; the session id is the only key.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Current cart contents, possibly empty.
    #[instrument(skip(self))]
    pub async fn view(&self, session_id: &str) -> Result<CartSnapshot, ServiceError> {
        Self::load(&*self.db, session_id).await
    }

    /// Snapshot for checkout; an empty cart is an error.
    #[instrument(skip(self))]
    pub async fn snapshot(&self, session_id: &str) -> Result<CartSnapshot, ServiceError> {
        let snapshot = Self::load(&*self.db, session_id).await?;
        if snapshot.is_empty() {
            return Err(ServiceError::EmptyCart);
        }
        Ok(snapshot)
    }

    async fn load<C: ConnectionTrait>(
        conn: &C,
        session_id: &str,
    ) -> Result<CartSnapshot, ServiceError> {
        let rows = cart_item::Entity::find()
            .filter(cart_item::Column::SessionId.eq(session_id))
            .find_also_related(product::Entity)
            .order_by_asc(cart_item::Column::CreatedAt)
            .order_by_asc(cart_item::Column::Id)
            .all(conn)
            .await?;

        let lines: Vec<CartLine> = rows
            .into_iter()
            .map(|(item, product)| {
                let (product_name, product_sku, available_stock) = match product {
                    Some(p) if p.is_active => (p.name, p.sku, p.stock),
                    Some(p) => (p.name, p.sku, 0),
                    None => (format!("Product {}", item.product_id), String::new(), 0),
                };
                CartLine {
                    item_id: item.id,
                    product_id: item.product_id,
                    product_name,
                    product_sku,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    line_total: line_total(item.quantity, item.unit_price),
                    available_stock,
                }
            })
            .collect();

        let subtotal = round_money(lines.iter().map(|l| l.line_total).sum());
        Ok(CartSnapshot {
            session_id: session_id.to_string(),
            lines,
            subtotal,
        })
    }

    /// Adds a product, merging into an existing line for the same product.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        session_id: &str,
        product_id: i32,
        quantity: i32,
    ) -> Result<CartSnapshot, ServiceError> {
        validate_quantity(quantity)?;

        let product = product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::SessionId.eq(session_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await?;

        let new_quantity = existing.as_ref().map_or(0, |i| i.quantity) + quantity;
        validate_quantity(new_quantity)?;
        ensure_stock(&product, new_quantity)?;

        let now = Utc::now();
        match existing {
            Some(item) => {
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(new_quantity);
                active.unit_price = Set(product.effective_price());
                active.updated_at = Set(now);
                active.update(&*self.db).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    session_id: Set(session_id.to_string()),
                    product_id: Set(product_id),
                    quantity: Set(new_quantity),
                    unit_price: Set(product.effective_price()),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?;
            }
        }

        info!(session_id, product_id, quantity = new_quantity, "cart line saved");
        self.view(session_id).await
    }

    #[instrument(skip(self))]
    pub async fn update_quantity(
        &self,
        session_id: &str,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartSnapshot, ServiceError> {
        validate_quantity(quantity)?;
        let item = self.find_line(session_id, item_id).await?;

        let product = product::Entity::find_by_id(item.product_id)
            .one(&*self.db)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", item.product_id))
            })?;
        ensure_stock(&product, quantity)?;

        let mut active: cart_item::ActiveModel = item.into();
        active.quantity = Set(quantity);
        active.unit_price = Set(product.effective_price());
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;

        info!(session_id, %item_id, quantity, "cart line updated");
        self.view(session_id).await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        session_id: &str,
        item_id: Uuid,
    ) -> Result<CartSnapshot, ServiceError> {
        let item = self.find_line(session_id, item_id).await?;
        cart_item::Entity::delete_by_id(item.id)
            .exec(&*self.db)
            .await?;
        self.view(session_id).await
    }

    /// Empties the cart on the given connection so checkout can clear it
    /// inside its own transaction.
    pub async fn clear<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: &str,
    ) -> Result<u64, ServiceError> {
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::SessionId.eq(session_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn find_line(
        &self,
        session_id: &str,
        item_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        cart_item::Entity::find_by_id(item_id)
            .filter(cart_item::Column::SessionId.eq(session_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))
    }
}

fn validate_quantity(quantity: i32) -> Result<(), ServiceError> {
    if !(1..=MAX_LINE_QUANTITY).contains(&quantity) {
        return Err(ServiceError::ValidationError(format!(
            "Quantity must be between 1 and {}",
            MAX_LINE_QUANTITY
        )));
    }
    Ok(())
}

fn ensure_stock(product: &product::Model, quantity: i32) -> Result<(), ServiceError> {
    if product.stock < quantity {
        return Err(ServiceError::InsufficientStock(format!(
            "{} (requested {}, available {})",
            product.name, quantity, product.stock
        )));
    }
    Ok(())
}
