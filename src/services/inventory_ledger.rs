//! Inventory ledger
//!
//! Moves a product's `quantity_available` under an exclusive row lock. Every
//! method takes a `DatabaseTransaction` so the lock and the write belong to the
//! caller's unit of work: an `InsufficientStock` error aborts everything the
//! caller did before it.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;

/// Direction of a single ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    Reserved(Decimal),
    Released(Decimal),
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryLedger;

impl InventoryLedger {
    pub fn new() -> Self {
        Self
    }

    async fn lock_product(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(|e| {
                error!(%product_id, error = %e, "Failed to lock product row");
                ServiceError::DatabaseError(e)
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    fn ensure_positive(quantity: Decimal) -> Result<(), ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Quantity must be greater than zero, got {}",
                quantity
            )));
        }
        Ok(())
    }

    fn shortage(product: &product::Model, quantity: Decimal) -> ServiceError {
        warn!(
            product_id = %product.id,
            available = %product.quantity_available,
            requested = %quantity,
            "Insufficient stock"
        );
        ServiceError::InsufficientStock(format!(
            "Only {} {} of {} available, requested {}",
            product.quantity_available, product.unit, product.title, quantity
        ))
    }

    async fn reload(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Decrements available stock by `quantity`. The decrement is a single
    /// `UPDATE .. WHERE quantity_available >= quantity`, so stock never goes
    /// negative even where row locks are not honoured.
    #[instrument(skip(self, txn))]
    pub async fn reserve(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<product::Model, ServiceError> {
        Self::ensure_positive(quantity)?;
        let product = self.lock_product(txn, product_id).await?;
        if product.quantity_available < quantity {
            return Err(Self::shortage(&product, quantity));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::QuantityAvailable,
                Expr::col(product::Column::QuantityAvailable).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::QuantityAvailable.gte(quantity))
            .exec(txn)
            .await
            .map_err(|e| {
                error!(%product_id, error = %e, "Failed to reserve stock");
                ServiceError::DatabaseError(e)
            })?;
        let updated = self.reload(txn, product_id).await?;
        if result.rows_affected != 1 {
            return Err(Self::shortage(&updated, quantity));
        }

        debug!(%product_id, %quantity, remaining = %updated.quantity_available, "Stock reserved");
        Ok(updated)
    }

    /// Returns `quantity` to available stock.
    #[instrument(skip(self, txn))]
    pub async fn release(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<product::Model, ServiceError> {
        Self::ensure_positive(quantity)?;
        self.lock_product(txn, product_id).await?;

        ProductEntity::update_many()
            .col_expr(
                product::Column::QuantityAvailable,
                Expr::col(product::Column::QuantityAvailable).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(txn)
            .await?;
        let updated = self.reload(txn, product_id).await?;

        debug!(%product_id, %quantity, restored = %updated.quantity_available, "Stock released");
        Ok(updated)
    }

    /// Moves stock for a line whose quantity changes from `old_quantity` to
    /// `new_quantity`: one `reserve` of the increase or one `release` of the
    /// decrease.
    pub async fn adjust(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
        old_quantity: Decimal,
        new_quantity: Decimal,
    ) -> Result<Movement, ServiceError> {
        let delta = new_quantity - old_quantity;
        if delta > Decimal::ZERO {
            self.reserve(txn, product_id, delta).await?;
            Ok(Movement::Reserved(delta))
        } else if delta < Decimal::ZERO {
            self.release(txn, product_id, -delta).await?;
            Ok(Movement::Released(-delta))
        } else {
            Ok(Movement::Unchanged)
        }
    }
}
