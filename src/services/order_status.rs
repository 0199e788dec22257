//! Order state machine
//!
//! The only code path that changes `orders.status`. A transition either
//! applies completely (status, item mirroring, stock release on cancel and
//! exactly one history entry) or returns `InvalidTransition` without touching
//! anything.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use tracing::{info, instrument};
use uuid::Uuid;

use super::inventory_ledger::InventoryLedger;
use crate::entities::order::{self, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItemEntity, ItemStatus};
use crate::entities::order_status_history::{
    self, ChangeSource, Entity as OrderStatusHistoryEntity,
};
use crate::errors::ServiceError;

/// Who is asking for a change, recorded on the history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub source: ChangeSource,
    pub user_id: Option<Uuid>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            source: ChangeSource::System,
            user_id: None,
        }
    }

    pub fn webhook() -> Self {
        Self {
            source: ChangeSource::Webhook,
            user_id: None,
        }
    }

    pub fn admin() -> Self {
        Self {
            source: ChangeSource::Admin,
            user_id: None,
        }
    }

    pub fn customer(user_id: Uuid) -> Self {
        Self {
            source: ChangeSource::Customer,
            user_id: Some(user_id),
        }
    }

    pub fn seller(user_id: Uuid) -> Self {
        Self {
            source: ChangeSource::Seller,
            user_id: Some(user_id),
        }
    }
}

/// Allowed targets for each status.
pub fn allowed_targets(from: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match from {
        Pending => &[Confirmed, Cancelled, Failed],
        Confirmed => &[Processing, Cancelled],
        Processing => &[Packed, Cancelled],
        Packed => &[Shipped, Cancelled],
        Shipped => &[InTransit],
        InTransit => &[Delivered, Cancelled],
        Failed => &[Pending, Cancelled],
        Delivered | Cancelled | Refunded => &[],
    }
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Title and message recorded when an order enters `status`.
pub fn describe(status: OrderStatus) -> (&'static str, &'static str) {
    match status {
        OrderStatus::Pending => ("Payment Pending", "Order created, awaiting payment"),
        OrderStatus::Confirmed => ("Order Confirmed", "Your order has been confirmed"),
        OrderStatus::Processing => ("Order Processing", "The seller is preparing your order"),
        OrderStatus::Packed => ("Order Packed", "Your order has been packed and is ready for pickup"),
        OrderStatus::Shipped => ("Order Shipped", "Your order has been handed to the courier"),
        OrderStatus::InTransit => ("In Transit", "Your order is on its way"),
        OrderStatus::Delivered => ("Order Delivered", "Your order has been delivered"),
        OrderStatus::Cancelled => ("Order Cancelled", "Your order has been cancelled"),
        OrderStatus::Refunded => ("Order Refunded", "Your payment has been refunded"),
        OrderStatus::Failed => ("Payment Failed", "Payment for this order could not be completed"),
    }
}

fn mirrored_item_status(status: OrderStatus) -> Option<ItemStatus> {
    match status {
        OrderStatus::Processing => Some(ItemStatus::Processing),
        OrderStatus::Packed => Some(ItemStatus::Packed),
        OrderStatus::Shipped | OrderStatus::InTransit => Some(ItemStatus::Shipped),
        OrderStatus::Delivered => Some(ItemStatus::Delivered),
        _ => None,
    }
}

/// Appends one audit entry. History rows are never updated.
pub async fn append_history<C: ConnectionTrait>(
    db: &C,
    order_id: &str,
    status: OrderStatus,
    title: &str,
    message: String,
    actor: Actor,
) -> Result<order_status_history::Model, ServiceError> {
    let entry = order_status_history::ActiveModel {
        order_id: Set(order_id.to_string()),
        status: Set(status),
        title: Set(title.to_string()),
        message: Set(message),
        change_source: Set(actor.source),
        changed_by: Set(actor.user_id),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    Ok(entry.insert(db).await?)
}

/// Loads an order with an exclusive row lock held until `txn` ends.
pub async fn lock_order(
    txn: &DatabaseTransaction,
    order_id: &str,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id.to_string())
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub async fn find_order<C: ConnectionTrait>(
    db: &C,
    order_id: &str,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrderStateMachine {
    ledger: InventoryLedger,
}

impl OrderStateMachine {
    pub fn new(ledger: InventoryLedger) -> Self {
        Self { ledger }
    }

    /// Moves `order` to `target` inside `txn`.
    ///
    /// Entering `cancelled` releases every line that is not already cancelled
    /// back to stock. `note` is appended to the standard message.
    #[instrument(skip(self, txn, order, note), fields(order_id = %order.id, from = %order.status, to = %target))]
    pub async fn transition(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        target: OrderStatus,
        actor: Actor,
        note: Option<&str>,
    ) -> Result<order::Model, ServiceError> {
        let from = order.status;
        if !can_transition(from, target) {
            return Err(ServiceError::InvalidTransition { from, to: target });
        }

        if target == OrderStatus::Cancelled {
            self.release_items(txn, &order.id).await?;
        } else if let Some(item_status) = mirrored_item_status(target) {
            OrderItemEntity::update_many()
                .set(order_item::ActiveModel {
                    item_status: Set(item_status),
                    updated_at: Set(Utc::now()),
                    ..Default::default()
                })
                .filter(order_item::Column::OrderId.eq(order.id.as_str()))
                .filter(order_item::Column::ItemStatus.ne(ItemStatus::Cancelled))
                .exec(txn)
                .await?;
        }

        let order_id = order.id.clone();
        let mut active: order::ActiveModel = order.into();
        active.status = Set(target);
        let updated = active.update(txn).await?;

        let (title, message) = describe(target);
        let message = match note {
            Some(note) if !note.trim().is_empty() => format!("{}. {}", message, note.trim()),
            _ => message.to_string(),
        };
        append_history(txn, &order_id, target, title, message, actor).await?;

        info!(%order_id, %from, to = %target, source = %actor.source, "Order status changed");
        Ok(updated)
    }

    /// Audit entry that does not change status.
    pub async fn record(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        title: &str,
        message: String,
        actor: Actor,
    ) -> Result<order_status_history::Model, ServiceError> {
        append_history(txn, &order.id, order.status, title, message, actor).await
    }

    async fn release_items(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<(), ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::ItemStatus.ne(ItemStatus::Cancelled))
            .all(txn)
            .await?;

        for item in items {
            self.ledger
                .release(txn, item.product_id, item.quantity)
                .await?;
            let mut active: order_item::ActiveModel = item.into();
            active.item_status = Set(ItemStatus::Cancelled);
            active.update(txn).await?;
        }
        Ok(())
    }

    pub async fn history<C: ConnectionTrait>(
        db: &C,
        order_id: &str,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        Ok(OrderStatusHistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::Id)
            .all(db)
            .await?)
    }
}
