use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::inventory_ledger::{InventoryLedger, Movement};
use super::order_status::{self, find_order, lock_order, Actor, OrderStateMachine};
use super::order_totals::{FeeScheduleRepository, LineAmount, OrderTotals, OrderTotalsCalculator};
use crate::config::SettlementConfig;
use crate::db::DbPool;
use crate::entities::delivery_address::Entity as DeliveryAddressEntity;
use crate::entities::order::{self, OrderStatus, PaymentMethod, PaymentStatus};
use crate::entities::order_item::{self, Entity as OrderItemEntity, ItemStatus};
use crate::entities::order_status_history;
use crate::entities::product::Entity as ProductEntity;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics::{CHECKOUT_FAILURES, ORDERS_CREATED};

const ORDER_ID_ATTEMPTS: usize = 10;

fn validate_quantity(quantity: &Decimal) -> Result<(), ValidationError> {
    if *quantity <= Decimal::ZERO || quantity.scale() > 2 {
        return Err(ValidationError::new(
            "quantity must be positive with at most two decimals",
        ));
    }
    Ok(())
}

fn validate_discount(discount: &Decimal) -> Result<(), ValidationError> {
    if *discount < Decimal::ZERO {
        return Err(ValidationError::new("discount cannot be negative"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub product_id: Uuid,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub delivery_address_id: Uuid,
    pub payment_method: PaymentMethod,
    #[validate(length(min = 1, message = "An order needs at least one item"))]
    pub items: Vec<OrderLineRequest>,
    #[serde(default)]
    #[validate(custom = "validate_discount")]
    pub discount: Decimal,
    #[validate(length(max = 500, message = "Notes must be at most 500 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpdateItemQuantityRequest {
    #[validate(custom = "validate_quantity")]
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub ordered_quantity: Decimal,
    pub available: bool,
    pub current_price: Option<Decimal>,
}

/// Turns a checkout into an order and owns every later line-item edit.
#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DbPool>,
    settlement: Arc<SettlementConfig>,
    ledger: InventoryLedger,
    state_machine: OrderStateMachine,
    event_sender: Option<Arc<EventSender>>,
}

impl CheckoutService {
    pub fn new(
        db_pool: Arc<DbPool>,
        settlement: Arc<SettlementConfig>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let ledger = InventoryLedger::new();
        Self {
            db_pool,
            settlement,
            ledger,
            state_machine: OrderStateMachine::new(ledger),
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    /// Places an order. Stock for every line is reserved in the same
    /// transaction that inserts the order; one short line aborts all of it.
    #[instrument(skip(self, request), fields(user_id = %user_id, lines = request.items.len()))]
    pub async fn place_order(
        &self,
        user_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        match self.place_order_inner(user_id, request).await {
            Ok(placed) => {
                ORDERS_CREATED.inc();
                self.emit(Event::OrderCreated {
                    order_id: placed.order.id.clone(),
                    total_amount: placed.order.total_amount,
                })
                .await;
                for item in &placed.items {
                    self.emit(Event::InventoryReserved {
                        product_id: item.product_id,
                        quantity: item.quantity,
                    })
                    .await;
                }
                Ok(placed)
            }
            Err(e) => {
                CHECKOUT_FAILURES.with_label_values(&[e.error_code()]).inc();
                warn!(error = %e, "Checkout rejected");
                Err(e)
            }
        }
    }

    async fn place_order_inner(
        &self,
        user_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        request.validate()?;
        for line in &request.items {
            validate_quantity(&line.quantity).map_err(|_| {
                ServiceError::ValidationError(format!(
                    "Quantity for product {} must be positive with at most two decimals",
                    line.product_id
                ))
            })?;
        }

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start checkout transaction");
            ServiceError::DatabaseError(e)
        })?;

        let address = DeliveryAddressEntity::find_by_id(request.delivery_address_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Delivery address {} not found",
                    request.delivery_address_id
                ))
            })?;
        if address.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "Delivery address belongs to another user".to_string(),
            ));
        }

        let merged = merge_lines(&request.items);
        let mut snapshots = Vec::with_capacity(merged.len());
        for line in &merged {
            let product = self
                .ledger
                .reserve(&txn, line.product_id, line.quantity)
                .await?;
            if !product.is_published {
                return Err(ServiceError::ValidationError(format!(
                    "{} is not available for sale",
                    product.title
                )));
            }
            snapshots.push((product, line.quantity));
        }

        let schedule = FeeScheduleRepository::load_snapshot(&txn, &self.settlement).await?;
        let lines: Vec<LineAmount> = snapshots
            .iter()
            .map(|(product, quantity)| LineAmount::new(*quantity, product.price_per_unit))
            .collect();
        let totals = OrderTotalsCalculator::new(schedule).calculate(
            &lines,
            request.payment_method,
            request.discount,
        )?;

        let order_id = generate_order_id(&txn, &self.settlement.order_id_prefix).await?;
        let (status, title, message) = if request.payment_method.is_cod() {
            (
                OrderStatus::Confirmed,
                "Order Placed",
                "Your order has been placed successfully",
            )
        } else {
            let (title, message) = order_status::describe(OrderStatus::Pending);
            (OrderStatus::Pending, title, message)
        };

        let order = order::ActiveModel {
            id: Set(order_id.clone()),
            uuid: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            delivery_address_id: Set(address.id),
            status: Set(status),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(request.payment_method),
            subtotal: Set(totals.subtotal),
            shipping_charges: Set(totals.shipping),
            discount_amount: Set(totals.discount),
            tax_amount: Set(totals.tax),
            platform_fee: Set(totals.platform_fee),
            gateway_fee: Set(totals.gateway_fee),
            total_amount: Set(totals.total),
            gateway_order_id: Set(None),
            gateway_payment_id: Set(None),
            gateway_signature: Set(None),
            carrier_order_id: Set(None),
            carrier_shipment_id: Set(None),
            awb_code: Set(None),
            courier_id: Set(None),
            courier_name: Set(None),
            carrier_status: Set(None),
            notes: Set(request.notes.clone()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(order_id = %order_id, error = %e, "Failed to insert order");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(snapshots.len());
        for (product, quantity) in snapshots {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id.clone()),
                product_id: Set(product.id),
                seller_id: Set(product.seller_id),
                product_name: Set(product.title.clone()),
                unit: Set(product.unit.clone()),
                quantity: Set(quantity),
                unit_price: Set(product.price_per_unit),
                total_price: Set(order_item::line_total(quantity, product.price_per_unit)),
                item_status: Set(ItemStatus::Confirmed),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        order_status::append_history(
            &txn,
            &order_id,
            status,
            title,
            message.to_string(),
            Actor::customer(user_id),
        )
        .await?;

        txn.commit().await.map_err(|e| {
            error!(order_id = %order_id, error = %e, "Failed to commit checkout");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_id = %order.id,
            total = %order.total_amount,
            method = %order.payment_method,
            "Order placed"
        );
        Ok(PlacedOrder { order, items })
    }

    /// Changes one line's quantity through a single ledger movement and
    /// recomputes the order totals.
    #[instrument(skip(self, request))]
    pub async fn update_item_quantity(
        &self,
        order_id: &str,
        item_id: Uuid,
        request: UpdateItemQuantityRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        request.validate()?;
        let txn = self.db_pool.begin().await?;

        let order = lock_order(&txn, order_id).await?;
        ensure_editable(&order)?;
        let item = find_active_item(&txn, order_id, item_id).await?;

        let old_quantity = item.quantity;
        let movement = self
            .ledger
            .adjust(&txn, item.product_id, old_quantity, request.quantity)
            .await?;
        if movement == Movement::Unchanged {
            let items = active_items(&txn, order_id).await?;
            txn.commit().await?;
            return Ok(PlacedOrder { order, items });
        }

        let product_id = item.product_id;
        let product_name = item.product_name.clone();
        let mut active: order_item::ActiveModel = item.clone().into();
        active.quantity = Set(request.quantity);
        active.total_price = Set(order_item::line_total(request.quantity, item.unit_price));
        active.update(&txn).await?;

        let placed = self.recompute_totals(&txn, order).await?;
        self.state_machine
            .record(
                &txn,
                &placed.order,
                "Order Updated",
                format!(
                    "Quantity of {} changed from {} to {}",
                    product_name, old_quantity, request.quantity
                ),
                Actor::customer(placed.order.user_id),
            )
            .await?;
        txn.commit().await?;

        info!(%order_id, %item_id, ?movement, "Order item quantity updated");
        match movement {
            Movement::Reserved(quantity) => {
                self.emit(Event::InventoryReserved {
                    product_id,
                    quantity,
                })
                .await
            }
            Movement::Released(quantity) => {
                self.emit(Event::InventoryReleased {
                    product_id,
                    quantity,
                })
                .await
            }
            Movement::Unchanged => {}
        }
        Ok(placed)
    }

    /// Removes a line and returns its stock. The last line cannot be removed;
    /// cancel the order instead.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        order_id: &str,
        item_id: Uuid,
    ) -> Result<PlacedOrder, ServiceError> {
        let txn = self.db_pool.begin().await?;

        let order = lock_order(&txn, order_id).await?;
        ensure_editable(&order)?;
        let item = find_active_item(&txn, order_id, item_id).await?;

        let remaining = active_items(&txn, order_id).await?;
        if remaining.len() <= 1 {
            return Err(ServiceError::ValidationError(
                "Cannot remove the last item of an order; cancel the order instead".to_string(),
            ));
        }

        let product_id = item.product_id;
        let quantity = item.quantity;
        let product_name = item.product_name.clone();
        self.ledger.release(&txn, product_id, quantity).await?;
        item.delete(&txn).await?;

        let placed = self.recompute_totals(&txn, order).await?;
        self.state_machine
            .record(
                &txn,
                &placed.order,
                "Order Updated",
                format!("{} removed from the order", product_name),
                Actor::customer(placed.order.user_id),
            )
            .await?;
        txn.commit().await?;

        info!(%order_id, %item_id, "Order item removed");
        self.emit(Event::InventoryReleased {
            product_id,
            quantity,
        })
        .await;
        Ok(placed)
    }

    async fn recompute_totals(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
    ) -> Result<PlacedOrder, ServiceError> {
        let items = active_items(txn, &order.id).await?;
        let lines: Vec<LineAmount> = items
            .iter()
            .map(|item| LineAmount::new(item.quantity, item.unit_price))
            .collect();
        let schedule = FeeScheduleRepository::load_snapshot(txn, &self.settlement).await?;
        let totals: OrderTotals = OrderTotalsCalculator::new(schedule).calculate(
            &lines,
            order.payment_method,
            order.discount_amount.min(
                lines.iter().map(LineAmount::total).sum::<Decimal>(),
            ),
        )?;

        let mut active: order::ActiveModel = order.into();
        active.subtotal = Set(totals.subtotal);
        active.shipping_charges = Set(totals.shipping);
        active.discount_amount = Set(totals.discount);
        active.tax_amount = Set(totals.tax);
        active.platform_fee = Set(totals.platform_fee);
        active.gateway_fee = Set(totals.gateway_fee);
        active.total_amount = Set(totals.total);
        let order = active.update(txn).await?;

        Ok(PlacedOrder { order, items })
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: &str) -> Result<order::Model, ServiceError> {
        find_order(&*self.db_pool, order_id).await
    }

    pub async fn list_items(&self, order_id: &str) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn status_history(
        &self,
        order_id: &str,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        OrderStateMachine::history(&*self.db_pool, order_id).await
    }

    /// For delivered or cancelled orders, whether each line can be bought
    /// again at today's catalog price.
    #[instrument(skip(self))]
    pub async fn reorder_availability(
        &self,
        order_id: &str,
    ) -> Result<Vec<ReorderLine>, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        if !order.can_be_reordered() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} cannot be reordered while {}",
                order.id, order.status
            )));
        }

        let items = self.list_items(order_id).await?;
        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let product = ProductEntity::find_by_id(item.product_id).one(db).await?;
            let (available, current_price) = match product {
                Some(p) => (
                    p.is_published && p.quantity_available >= item.quantity,
                    Some(p.price_per_unit),
                ),
                None => (false, None),
            };
            lines.push(ReorderLine {
                product_id: item.product_id,
                product_name: item.product_name,
                ordered_quantity: item.quantity,
                available,
                current_price,
            });
        }
        Ok(lines)
    }
}

/// Lines may only change before any money is committed: a captured payment
/// or an open gateway order pins `total_amount`.
fn ensure_editable(order: &order::Model) -> Result<(), ServiceError> {
    if !matches!(order.status, OrderStatus::Pending | OrderStatus::Confirmed) {
        return Err(ServiceError::ValidationError(format!(
            "Items can only be changed while the order is pending or confirmed (order is {})",
            order.status
        )));
    }
    if order.payment_status != PaymentStatus::Pending || order.gateway_order_id.is_some() {
        return Err(ServiceError::ValidationError(format!(
            "Items of order {} cannot be changed once payment has started",
            order.id
        )));
    }
    Ok(())
}

/// Folds repeated product lines together and orders them by product id so
/// concurrent checkouts always lock product rows in the same sequence.
fn merge_lines(items: &[OrderLineRequest]) -> Vec<OrderLineRequest> {
    let mut merged: BTreeMap<Uuid, Decimal> = BTreeMap::new();
    for line in items {
        *merged.entry(line.product_id).or_insert(Decimal::ZERO) += line.quantity;
    }
    merged
        .into_iter()
        .map(|(product_id, quantity)| OrderLineRequest {
            product_id,
            quantity,
        })
        .collect()
}

async fn find_active_item(
    txn: &DatabaseTransaction,
    order_id: &str,
    item_id: Uuid,
) -> Result<order_item::Model, ServiceError> {
    OrderItemEntity::find_by_id(item_id)
        .filter(order_item::Column::OrderId.eq(order_id))
        .filter(order_item::Column::ItemStatus.ne(ItemStatus::Cancelled))
        .one(txn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Item {} not found on order {}", item_id, order_id))
        })
}

async fn active_items(
    txn: &DatabaseTransaction,
    order_id: &str,
) -> Result<Vec<order_item::Model>, ServiceError> {
    Ok(OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .filter(order_item::Column::ItemStatus.ne(ItemStatus::Cancelled))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(txn)
        .await?)
}

/// `prefix` followed by six random digits, checked against existing orders.
pub async fn generate_order_id(
    txn: &DatabaseTransaction,
    prefix: &str,
) -> Result<String, ServiceError> {
    for _ in 0..ORDER_ID_ATTEMPTS {
        let candidate = {
            let mut rng = rand::thread_rng();
            format!("{}{:06}", prefix, rng.gen_range(0..1_000_000u32))
        };
        let taken = order::Entity::find_by_id(candidate.clone())
            .one(txn)
            .await?
            .is_some();
        if !taken {
            return Ok(candidate);
        }
    }
    error!(prefix, "Exhausted order id attempts");
    Err(ServiceError::InternalError(
        "Could not allocate a unique order id".to_string(),
    ))
}
