use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::order_status::{find_order, lock_order, Actor, OrderStateMachine};
use crate::config::SettlementConfig;
use crate::db::DbPool;
use crate::entities::delivery_address::Entity as DeliveryAddressEntity;
use crate::entities::order::{self, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItemEntity, ItemStatus};
use crate::entities::product::Entity as ProductEntity;
use crate::errors::ServiceError;
use crate::integrations::shipping_carrier::{cheapest, fastest, recommend};
use crate::integrations::{
    CourierAssignment, CourierOption, ShipmentAddress, ShipmentItem, ShipmentRequest,
    ShippingCarrier, TrackingEvent,
};

const MIN_PARCEL_WEIGHT_KG: Decimal = dec!(0.5);
const FALLBACK_DELIVERY_DAYS: u32 = 5;

/// Where a quote or tracking status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Carrier,
    /// No carrier involvement, e.g. an order that was never shipped
    Local,
    /// Carrier unavailable; computed locally
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingQuote {
    pub source: DataSource,
    pub options: Vec<CourierOption>,
    pub cheapest: Option<CourierOption>,
    pub fastest: Option<CourierOption>,
    pub recommended: Option<CourierOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub order_id: String,
    pub source: DataSource,
    pub status: String,
    pub events: Vec<TrackingEvent>,
}

/// Carrier-facing operations that never block checkout or cancellation.
#[derive(Clone)]
pub struct ShipmentService {
    db_pool: Arc<DbPool>,
    carrier: Arc<dyn ShippingCarrier>,
    settlement: Arc<SettlementConfig>,
    state_machine: OrderStateMachine,
}

impl ShipmentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        carrier: Arc<dyn ShippingCarrier>,
        settlement: Arc<SettlementConfig>,
        state_machine: OrderStateMachine,
    ) -> Self {
        Self {
            db_pool,
            carrier,
            settlement,
            state_machine,
        }
    }

    fn fallback_quote(&self) -> ShippingQuote {
        let option = CourierOption {
            courier_id: "standard".to_string(),
            name: "Standard Delivery".to_string(),
            freight_charge: self.settlement.flat_shipping_fee,
            cod_charge: Decimal::ZERO,
            total_charge: self.settlement.flat_shipping_fee,
            estimated_days: Some(FALLBACK_DELIVERY_DAYS),
            etd: None,
            pickup_performance: None,
            delivery_performance: None,
        };
        ShippingQuote {
            source: DataSource::Fallback,
            options: vec![option.clone()],
            cheapest: Some(option.clone()),
            fastest: Some(option.clone()),
            recommended: Some(option),
        }
    }

    /// Courier options for a parcel. Any carrier failure degrades to the
    /// flat-rate quote.
    #[instrument(skip(self))]
    pub async fn shipping_quote(
        &self,
        pickup_pincode: &str,
        delivery_pincode: &str,
        weight_kg: Decimal,
        cod: bool,
    ) -> ShippingQuote {
        let weight_kg = weight_kg.max(MIN_PARCEL_WEIGHT_KG);
        match self
            .carrier
            .check_serviceability(pickup_pincode, delivery_pincode, weight_kg, cod)
            .await
        {
            Ok(options) if !options.is_empty() => ShippingQuote {
                source: DataSource::Carrier,
                cheapest: cheapest(&options).cloned(),
                fastest: fastest(&options).cloned(),
                recommended: recommend(&options).cloned(),
                options,
            },
            Ok(_) => {
                warn!(pickup_pincode, delivery_pincode, "No courier serves this route, using flat rate");
                self.fallback_quote()
            }
            Err(e) => {
                warn!(error = %e, "Serviceability check failed, using flat rate");
                self.fallback_quote()
            }
        }
    }

    /// Registers the order with the carrier and stores the carrier ids
    /// verbatim. With `courier_id` the courier is assigned too; a failed
    /// assignment leaves the shipment without an AWB for a later retry.
    #[instrument(skip(self))]
    pub async fn create_shipment(
        &self,
        order_id: &str,
        courier_id: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        if order.carrier_order_id.is_some() {
            return Ok(order);
        }
        if !matches!(
            order.status,
            OrderStatus::Confirmed | OrderStatus::Processing | OrderStatus::Packed
        ) {
            return Err(ServiceError::ValidationError(format!(
                "Cannot ship an order that is {}",
                order.status
            )));
        }

        let request = self.build_request(&order).await?;
        let created = self.carrier.create_shipment(&request).await?;

        let assignment: Option<CourierAssignment> = match courier_id.as_deref() {
            Some(courier) => match self.carrier.assign_courier(&created.shipment_id, courier).await {
                Ok(assignment) => Some(assignment),
                Err(e) => {
                    warn!(%order_id, courier, error = %e, "Courier assignment failed");
                    None
                }
            },
            None => None,
        };

        let txn = db.begin().await?;
        let locked = lock_order(&txn, order_id).await?;
        let mut active: order::ActiveModel = locked.into();
        active.carrier_order_id = Set(Some(created.carrier_order_id.clone()));
        active.carrier_shipment_id = Set(Some(created.shipment_id.clone()));
        active.carrier_status = Set(Some(created.status.clone()));
        if let Some(assignment) = &assignment {
            active.awb_code = Set(Some(assignment.awb_code.clone()));
            active.courier_id = Set(Some(assignment.courier_id.clone()));
            active.courier_name = Set(Some(assignment.courier_name.clone()));
        }
        let updated = active.update(&txn).await?;

        let message = match &assignment {
            Some(a) => format!(
                "Shipment {} created with {}. AWB: {}",
                created.shipment_id, a.courier_name, a.awb_code
            ),
            None => format!("Shipment {} created", created.shipment_id),
        };
        self.state_machine
            .record(&txn, &updated, "Shipment Created", message, Actor::system())
            .await?;
        txn.commit().await?;

        info!(%order_id, carrier_order_id = %created.carrier_order_id, "Shipment created");
        Ok(updated)
    }

    async fn build_request(&self, order: &order::Model) -> Result<ShipmentRequest, ServiceError> {
        let db = &*self.db_pool;
        let address = DeliveryAddressEntity::find_by_id(order.delivery_address_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Delivery address {} not found",
                    order.delivery_address_id
                ))
            })?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id.as_str()))
            .filter(order_item::Column::ItemStatus.ne(ItemStatus::Cancelled))
            .all(db)
            .await?;

        let mut pickup_pincode = None;
        let mut weight_kg = Decimal::ZERO;
        let mut shipment_items = Vec::with_capacity(items.len());
        for item in &items {
            if let Some(product) = ProductEntity::find_by_id(item.product_id).one(db).await? {
                pickup_pincode.get_or_insert(product.pincode.clone());
                weight_kg += product.weight_per_unit_kg * item.quantity;
            }
            shipment_items.push(ShipmentItem {
                name: item.product_name.clone(),
                sku: item.product_id.to_string(),
                units: item.quantity,
                selling_price: item.unit_price,
            });
        }

        let street = match &address.address_line2 {
            Some(line2) if !line2.is_empty() => format!("{}, {}", address.address_line1, line2),
            _ => address.address_line1.clone(),
        };
        Ok(ShipmentRequest {
            order_id: order.id.clone(),
            order_date: order.created_at,
            pickup_pincode: pickup_pincode
                .unwrap_or_else(|| self.settlement.default_pickup_pincode.clone()),
            billing: ShipmentAddress {
                name: address.name,
                phone: address.phone,
                address: street,
                city: address.city,
                state: address.state,
                pincode: address.pincode,
            },
            items: shipment_items,
            cod: order.payment_method.is_cod(),
            sub_total: order.total_amount,
            weight_kg: weight_kg.max(MIN_PARCEL_WEIGHT_KG),
        })
    }

    /// Latest carrier status for an order with an AWB. Advisory: failures
    /// fall back to the locally recorded status.
    #[instrument(skip(self))]
    pub async fn refresh_tracking(&self, order_id: &str) -> Result<TrackingSnapshot, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        let local = |order: &order::Model| TrackingSnapshot {
            order_id: order.id.clone(),
            source: DataSource::Fallback,
            status: order
                .carrier_status
                .clone()
                .unwrap_or_else(|| order.status.to_string()),
            events: Vec::new(),
        };

        let Some(awb) = order.awb_code.clone() else {
            return Ok(local(&order));
        };

        match self.carrier.track(&awb).await {
            Ok(tracking) => {
                let txn = db.begin().await?;
                let locked = lock_order(&txn, order_id).await?;
                let mut active: order::ActiveModel = locked.into();
                active.carrier_status = Set(Some(tracking.current_status.clone()));
                active.update(&txn).await?;
                txn.commit().await?;

                info!(%order_id, status = %tracking.current_status, "Tracking refreshed");
                Ok(TrackingSnapshot {
                    order_id: order.id,
                    source: DataSource::Carrier,
                    status: tracking.current_status,
                    events: tracking.events,
                })
            }
            Err(e) => {
                warn!(%order_id, %awb, error = %e, "Tracking lookup failed, using local status");
                Ok(local(&order))
            }
        }
    }
}
