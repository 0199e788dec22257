use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// One courier that can serve a pickup/delivery pincode pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierOption {
    pub courier_id: String,
    pub name: String,
    pub freight_charge: Decimal,
    pub cod_charge: Decimal,
    pub total_charge: Decimal,
    pub estimated_days: Option<u32>,
    pub etd: Option<String>,
    pub pickup_performance: Option<f64>,
    pub delivery_performance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentAddress {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub pincode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentItem {
    pub name: String,
    pub sku: String,
    pub units: Decimal,
    pub selling_price: Decimal,
}

/// Everything the carrier needs to create a forward shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    pub order_id: String,
    pub order_date: DateTime<Utc>,
    pub pickup_pincode: String,
    pub billing: ShipmentAddress,
    pub items: Vec<ShipmentItem>,
    pub cod: bool,
    pub sub_total: Decimal,
    pub weight_kg: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedShipment {
    pub carrier_order_id: String,
    pub shipment_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierAssignment {
    pub awb_code: String,
    pub courier_id: String,
    pub courier_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub status: String,
    pub location: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub current_status: String,
    pub events: Vec<TrackingEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierCancellation {
    pub success: bool,
    pub message: String,
}

/// Pickup state of a carrier order as reported by the carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationEligibility {
    pub can_cancel: bool,
    pub pickup_scheduled_date: Option<String>,
    pub pickup_completed: bool,
    pub current_status: Option<String>,
}

impl CancellationEligibility {
    /// Customer-facing reason when the carrier refuses cancellation.
    pub fn refusal_reason(&self) -> Option<String> {
        if self.can_cancel {
            return None;
        }
        if self.pickup_completed {
            return Some("Order has already been picked up by the courier".to_string());
        }
        match &self.pickup_scheduled_date {
            Some(date) => Some(format!("Pickup is already scheduled for {}", date)),
            None => Some("Carrier does not allow cancellation of this order".to_string()),
        }
    }
}

/// Contract for the logistics carrier. Every failure surfaces as
/// `ServiceError::CarrierError`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShippingCarrier: Send + Sync {
    async fn check_serviceability(
        &self,
        pickup_pincode: &str,
        delivery_pincode: &str,
        weight_kg: Decimal,
        cod: bool,
    ) -> Result<Vec<CourierOption>, ServiceError>;

    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
    ) -> Result<CreatedShipment, ServiceError>;

    async fn assign_courier(
        &self,
        shipment_id: &str,
        courier_id: &str,
    ) -> Result<CourierAssignment, ServiceError>;

    async fn track(&self, awb_code: &str) -> Result<TrackingInfo, ServiceError>;

    async fn cancel(&self, carrier_order_ids: &[String])
        -> Result<CarrierCancellation, ServiceError>;

    async fn check_cancellation_eligibility(
        &self,
        carrier_order_id: &str,
    ) -> Result<CancellationEligibility, ServiceError>;
}

/// Cheapest option by total charge.
pub fn cheapest(options: &[CourierOption]) -> Option<&CourierOption> {
    options.iter().min_by(|a, b| a.total_charge.cmp(&b.total_charge))
}

/// Fastest option by estimated days; options without an estimate sort last.
pub fn fastest(options: &[CourierOption]) -> Option<&CourierOption> {
    options
        .iter()
        .min_by_key(|o| (o.estimated_days.unwrap_or(u32::MAX), o.total_charge))
}

/// Couriers at or above this delivery performance score count as reliable.
pub const RELIABLE_DELIVERY_SCORE: f64 = 80.0;

/// Cheapest reliable courier, falling back to the cheapest overall when no
/// courier reports a reliable delivery score.
pub fn recommend(options: &[CourierOption]) -> Option<&CourierOption> {
    let reliable: Vec<&CourierOption> = options
        .iter()
        .filter(|o| o.delivery_performance.unwrap_or(0.0) >= RELIABLE_DELIVERY_SCORE)
        .collect();
    reliable
        .into_iter()
        .min_by(|a, b| a.total_charge.cmp(&b.total_charge))
        .or_else(|| cheapest(options))
}
