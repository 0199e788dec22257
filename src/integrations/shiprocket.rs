use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::shipping_carrier::{
    CancellationEligibility, CarrierCancellation, CourierAssignment, CourierOption,
    CreatedShipment, ShipmentRequest, ShippingCarrier, TrackingEvent, TrackingInfo,
};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::CarrierConfig;
use crate::errors::ServiceError;

/// Carrier statuses meaning the parcel has left the seller.
const PICKED_UP_STATUSES: &[&str] = &[
    "PICKED UP",
    "SHIPPED",
    "IN TRANSIT",
    "OUT FOR DELIVERY",
    "DELIVERED",
];

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// HTTP client for the Shiprocket external API.
///
/// The bearer token from `/auth/login` is cached for `token_ttl_secs`. A 401
/// on any call drops the cached token and retries that call exactly once.
/// All calls go through a circuit breaker.
pub struct ShiprocketClient {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    token_ttl: Duration,
    token: RwLock<Option<CachedToken>>,
    breaker: CircuitBreaker,
}

impl ShiprocketClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            password: config.password.clone(),
            token_ttl: Duration::from_secs(config.token_ttl_secs),
            token: RwLock::new(None),
            breaker: CircuitBreaker::new(
                "shipping carrier",
                config.circuit_breaker_failure_threshold,
                Duration::from_secs(config.circuit_breaker_reset_secs),
            ),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn token(&self) -> Result<String, ServiceError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        let mut cached = self.token.write().await;
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
            return Ok(token.value.clone());
        }
        let value = self.login().await?;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + self.token_ttl,
        });
        Ok(value)
    }

    /// Drops the cached token, unless another call already replaced the
    /// `rejected` one with a fresh login.
    async fn invalidate_token(&self, rejected: &str) {
        let mut cached = self.token.write().await;
        if cached.as_ref().is_some_and(|t| t.value == rejected) {
            *cached = None;
        }
    }

    async fn login(&self) -> Result<String, ServiceError> {
        let response = self
            .http
            .post(self.url("auth/login"))
            .json(&json!({ "email": self.email, "password": self.password }))
            .send()
            .await
            .map_err(|e| ServiceError::CarrierError(format!("authentication failed: {}", e)))?;

        if !response.status().is_success() {
            error!(status = %response.status(), "Carrier authentication rejected");
            return Err(ServiceError::CarrierError(format!(
                "authentication failed with status {}",
                response.status().as_u16()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::CarrierError(format!("invalid auth response: {}", e)))?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::CarrierError("no token in auth response".to_string()))?;

        info!("Carrier authentication successful");
        Ok(token.to_string())
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response, ServiceError> {
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| ServiceError::CarrierError(format!("{} {} failed: {}", method, path, e)))
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ServiceError> {
        let token = self.token().await?;
        let mut response = self.send_once(&method, path, query, body, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "Carrier token rejected, refreshing once");
            self.invalidate_token(&token).await;
            let token = self.token().await?;
            response = self.send_once(&method, path, query, body, &token).await?;
        }

        let status = response.status();
        let raw = response.bytes().await.map_err(|e| {
            ServiceError::CarrierError(format!("{} {} body could not be read: {}", method, path, e))
        })?;
        if !status.is_success() {
            let payload: Value = serde_json::from_slice(&raw).unwrap_or(Value::Null);
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unexpected response")
                .to_string();
            error!(path, status = %status, %message, "Carrier request failed");
            return Err(ServiceError::CarrierError(format!(
                "{} {} returned {}: {}",
                method,
                path,
                status.as_u16(),
                message
            )));
        }
        let payload: Value = serde_json::from_slice(&raw).map_err(|e| {
            error!(path, status = %status, error = %e, "Carrier sent an unreadable body");
            ServiceError::CarrierError(format!(
                "{} {} returned an unreadable body: {}",
                method, path, e
            ))
        })?;
        debug!(path, "Carrier request succeeded");
        Ok(payload)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ServiceError> {
        self.breaker
            .call(|| self.execute(method, path, query, body))
            .await
    }
}

/// Reads a money-like field that the carrier sends either as a number or a
/// numeric string.
fn decimal_field(value: &Value, key: &str) -> Decimal {
    let raw = match value.get(key) {
        Some(Value::Number(n)) => n.as_f64().and_then(Decimal::from_f64),
        Some(Value::String(s)) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    };
    raw.unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn id_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn float_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_courier(raw: &Value) -> Option<CourierOption> {
    let courier_id = id_field(raw, "courier_company_id")?;
    let estimated_days = match raw.get("estimated_delivery_days") {
        Some(Value::Number(n)) => n.as_u64().map(|d| d as u32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    Some(CourierOption {
        courier_id,
        name: string_field(raw, "courier_name").unwrap_or_default(),
        freight_charge: decimal_field(raw, "freight_charge"),
        cod_charge: decimal_field(raw, "cod_charges"),
        total_charge: decimal_field(raw, "rate"),
        estimated_days,
        etd: string_field(raw, "etd"),
        pickup_performance: float_field(raw, "pickup_performance"),
        delivery_performance: float_field(raw, "delivery_performance"),
    })
}

#[async_trait]
impl ShippingCarrier for ShiprocketClient {
    #[instrument(skip(self))]
    async fn check_serviceability(
        &self,
        pickup_pincode: &str,
        delivery_pincode: &str,
        weight_kg: Decimal,
        cod: bool,
    ) -> Result<Vec<CourierOption>, ServiceError> {
        let query = [
            ("pickup_postcode", pickup_pincode.to_string()),
            ("delivery_postcode", delivery_pincode.to_string()),
            ("weight", weight_kg.to_string()),
            ("cod", if cod { "1" } else { "0" }.to_string()),
        ];
        let body = self
            .request(Method::GET, "courier/serviceability/", &query, None)
            .await?;

        let options = body
            .pointer("/data/available_courier_companies")
            .and_then(Value::as_array)
            .map(|couriers| couriers.iter().filter_map(parse_courier).collect())
            .unwrap_or_default();
        Ok(options)
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
    ) -> Result<CreatedShipment, ServiceError> {
        let items: Vec<Value> = request
            .items
            .iter()
            .map(|item| {
                json!({
                    "name": item.name,
                    "sku": item.sku,
                    "units": item.units,
                    "selling_price": item.selling_price,
                })
            })
            .collect();
        let body = json!({
            "order_id": request.order_id,
            "order_date": request.order_date.format("%Y-%m-%d %H:%M").to_string(),
            "pickup_location": "Primary",
            "billing_customer_name": request.billing.name,
            "billing_last_name": "",
            "billing_address": request.billing.address,
            "billing_city": request.billing.city,
            "billing_pincode": request.billing.pincode,
            "billing_state": request.billing.state,
            "billing_country": "India",
            "billing_phone": request.billing.phone,
            "shipping_is_billing": true,
            "order_items": items,
            "payment_method": if request.cod { "COD" } else { "Prepaid" },
            "sub_total": request.sub_total,
            "length": 10,
            "breadth": 15,
            "height": 20,
            "weight": request.weight_kg,
        });

        let response = self
            .request(Method::POST, "orders/create/adhoc", &[], Some(&body))
            .await?;

        let carrier_order_id = id_field(&response, "order_id").ok_or_else(|| {
            ServiceError::CarrierError("shipment response has no order id".to_string())
        })?;
        let shipment_id = id_field(&response, "shipment_id").ok_or_else(|| {
            ServiceError::CarrierError("shipment response has no shipment id".to_string())
        })?;
        info!(%carrier_order_id, %shipment_id, "Carrier shipment created");
        Ok(CreatedShipment {
            carrier_order_id,
            shipment_id,
            status: string_field(&response, "status").unwrap_or_else(|| "NEW".to_string()),
        })
    }

    #[instrument(skip(self))]
    async fn assign_courier(
        &self,
        shipment_id: &str,
        courier_id: &str,
    ) -> Result<CourierAssignment, ServiceError> {
        let body = json!({ "shipment_id": shipment_id, "courier_id": courier_id });
        let response = self
            .request(Method::POST, "courier/assign/awb", &[], Some(&body))
            .await?;

        let data = response
            .pointer("/response/data")
            .cloned()
            .unwrap_or(response);
        let awb_code = string_field(&data, "awb_code").ok_or_else(|| {
            ServiceError::CarrierError("courier assignment returned no AWB".to_string())
        })?;
        Ok(CourierAssignment {
            awb_code,
            courier_id: id_field(&data, "courier_company_id")
                .unwrap_or_else(|| courier_id.to_string()),
            courier_name: string_field(&data, "courier_name").unwrap_or_default(),
        })
    }

    #[instrument(skip(self))]
    async fn track(&self, awb_code: &str) -> Result<TrackingInfo, ServiceError> {
        let query = [("awb_code", awb_code.to_string())];
        let response = self
            .request(Method::GET, "courier/track", &query, None)
            .await?;

        let tracking = response.get("tracking_data").cloned().unwrap_or(Value::Null);
        let events = tracking
            .get("shipment_track")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| TrackingEvent {
                        status: string_field(entry, "status")
                            .or_else(|| string_field(entry, "activity"))
                            .unwrap_or_default(),
                        location: string_field(entry, "location"),
                        timestamp: string_field(entry, "date"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(TrackingInfo {
            current_status: string_field(&tracking, "current_status")
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            events,
        })
    }

    #[instrument(skip(self))]
    async fn cancel(
        &self,
        carrier_order_ids: &[String],
    ) -> Result<CarrierCancellation, ServiceError> {
        let body = json!({ "ids": carrier_order_ids });
        let response = self
            .request(Method::POST, "orders/cancel", &[], Some(&body))
            .await?;

        Ok(CarrierCancellation {
            success: true,
            message: string_field(&response, "message")
                .unwrap_or_else(|| "Orders cancelled successfully".to_string()),
        })
    }

    #[instrument(skip(self))]
    async fn check_cancellation_eligibility(
        &self,
        carrier_order_id: &str,
    ) -> Result<CancellationEligibility, ServiceError> {
        let response = self
            .request(
                Method::GET,
                &format!("orders/show/{}", carrier_order_id),
                &[],
                None,
            )
            .await?;

        let data = response.get("data").cloned().unwrap_or(Value::Null);
        let shipment = match data.get("shipments") {
            Some(Value::Array(list)) => list.first().cloned().unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };
        let current_status = string_field(&data, "status");
        let pickup_scheduled_date = string_field(&shipment, "pickup_scheduled_date")
            .or_else(|| string_field(&data, "pickup_scheduled_date"));
        let pickup_completed = string_field(&shipment, "pickedup_timestamp").is_some()
            || current_status
                .as_deref()
                .map(|s| PICKED_UP_STATUSES.contains(&s.to_uppercase().as_str()))
                .unwrap_or(false);

        Ok(CancellationEligibility {
            can_cancel: !pickup_completed && pickup_scheduled_date.is_none(),
            pickup_scheduled_date,
            pickup_completed,
            current_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_courier_with_string_and_numeric_fields() {
        let raw = json!({
            "courier_company_id": 24,
            "courier_name": "Xpressbees Surface",
            "freight_charge": 61.5,
            "cod_charges": "0",
            "rate": "61.50",
            "estimated_delivery_days": "4",
            "delivery_performance": 4.2,
        });
        let courier = parse_courier(&raw).unwrap();
        assert_eq!(courier.courier_id, "24");
        assert_eq!(courier.total_charge, dec!(61.50));
        assert_eq!(courier.freight_charge, dec!(61.50));
        assert_eq!(courier.estimated_days, Some(4));
        assert_eq!(courier.delivery_performance, Some(4.2));
    }

    #[test]
    fn courier_without_id_is_skipped() {
        assert!(parse_courier(&json!({ "courier_name": "ghost" })).is_none());
    }

    #[tokio::test]
    async fn stale_rejection_keeps_refreshed_token() {
        let client = ShiprocketClient::new(&CarrierConfig::default()).unwrap();
        *client.token.write().await = Some(CachedToken {
            value: "tok-2".into(),
            expires_at: Instant::now() + Duration::from_secs(60),
        });

        client.invalidate_token("tok-1").await;
        assert_eq!(client.token().await.unwrap(), "tok-2");

        client.invalidate_token("tok-2").await;
        assert!(client.token.read().await.is_none());
    }
}
