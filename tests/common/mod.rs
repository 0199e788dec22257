#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use farmgate_settlement::{
    auth::{AdminAuthorizer, AdminCapability},
    config::AppConfig,
    db::{self, DbPool},
    entities::{delivery_address, order, order_status_history, product},
    errors::ServiceError,
    integrations::{
        signature, CancellationEligibility, CarrierCancellation, CourierAssignment,
        CourierOption, CreatedShipment, GatewayOrder, GatewayPayment, GatewayRefund, Notes,
        PaymentGateway, ShipmentRequest, ShippingCarrier, TrackingInfo,
    },
    services::{
        orders::{OrderLineRequest, PlaceOrderRequest},
        payments::ConfirmPaymentRequest,
        SettlementServices,
    },
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use tempfile::TempDir;
use uuid::Uuid;

pub const GATEWAY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Gateway double with switchable failures and call counters.
#[derive(Default)]
pub struct FakeGateway {
    pub fail_refunds: AtomicBool,
    pub refund_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    orders: Mutex<HashMap<String, i64>>,
    pub refunds: Mutex<Vec<(String, i64)>>,
}

impl FakeGateway {
    pub fn payment_id_for(gateway_order_id: &str) -> String {
        format!("pay_{}", gateway_order_id)
    }

    pub fn checkout_signature(gateway_order_id: &str, payment_id: &str) -> String {
        signature::sign_hex(
            GATEWAY_SECRET,
            format!("{}|{}", gateway_order_id, payment_id).as_bytes(),
        )
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(
        &self,
        amount_minor: i64,
        _receipt: &str,
        _notes: Notes,
    ) -> Result<GatewayOrder, ServiceError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let gateway_order_id = format!("order_test{:04}", n);
        self.orders
            .lock()
            .unwrap()
            .insert(gateway_order_id.clone(), amount_minor);
        Ok(GatewayOrder {
            gateway_order_id,
            amount_minor,
            currency: "INR".into(),
            status: "created".into(),
        })
    }

    fn verify_signature(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool {
        signature::verify_payment_signature(GATEWAY_SECRET, gateway_order_id, payment_id, signature)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        signature::verify_webhook_signature(WEBHOOK_SECRET, payload, signature)
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError> {
        let gateway_order_id = payment_id.trim_start_matches("pay_").to_string();
        let amount_minor = self
            .orders
            .lock()
            .unwrap()
            .get(&gateway_order_id)
            .copied()
            .ok_or_else(|| ServiceError::GatewayError("unknown payment".into()))?;
        Ok(GatewayPayment {
            payment_id: payment_id.to_string(),
            gateway_order_id: Some(gateway_order_id),
            status: "captured".into(),
            amount_minor,
            currency: "INR".into(),
            method: Some("upi".into()),
        })
    }

    async fn refund(
        &self,
        payment_id: &str,
        amount_minor: i64,
        _notes: Notes,
    ) -> Result<GatewayRefund, ServiceError> {
        let n = self.refund_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayError(
                "The refund could not be processed".into(),
            ));
        }
        self.refunds
            .lock()
            .unwrap()
            .push((payment_id.to_string(), amount_minor));
        Ok(GatewayRefund {
            refund_id: format!("rfnd_test{:04}", n),
            amount_minor,
            status: "processed".into(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierEligibilityMode {
    Allow,
    PickupScheduled,
    Unavailable,
}

/// Carrier double with switchable failures and call counters.
pub struct FakeCarrier {
    pub fail_cancel: AtomicBool,
    /// Serviceability and tracking calls fail while set
    pub offline: AtomicBool,
    pub cancel_calls: AtomicUsize,
    shipments: AtomicUsize,
    pub eligibility: Mutex<CarrierEligibilityMode>,
    /// Order cancelled behind the caller's back on the next eligibility check
    pub cancel_during_check: Mutex<Option<(Arc<DbPool>, String)>>,
}

impl Default for FakeCarrier {
    fn default() -> Self {
        Self {
            fail_cancel: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            cancel_calls: AtomicUsize::new(0),
            shipments: AtomicUsize::new(0),
            eligibility: Mutex::new(CarrierEligibilityMode::Allow),
            cancel_during_check: Mutex::new(None),
        }
    }
}

impl FakeCarrier {
    pub fn set_eligibility(&self, mode: CarrierEligibilityMode) {
        *self.eligibility.lock().unwrap() = mode;
    }
}

#[async_trait]
impl ShippingCarrier for FakeCarrier {
    async fn check_serviceability(
        &self,
        _pickup_pincode: &str,
        _delivery_pincode: &str,
        _weight_kg: Decimal,
        _cod: bool,
    ) -> Result<Vec<CourierOption>, ServiceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ServiceError::CarrierError("carrier unavailable".into()));
        }
        let courier = |id: &str, name: &str, minor: i64, days: u32, score: f64| CourierOption {
            courier_id: id.into(),
            name: name.into(),
            freight_charge: Decimal::new(minor, 2),
            cod_charge: Decimal::ZERO,
            total_charge: Decimal::new(minor, 2),
            estimated_days: Some(days),
            etd: None,
            pickup_performance: Some(4.1),
            delivery_performance: Some(score),
        };
        Ok(vec![
            courier("24", "Test Express", 6500, 3, 88.0),
            courier("31", "Budget Surface", 4800, 6, 62.0),
            courier("51", "Air Priority", 11000, 1, 95.0),
        ])
    }

    async fn create_shipment(
        &self,
        _request: &ShipmentRequest,
    ) -> Result<CreatedShipment, ServiceError> {
        let n = self.shipments.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedShipment {
            carrier_order_id: format!("{}", 900_000 + n),
            shipment_id: format!("{}", 800_000 + n),
            status: "NEW".into(),
        })
    }

    async fn assign_courier(
        &self,
        _shipment_id: &str,
        courier_id: &str,
    ) -> Result<CourierAssignment, ServiceError> {
        Ok(CourierAssignment {
            awb_code: "AWB0001".into(),
            courier_id: courier_id.to_string(),
            courier_name: "Test Express".into(),
        })
    }

    async fn track(&self, _awb_code: &str) -> Result<TrackingInfo, ServiceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ServiceError::CarrierError("carrier unavailable".into()));
        }
        Ok(TrackingInfo {
            current_status: "IN TRANSIT".into(),
            events: Vec::new(),
        })
    }

    async fn cancel(
        &self,
        _carrier_order_ids: &[String],
    ) -> Result<CarrierCancellation, ServiceError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(ServiceError::CarrierError("carrier timed out".into()));
        }
        Ok(CarrierCancellation {
            success: true,
            message: "Order cancelled successfully".into(),
        })
    }

    async fn check_cancellation_eligibility(
        &self,
        _carrier_order_id: &str,
    ) -> Result<CancellationEligibility, ServiceError> {
        let interleaved = self.cancel_during_check.lock().unwrap().take();
        if let Some((db, order_id)) = interleaved {
            let current = order::Entity::find_by_id(order_id)
                .one(&*db)
                .await
                .expect("load order")
                .expect("order exists");
            let mut active: order::ActiveModel = current.into();
            active.status = Set(order::OrderStatus::Cancelled);
            active.update(&*db).await.expect("cancel order");
        }
        match *self.eligibility.lock().unwrap() {
            CarrierEligibilityMode::Allow => Ok(CancellationEligibility {
                can_cancel: true,
                pickup_scheduled_date: None,
                pickup_completed: false,
                current_status: Some("NEW".into()),
            }),
            CarrierEligibilityMode::PickupScheduled => Ok(CancellationEligibility {
                can_cancel: false,
                pickup_scheduled_date: Some("2026-10-20".into()),
                pickup_completed: false,
                current_status: Some("PICKUP SCHEDULED".into()),
            }),
            CarrierEligibilityMode::Unavailable => {
                Err(ServiceError::CarrierError("carrier unavailable".into()))
            }
        }
    }
}

/// Settlement services over a fresh file-backed SQLite database.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub services: SettlementServices,
    pub gateway: Arc<FakeGateway>,
    pub carrier: Arc<FakeCarrier>,
    pub admin: AdminCapability,
    _dir: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_pool_size(1).await
    }

    pub async fn with_pool_size(connections: u32) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("settlement.db").display());
        let mut config = AppConfig::new(url, "test".into());
        config.db_max_connections = connections;
        config.db_min_connections = 1;
        config.admin_tokens = ADMIN_TOKEN.into();

        let pool = db::establish_connection_from_app_config(&config)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool).await.expect("migrations");
        let db = Arc::new(pool);

        let gateway = Arc::new(FakeGateway::default());
        let carrier = Arc::new(FakeCarrier::default());
        let services = SettlementServices::new(
            db.clone(),
            &config,
            gateway.clone(),
            carrier.clone(),
            None,
        );
        let admin = AdminAuthorizer::new(config.admin_token_list())
            .authorize(ADMIN_TOKEN, "ops@farmgate")
            .expect("admin capability");

        Self {
            db,
            config,
            services,
            gateway,
            carrier,
            admin,
            _dir: dir,
        }
    }

    pub async fn seed_address(&self, user_id: Uuid) -> Uuid {
        let address = delivery_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            name: Set("Asha Kumar".into()),
            phone: Set("9800000000".into()),
            address_line1: Set("12 Market Road".into()),
            address_line2: Set(None),
            city: Set("Pune".into()),
            state: Set("Maharashtra".into()),
            pincode: Set("411001".into()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed address");
        address.id
    }

    pub async fn seed_product(&self, price: Decimal, quantity_available: Decimal) -> Uuid {
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            seller_id: Set(Uuid::new_v4()),
            title: Set("Alphonso Mangoes".into()),
            unit: Set("kg".into()),
            price_per_unit: Set(price),
            quantity_available: Set(quantity_available),
            pincode: Set("415612".into()),
            weight_per_unit_kg: Set(Decimal::ONE),
            is_published: Set(true),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("seed product");
        product.id
    }

    pub async fn product(&self, product_id: Uuid) -> product::Model {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn order(&self, order_id: &str) -> order::Model {
        self.services
            .checkout
            .get_order(order_id)
            .await
            .expect("load order")
    }

    pub async fn history(&self, order_id: &str) -> Vec<order_status_history::Model> {
        self.services
            .checkout
            .status_history(order_id)
            .await
            .expect("load history")
    }

    pub async fn place_order(
        &self,
        user_id: Uuid,
        address_id: Uuid,
        product_id: Uuid,
        quantity: Decimal,
        payment_method: order::PaymentMethod,
    ) -> Result<order::Model, ServiceError> {
        let request = PlaceOrderRequest {
            delivery_address_id: address_id,
            payment_method,
            items: vec![OrderLineRequest {
                product_id,
                quantity,
            }],
            discount: Decimal::ZERO,
            notes: None,
        };
        self.services
            .checkout
            .place_order(user_id, request)
            .await
            .map(|placed| placed.order)
    }

    /// Runs the client-side checkout: creates the gateway order and confirms
    /// it with a valid signature.
    pub async fn pay(&self, order_id: &str) -> order::Model {
        let gateway_order = self
            .services
            .payments
            .initiate_payment(order_id)
            .await
            .expect("initiate payment");
        let payment_id = FakeGateway::payment_id_for(&gateway_order.gateway_order_id);
        let signature =
            FakeGateway::checkout_signature(&gateway_order.gateway_order_id, &payment_id);
        self.services
            .payments
            .confirm_payment(
                order_id,
                ConfirmPaymentRequest {
                    gateway_order_id: gateway_order.gateway_order_id,
                    payment_id,
                    signature,
                },
            )
            .await
            .expect("confirm payment")
    }

    /// A paid UPI order for `quantity` units, confirmed and ready to cancel.
    pub async fn paid_order(&self, user_id: Uuid, price: Decimal, quantity: Decimal) -> (order::Model, Uuid) {
        let address_id = self.seed_address(user_id).await;
        let product_id = self.seed_product(price, Decimal::from(100)).await;
        let placed = self
            .place_order(user_id, address_id, product_id, quantity, order::PaymentMethod::Upi)
            .await
            .expect("place order");
        (self.pay(&placed.id).await, product_id)
    }
}
