// Settlement core
pub mod inventory_ledger;
pub mod order_status;
pub mod order_totals;

// Order lifecycle
pub mod cancellation;
pub mod orders;
pub mod payments;
pub mod shipments;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::integrations::{PaymentGateway, ShippingCarrier};

use cancellation::CancellationRefundEngine;
use inventory_ledger::InventoryLedger;
use order_status::OrderStateMachine;
use orders::CheckoutService;
use payments::PaymentService;
use shipments::ShipmentService;

/// Container holding every settlement service, built once at startup from
/// the shared pool, configuration and adapters.
#[derive(Clone)]
pub struct SettlementServices {
    pub checkout: Arc<CheckoutService>,
    pub payments: Arc<PaymentService>,
    pub shipments: Arc<ShipmentService>,
    pub cancellations: Arc<CancellationRefundEngine>,
}

impl SettlementServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        carrier: Arc<dyn ShippingCarrier>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let settlement = Arc::new(config.settlement.clone());
        let state_machine = OrderStateMachine::new(InventoryLedger::new());

        Self {
            checkout: Arc::new(CheckoutService::new(
                db_pool.clone(),
                settlement.clone(),
                event_sender.clone(),
            )),
            payments: Arc::new(PaymentService::new(
                db_pool.clone(),
                gateway.clone(),
                state_machine,
                event_sender.clone(),
            )),
            shipments: Arc::new(ShipmentService::new(
                db_pool.clone(),
                carrier.clone(),
                settlement.clone(),
                state_machine,
            )),
            cancellations: Arc::new(CancellationRefundEngine::new(
                db_pool,
                gateway,
                carrier,
                state_machine,
                settlement.refund_tolerance,
                event_sender,
            )),
        }
    }
}
