use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    /// Domain operations never fail because a listener went away.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Event dropped");
        }
    }
}

/// Settlement events published after the owning transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: String,
        total_amount: Decimal,
    },
    OrderStatusChanged {
        order_id: String,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    InventoryReserved {
        product_id: Uuid,
        quantity: Decimal,
    },
    InventoryReleased {
        product_id: Uuid,
        quantity: Decimal,
    },
    PaymentCaptured {
        order_id: String,
        payment_id: String,
    },
    PaymentFailed {
        order_id: String,
    },
    CancellationRequested {
        order_id: String,
        request_id: Uuid,
    },
    CancellationApproved {
        order_id: String,
        request_id: Uuid,
        final_refund_amount: Decimal,
    },
    CancellationRejected {
        order_id: String,
        request_id: Uuid,
    },
    RefundProcessed {
        order_id: String,
        refund_id: String,
        amount: Decimal,
    },
    CarrierCancellationFailed {
        order_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CarrierCancellationFailed { order_id, reason, .. } => {
                warn!(
                    order_id = %order_id,
                    reason = %reason,
                    "Carrier cancellation needs operator retry"
                );
            }
            other => {
                let payload = serde_json::to_string(other).unwrap_or_default();
                info!(event = %payload, "Settlement event");
            }
        }
    }

    info!("Event processing loop stopped");
}
