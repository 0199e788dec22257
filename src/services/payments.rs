use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::order_status::{find_order, lock_order, Actor, OrderStateMachine};
use super::order_totals::to_minor_units;
use crate::db::DbPool;
use crate::entities::order::{self, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::integrations::{GatewayOrder, Notes, PaymentGateway};
use crate::metrics::WEBHOOK_EVENTS;

/// Result of processing one webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    /// Redelivery of an event whose effect is already recorded
    AlreadyApplied,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub gateway_order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    payment: Option<WebhookPayment>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    entity: PaymentEntity,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
}

/// Orchestrates the gateway side of an order: creating the gateway order,
/// confirming the client-side checkout and applying webhooks.
#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    state_machine: OrderStateMachine,
    event_sender: Option<Arc<EventSender>>,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        state_machine: OrderStateMachine,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            state_machine,
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    /// Creates the gateway order for a prepaid order. Calling it again
    /// returns the stored gateway order id without a new gateway call.
    #[instrument(skip(self))]
    pub async fn initiate_payment(&self, order_id: &str) -> Result<GatewayOrder, ServiceError> {
        let order = find_order(&*self.db_pool, order_id).await?;
        if order.payment_method.is_cod() {
            return Err(ServiceError::ValidationError(
                "Cash on delivery orders are paid on delivery".to_string(),
            ));
        }
        if order.payment_status != PaymentStatus::Pending {
            return Err(ServiceError::ValidationError(format!(
                "Payment for order {} is already {}",
                order.id, order.payment_status
            )));
        }

        let amount_minor = to_minor_units(order.total_amount)?;
        if let Some(existing) = order.gateway_order_id.clone() {
            return Ok(GatewayOrder {
                gateway_order_id: existing,
                amount_minor,
                currency: "INR".to_string(),
                status: "created".to_string(),
            });
        }

        let mut notes = Notes::new();
        notes.insert("order_id".to_string(), order.id.clone());
        notes.insert("order_uuid".to_string(), order.uuid.to_string());
        let gateway_order = self
            .gateway
            .create_order(amount_minor, &order.id, notes)
            .await?;

        let txn = self.db_pool.begin().await?;
        let locked = lock_order(&txn, order_id).await?;
        let mut active: order::ActiveModel = locked.into();
        active.gateway_order_id = Set(Some(gateway_order.gateway_order_id.clone()));
        let updated = active.update(&txn).await?;
        self.state_machine
            .record(
                &txn,
                &updated,
                "Payment Initiated",
                format!(
                    "Payment of ₹{:.2} initiated. Gateway order: {}",
                    updated.total_amount, gateway_order.gateway_order_id
                ),
                Actor::customer(updated.user_id),
            )
            .await?;
        txn.commit().await?;

        info!(%order_id, gateway_order_id = %gateway_order.gateway_order_id, "Payment initiated");
        Ok(gateway_order)
    }

    /// Verifies the checkout signature and the captured amount, then marks
    /// the payment completed and confirms a pending order.
    #[instrument(skip(self, request), fields(payment_id = %request.payment_id))]
    pub async fn confirm_payment(
        &self,
        order_id: &str,
        request: ConfirmPaymentRequest,
    ) -> Result<order::Model, ServiceError> {
        let order = find_order(&*self.db_pool, order_id).await?;
        if order.payment_status == PaymentStatus::Completed {
            info!(%order_id, "Payment already confirmed");
            return Ok(order);
        }
        if order.gateway_order_id.as_deref() != Some(request.gateway_order_id.as_str()) {
            return Err(ServiceError::ValidationError(
                "Gateway order id does not match this order".to_string(),
            ));
        }
        if !self.gateway.verify_signature(
            &request.gateway_order_id,
            &request.payment_id,
            &request.signature,
        ) {
            warn!(%order_id, "Payment signature mismatch");
            return Err(ServiceError::ValidationError(
                "Invalid payment signature".to_string(),
            ));
        }

        let payment = self.gateway.fetch_payment(&request.payment_id).await?;
        let expected = to_minor_units(order.total_amount)?;
        if payment.amount_minor != expected {
            error!(%order_id, expected, received = payment.amount_minor, "Payment amount mismatch");
            return Err(ServiceError::GatewayError(format!(
                "Payment amount {} does not match order amount {}",
                payment.amount_minor, expected
            )));
        }
        if !payment.is_captured() {
            return Err(ServiceError::GatewayError(format!(
                "Payment not captured. Status: {}",
                payment.status
            )));
        }

        let txn = self.db_pool.begin().await?;
        let locked = lock_order(&txn, order_id).await?;
        if locked.payment_status == PaymentStatus::Completed {
            txn.commit().await?;
            return Ok(locked);
        }
        let updated = self
            .apply_capture(
                &txn,
                locked,
                &request.payment_id,
                Some(request.signature.clone()),
                Actor::system(),
            )
            .await?;
        txn.commit().await?;

        info!(%order_id, payment_id = %request.payment_id, "Payment confirmed");
        self.emit(Event::PaymentCaptured {
            order_id: order_id.to_string(),
            payment_id: request.payment_id,
        })
        .await;
        Ok(updated)
    }

    async fn apply_capture(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        payment_id: &str,
        signature: Option<String>,
        actor: Actor,
    ) -> Result<order::Model, ServiceError> {
        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Completed);
        active.gateway_payment_id = Set(Some(payment_id.to_string()));
        if signature.is_some() {
            active.gateway_signature = Set(signature);
        }
        let mut updated = active.update(txn).await?;

        if updated.status == OrderStatus::Failed {
            updated = self
                .state_machine
                .transition(txn, updated, OrderStatus::Pending, actor, Some("Payment retried"))
                .await?;
        }
        if updated.status == OrderStatus::Pending {
            let note = format!("Payment received. Payment ID: {}", payment_id);
            updated = self
                .state_machine
                .transition(txn, updated, OrderStatus::Confirmed, actor, Some(note.as_str()))
                .await?;
        } else {
            self.state_machine
                .record(
                    txn,
                    &updated,
                    "Payment Captured",
                    format!("Payment captured. Payment ID: {}", payment_id),
                    actor,
                )
                .await?;
        }
        Ok(updated)
    }

    /// Applies a signed gateway webhook. Safe to call repeatedly with the
    /// same delivery.
    #[instrument(skip(self, raw_body, signature))]
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, ServiceError> {
        if !self.gateway.verify_webhook_signature(raw_body, signature) {
            WEBHOOK_EVENTS
                .with_label_values(&["unknown", "rejected"])
                .inc();
            warn!("Webhook signature rejected");
            return Err(ServiceError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(raw_body).map_err(|e| {
            ServiceError::ValidationError(format!("Malformed webhook payload: {}", e))
        })?;

        let outcome = match (envelope.event.as_str(), envelope.payload.payment) {
            ("payment.captured", Some(payment)) => self.on_captured(payment.entity).await?,
            ("payment.failed", Some(payment)) => self.on_failed(payment.entity).await?,
            (event, _) => {
                info!(event, "Ignoring webhook event");
                WebhookOutcome::Ignored
            }
        };

        WEBHOOK_EVENTS
            .with_label_values(&[envelope.event.as_str(), &outcome.to_string()])
            .inc();
        Ok(outcome)
    }

    async fn find_by_gateway_order(
        &self,
        txn: &DatabaseTransaction,
        entity: &PaymentEntity,
    ) -> Result<Option<order::Model>, ServiceError> {
        let Some(gateway_order_id) = entity.order_id.as_deref() else {
            return Ok(None);
        };
        let found = order::Entity::find()
            .filter(order::Column::GatewayOrderId.eq(gateway_order_id))
            .one(txn)
            .await?;
        match found {
            Some(order) => Ok(Some(lock_order(txn, &order.id).await?)),
            None => Ok(None),
        }
    }

    async fn on_captured(&self, entity: PaymentEntity) -> Result<WebhookOutcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let Some(order) = self.find_by_gateway_order(&txn, &entity).await? else {
            warn!(payment_id = %entity.id, "No order for captured payment");
            return Ok(WebhookOutcome::Ignored);
        };
        if order.payment_status == PaymentStatus::Completed {
            return Ok(WebhookOutcome::AlreadyApplied);
        }
        if let Some(amount) = entity.amount {
            let expected = to_minor_units(order.total_amount)?;
            if amount != expected {
                error!(order_id = %order.id, expected, received = amount, "Captured amount mismatch");
                return Ok(WebhookOutcome::Ignored);
            }
        }

        let order_id = order.id.clone();
        self.apply_capture(&txn, order, &entity.id, None, Actor::webhook())
            .await?;
        txn.commit().await?;

        info!(%order_id, payment_id = %entity.id, "Payment captured via webhook");
        self.emit(Event::PaymentCaptured {
            order_id,
            payment_id: entity.id,
        })
        .await;
        Ok(WebhookOutcome::Applied)
    }

    async fn on_failed(&self, entity: PaymentEntity) -> Result<WebhookOutcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let Some(order) = self.find_by_gateway_order(&txn, &entity).await? else {
            warn!(payment_id = %entity.id, "No order for failed payment");
            return Ok(WebhookOutcome::Ignored);
        };
        if matches!(
            order.payment_status,
            PaymentStatus::Completed | PaymentStatus::Failed | PaymentStatus::Refunded
        ) {
            return Ok(WebhookOutcome::AlreadyApplied);
        }

        let order_id = order.id.clone();
        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Failed);
        let updated = active.update(&txn).await?;
        if updated.status == OrderStatus::Pending {
            let note = format!("Payment ID: {}", entity.id);
            self.state_machine
                .transition(
                    &txn,
                    updated,
                    OrderStatus::Failed,
                    Actor::webhook(),
                    Some(note.as_str()),
                )
                .await?;
        } else {
            self.state_machine
                .record(
                    &txn,
                    &updated,
                    "Payment Failed",
                    format!("Payment failed. Payment ID: {}", entity.id),
                    Actor::webhook(),
                )
                .await?;
        }
        txn.commit().await.map_err(|e| {
            error!(%order_id, error = %e, "Failed to commit payment failure");
            ServiceError::DatabaseError(e)
        })?;

        info!(%order_id, payment_id = %entity.id, "Payment failure recorded");
        self.emit(Event::PaymentFailed { order_id }).await;
        Ok(WebhookOutcome::Applied)
    }
}
