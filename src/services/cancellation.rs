//! Cancellation and refund settlement.
//!
//! Admin approval runs as a two-step saga. The refund is critical: if the
//! gateway fails, the approval transaction is dropped and nothing about the
//! request or order changes. Carrier cancellation runs only after the refund
//! has committed and is best effort; a failure leaves the order status alone
//! so an operator can retry it with [`CancellationRefundEngine::retry_carrier_cancellation`].

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, DbErr, EntityTrait, Iterable,
    PaginatorTrait, QueryFilter, QuerySelect, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::order_status::{can_transition, find_order, lock_order, Actor, OrderStateMachine};
use super::order_totals::{round_money, to_minor_units};
use super::shipments::DataSource;
use crate::auth::AdminCapability;
use crate::db::DbPool;
use crate::entities::order::{self, OrderStatus, PaymentStatus};
use crate::entities::order_cancellation_request::{
    self, Entity as CancellationRequestEntity, ReasonCode, RequestStatus,
};
use crate::entities::order_refund::{self, RefundStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::integrations::{Notes, PaymentGateway, ShippingCarrier};
use crate::metrics::{CARRIER_CANCELLATION_FAILURES, REFUNDS_PROCESSED, REFUND_FAILURES};

const MIN_FUZZY_REASON_LEN: usize = 4;
const DIRECT_REFUND_ESTIMATE: &str = "5-7 business days";
const CARRIER_UNVERIFIED: &str =
    "Could not verify pickup status with carrier; eligibility is based on order status";

fn normalise(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Resolves customer input to a reason code. Accepts the code itself, its
/// label, or the one label that contains (or is contained in) the input.
pub fn parse_reason(input: &str) -> Result<ReasonCode, ServiceError> {
    let wanted = normalise(input);
    let as_code = wanted.replace(' ', "_");

    if let Some(code) = ReasonCode::iter().find(|c| c.to_string() == as_code) {
        return Ok(code);
    }
    if let Some(code) = ReasonCode::iter().find(|c| normalise(c.label()) == wanted) {
        return Ok(code);
    }
    if wanted.len() >= MIN_FUZZY_REASON_LEN {
        let candidates: Vec<ReasonCode> = ReasonCode::iter()
            .filter(|c| {
                let label = normalise(c.label());
                label.contains(&wanted) || wanted.contains(&label)
            })
            .collect();
        match candidates.as_slice() {
            [code] => return Ok(*code),
            [] => {}
            many => {
                let matched: Vec<&str> = many.iter().map(|c| c.label()).collect();
                return Err(ServiceError::ValidationError(format!(
                    "Cancellation reason '{}' is ambiguous; it matches: {}",
                    input.trim(),
                    matched.join(", ")
                )));
            }
        }
    }

    let labels: Vec<&str> = ReasonCode::iter().map(|c| c.label()).collect();
    Err(ServiceError::ValidationError(format!(
        "Unknown cancellation reason '{}'. Valid reasons: {}",
        input.trim(),
        labels.join(", ")
    )))
}

/// `max(0, refund - gateway deduction - platform deduction)`
pub fn derive_final_refund(
    refund_amount: Decimal,
    gateway_fee_deduction: Decimal,
    platform_fee_deduction: Decimal,
) -> Decimal {
    round_money((refund_amount - gateway_fee_deduction - platform_fee_deduction).max(Decimal::ZERO))
}

/// Admin adjustments applied on approval. Absent fields keep the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementOverrides {
    pub gateway_fee_deduction: Option<Decimal>,
    pub platform_fee_deduction: Option<Decimal>,
    pub final_refund_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAmounts {
    pub gateway_fee_deduction: Decimal,
    pub platform_fee_deduction: Decimal,
    pub final_refund_amount: Decimal,
}

/// Applies `overrides` to a request's snapshot. An explicit final amount is
/// accepted only when it lies within `tolerance` of the amount the
/// deductions imply.
pub fn resolve_settlement_amounts(
    refund_amount: Decimal,
    gateway_fee_deduction: Decimal,
    platform_fee_deduction: Decimal,
    overrides: &SettlementOverrides,
    tolerance: Decimal,
) -> Result<SettlementAmounts, ServiceError> {
    let non_negative = |value: Option<Decimal>, field: &str| -> Result<(), ServiceError> {
        match value {
            Some(v) if v < Decimal::ZERO => Err(ServiceError::ValidationError(format!(
                "{} cannot be negative",
                field
            ))),
            _ => Ok(()),
        }
    };
    non_negative(overrides.gateway_fee_deduction, "Gateway fee deduction")?;
    non_negative(overrides.platform_fee_deduction, "Platform fee deduction")?;
    non_negative(overrides.final_refund_amount, "Final refund amount")?;

    let gateway_fee_deduction = round_money(
        overrides
            .gateway_fee_deduction
            .unwrap_or(gateway_fee_deduction),
    );
    let platform_fee_deduction = round_money(
        overrides
            .platform_fee_deduction
            .unwrap_or(platform_fee_deduction),
    );
    let derived = derive_final_refund(refund_amount, gateway_fee_deduction, platform_fee_deduction);

    let final_refund_amount = match overrides.final_refund_amount {
        None => derived,
        Some(requested) => {
            let requested = round_money(requested);
            if requested > refund_amount {
                return Err(ServiceError::ValidationError(format!(
                    "Final refund amount {} exceeds the refundable amount {}",
                    requested, refund_amount
                )));
            }
            if (requested - derived).abs() > tolerance {
                return Err(ServiceError::ValidationError(format!(
                    "Final refund amount {} is inconsistent with the deductions (expected {})",
                    requested, derived
                )));
            }
            requested
        }
    };

    Ok(SettlementAmounts {
        gateway_fee_deduction,
        platform_fee_deduction,
        final_refund_amount,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: Option<String>,
    pub pickup_scheduled_date: Option<String>,
    pub pickup_completed: bool,
    pub source: DataSource,
}

impl Eligibility {
    fn refused(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.into()),
            pickup_scheduled_date: None,
            pickup_completed: false,
            source: DataSource::Local,
        }
    }
}

/// Asks the carrier about pickups for an order that passed the local rules.
/// An unreachable carrier does not block the customer.
pub async fn carrier_eligibility(
    carrier: &dyn ShippingCarrier,
    carrier_order_id: &str,
) -> Eligibility {
    match carrier.check_cancellation_eligibility(carrier_order_id).await {
        Ok(remote) => Eligibility {
            eligible: remote.can_cancel,
            reason: remote.refusal_reason(),
            pickup_scheduled_date: remote.pickup_scheduled_date,
            pickup_completed: remote.pickup_completed,
            source: DataSource::Carrier,
        },
        Err(e) => {
            warn!(carrier_order_id, error = %e, "Carrier eligibility check failed, using local rules");
            Eligibility {
                eligible: true,
                reason: Some(CARRIER_UNVERIFIED.to_string()),
                pickup_scheduled_date: None,
                pickup_completed: false,
                source: DataSource::Fallback,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateCancellationRequest {
    #[validate(length(min = 1, message = "Reason is required"))]
    pub reason: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRefundRequest {
    #[serde(default)]
    pub gateway_fee_deduction: Option<Decimal>,
    #[serde(default)]
    pub platform_fee_deduction: Option<Decimal>,
    #[serde(default)]
    pub final_refund_amount: Option<Decimal>,
    #[serde(default = "default_true")]
    pub process_refund: bool,
    #[serde(default = "default_true")]
    pub cancel_in_carrier: bool,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

impl Default for ProcessRefundRequest {
    fn default() -> Self {
        Self {
            gateway_fee_deduction: None,
            platform_fee_deduction: None,
            final_refund_amount: None,
            process_refund: true,
            cancel_in_carrier: true,
            admin_notes: None,
        }
    }
}

impl ProcessRefundRequest {
    fn overrides(&self) -> SettlementOverrides {
        SettlementOverrides {
            gateway_fee_deduction: self.gateway_fee_deduction,
            platform_fee_deduction: self.platform_fee_deduction,
            final_refund_amount: self.final_refund_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefundOutcome {
    NotRequested,
    Skipped { reason: String },
    Processed { refund_id: String, amount: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CarrierOutcome {
    NotRequested,
    /// Order never reached the carrier; cancelled locally
    NoShipment,
    Cancelled { message: String },
    /// Needs an operator retry
    Failed { reason: String },
    Skipped { reason: String },
}

/// Composite result of an approval. Refund and carrier steps are reported
/// separately because the second can fail after the first has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundSettlement {
    pub request: order_cancellation_request::Model,
    pub order_status: OrderStatus,
    pub refund: RefundOutcome,
    pub carrier: CarrierOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationStats {
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
    pub refund_processed: u64,
    pub total: u64,
    pub total_refunded: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DirectCancelRequest {
    #[validate(length(min = 1, message = "Reason is required"))]
    pub reason: String,
    #[serde(default = "default_true")]
    pub refund_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectCancelOutcome {
    pub order: order::Model,
    pub carrier: CarrierOutcome,
    pub refund: Option<order_refund::Model>,
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

async fn lock_request(
    txn: &DatabaseTransaction,
    request_id: Uuid,
) -> Result<order_cancellation_request::Model, ServiceError> {
    CancellationRequestEntity::find_by_id(request_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Cancellation request {} not found", request_id))
        })
}

fn require_pending(request: &order_cancellation_request::Model) -> Result<(), ServiceError> {
    if request.request_status != RequestStatus::Pending {
        return Err(ServiceError::InvalidRequestState(format!(
            "Cancellation request {} is already {}",
            request.id, request.request_status
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct CancellationRefundEngine {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    carrier: Arc<dyn ShippingCarrier>,
    state_machine: OrderStateMachine,
    refund_tolerance: Decimal,
    event_sender: Option<Arc<EventSender>>,
}

impl CancellationRefundEngine {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        carrier: Arc<dyn ShippingCarrier>,
        state_machine: OrderStateMachine,
        refund_tolerance: Decimal,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            carrier,
            state_machine,
            refund_tolerance,
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    async fn owned_order(&self, order_id: &str, user_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = find_order(&*self.db_pool, order_id).await?;
        if order.user_id != user_id {
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        Ok(order)
    }

    fn local_eligibility(order: &order::Model, has_request: bool) -> Option<Eligibility> {
        if order.payment_method.is_cod() {
            return Some(Eligibility::refused(
                "Cash on Delivery orders cannot request cancellation or refund",
            ));
        }
        if !order.can_be_cancelled() {
            return Some(Eligibility::refused(format!(
                "Orders that are {} cannot be cancelled",
                order.status
            )));
        }
        if has_request {
            return Some(Eligibility::refused(
                "A cancellation request already exists for this order",
            ));
        }
        if order.payment_status != PaymentStatus::Completed {
            return Some(Eligibility::refused(
                "Only paid orders can request a cancellation refund",
            ));
        }
        None
    }

    /// Whether the customer may ask for a cancellation. The carrier has the
    /// final say on pickups; when it cannot be reached the local rules decide.
    #[instrument(skip(self))]
    pub async fn check_eligibility(
        &self,
        order_id: &str,
        user_id: Uuid,
    ) -> Result<Eligibility, ServiceError> {
        let order = self.owned_order(order_id, user_id).await?;
        let has_request = self.get_request(order_id).await?.is_some();
        if let Some(refused) = Self::local_eligibility(&order, has_request) {
            return Ok(refused);
        }

        match order.carrier_order_id.as_deref() {
            Some(carrier_order_id) => Ok(carrier_eligibility(&*self.carrier, carrier_order_id).await),
            None => Ok(Eligibility {
                eligible: true,
                reason: None,
                pickup_scheduled_date: None,
                pickup_completed: false,
                source: DataSource::Local,
            }),
        }
    }

    /// Files a cancellation request with a snapshot of the order's total and
    /// recorded fees.
    #[instrument(skip(self, req))]
    pub async fn create_request(
        &self,
        order_id: &str,
        user_id: Uuid,
        req: CreateCancellationRequest,
    ) -> Result<order_cancellation_request::Model, ServiceError> {
        req.validate()?;
        let reason = parse_reason(&req.reason)?;

        if self.get_request(order_id).await?.is_some() {
            return Err(ServiceError::Conflict(
                "A cancellation request already exists for this order".to_string(),
            ));
        }
        let eligibility = self.check_eligibility(order_id, user_id).await?;
        if !eligibility.eligible {
            return Err(ServiceError::ValidationError(
                eligibility
                    .reason
                    .unwrap_or_else(|| "Order cannot be cancelled".to_string()),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, order_id).await?;
        // The order may have been cancelled or refunded since the check above.
        if let Some(refused) = Self::local_eligibility(&order, false) {
            return Err(ServiceError::ValidationError(
                refused
                    .reason
                    .unwrap_or_else(|| "Order cannot be cancelled".to_string()),
            ));
        }
        let final_refund_amount =
            derive_final_refund(order.total_amount, order.gateway_fee, order.platform_fee);
        let description = req
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        let request = order_cancellation_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id.clone()),
            user_id: Set(user_id),
            reason: Set(reason),
            description: Set(description),
            request_status: Set(RequestStatus::Pending),
            refund_amount: Set(order.total_amount),
            gateway_fee_deduction: Set(order.gateway_fee),
            platform_fee_deduction: Set(order.platform_fee),
            final_refund_amount: Set(final_refund_amount),
            gateway_refund_id: Set(None),
            reviewed_by: Set(None),
            admin_notes: Set(None),
            carrier_cancelled: Set(false),
            carrier_response: Set(None),
            reviewed_at: Set(None),
            refund_processed_at: Set(None),
            ..Default::default()
        };
        let request = match request.insert(&txn).await {
            Ok(request) => request,
            Err(e) if is_unique_violation(&e) => {
                return Err(ServiceError::Conflict(
                    "A cancellation request already exists for this order".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        self.state_machine
            .record(
                &txn,
                &order,
                "Cancellation Requested",
                format!(
                    "Customer requested cancellation. Reason: {}",
                    reason.label()
                ),
                Actor::customer(user_id),
            )
            .await?;
        txn.commit().await?;

        info!(%order_id, request_id = %request.id, %reason, "Cancellation requested");
        self.emit(Event::CancellationRequested {
            order_id: request.order_id.clone(),
            request_id: request.id,
        })
        .await;
        Ok(request)
    }

    /// Approves a pending request, refunds through the gateway and then
    /// cancels with the carrier.
    #[instrument(skip(self, capability, req), fields(reviewer = capability.reviewer()))]
    pub async fn process_refund(
        &self,
        capability: &AdminCapability,
        request_id: Uuid,
        req: ProcessRefundRequest,
    ) -> Result<RefundSettlement, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let request = lock_request(&txn, request_id).await?;
        require_pending(&request)?;
        let order = lock_order(&txn, &request.order_id).await?;

        let amounts = resolve_settlement_amounts(
            request.refund_amount,
            request.gateway_fee_deduction,
            request.platform_fee_deduction,
            &req.overrides(),
            self.refund_tolerance,
        )?;

        let refund_plan = if !req.process_refund {
            None
        } else if amounts.final_refund_amount.is_zero() {
            Some(None)
        } else {
            let payment_id = order.gateway_payment_id.clone().ok_or_else(|| {
                ServiceError::RefundFailed(format!(
                    "Order {} has no captured payment to refund",
                    order.id
                ))
            })?;
            Some(Some(payment_id))
        };

        let now = Utc::now();
        let mut active: order_cancellation_request::ActiveModel = request.into();
        active.request_status = Set(RequestStatus::Approved);
        active.gateway_fee_deduction = Set(amounts.gateway_fee_deduction);
        active.platform_fee_deduction = Set(amounts.platform_fee_deduction);
        active.final_refund_amount = Set(amounts.final_refund_amount);
        active.reviewed_by = Set(Some(capability.reviewer().to_string()));
        active.reviewed_at = Set(Some(now));
        active.admin_notes = Set(req
            .admin_notes
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string));
        let request = active.update(&txn).await?;

        let (request, refund) = match refund_plan {
            None => (request, RefundOutcome::NotRequested),
            Some(None) => (
                request,
                RefundOutcome::Skipped {
                    reason: "Final refund amount is zero".to_string(),
                },
            ),
            Some(Some(payment_id)) => {
                let amount_minor = to_minor_units(amounts.final_refund_amount)?;
                let mut notes = Notes::new();
                notes.insert("order_id".to_string(), order.id.clone());
                notes.insert("cancellation_request_id".to_string(), request.id.to_string());
                notes.insert("reason".to_string(), request.reason.label().to_string());
                notes.insert("processed_by".to_string(), capability.reviewer().to_string());

                let gateway_refund = match self
                    .gateway
                    .refund(&payment_id, amount_minor, notes)
                    .await
                {
                    Ok(refund) => refund,
                    Err(e) => {
                        REFUND_FAILURES.inc();
                        error!(order_id = %order.id, %request_id, error = %e, "Gateway refund failed, approval rolled back");
                        return Err(match e {
                            ServiceError::RefundFailed(msg) => ServiceError::RefundFailed(msg),
                            other => ServiceError::RefundFailed(other.to_string()),
                        });
                    }
                };

                let mut active: order_cancellation_request::ActiveModel = request.into();
                active.request_status = Set(RequestStatus::RefundProcessed);
                active.gateway_refund_id = Set(Some(gateway_refund.refund_id.clone()));
                active.refund_processed_at = Set(Some(Utc::now()));
                let request = active.update(&txn).await?;

                let mut order_active: order::ActiveModel = order.into();
                order_active.payment_status = Set(PaymentStatus::Refunded);
                let order = order_active.update(&txn).await?;

                self.state_machine
                    .record(
                        &txn,
                        &order,
                        "Refund Processed",
                        format!(
                            "Refund of ₹{:.2} processed successfully. Refund ID: {}",
                            amounts.final_refund_amount, gateway_refund.refund_id
                        ),
                        Actor::admin(),
                    )
                    .await?;
                (
                    request,
                    RefundOutcome::Processed {
                        refund_id: gateway_refund.refund_id,
                        amount: amounts.final_refund_amount,
                    },
                )
            }
        };
        txn.commit().await?;

        info!(order_id = %request.order_id, %request_id, "Cancellation request approved");
        self.emit(Event::CancellationApproved {
            order_id: request.order_id.clone(),
            request_id,
            final_refund_amount: request.final_refund_amount,
        })
        .await;
        if let RefundOutcome::Processed { refund_id, amount } = &refund {
            REFUNDS_PROCESSED.inc();
            info!(order_id = %request.order_id, %request_id, %refund_id, %amount, "Refund processed");
            self.emit(Event::RefundProcessed {
                order_id: request.order_id.clone(),
                refund_id: refund_id.clone(),
                amount: *amount,
            })
            .await;
        }

        let carrier = if req.cancel_in_carrier {
            self.cancel_with_carrier(&request).await?
        } else {
            CarrierOutcome::NotRequested
        };

        let request = CancellationRequestEntity::find_by_id(request_id)
            .one(&*self.db_pool)
            .await?
            .unwrap_or(request);
        let order_status = find_order(&*self.db_pool, &request.order_id).await?.status;
        Ok(RefundSettlement {
            request,
            order_status,
            refund,
            carrier,
        })
    }

    async fn cancel_locally(
        &self,
        order_id: &str,
        actor: Actor,
        note: &str,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, order_id).await?;
        let old_status = order.status;
        let updated = self
            .state_machine
            .transition(&txn, order, OrderStatus::Cancelled, actor, Some(note))
            .await?;
        txn.commit().await?;
        self.emit(Event::OrderStatusChanged {
            order_id: order_id.to_string(),
            old_status,
            new_status: OrderStatus::Cancelled,
        })
        .await;
        Ok(updated)
    }

    /// Phase two of the saga. Never undoes a committed refund.
    async fn cancel_with_carrier(
        &self,
        request: &order_cancellation_request::Model,
    ) -> Result<CarrierOutcome, ServiceError> {
        let order = find_order(&*self.db_pool, &request.order_id).await?;
        if !can_transition(order.status, OrderStatus::Cancelled) {
            return Ok(CarrierOutcome::Skipped {
                reason: format!("Order is already {}", order.status),
            });
        }

        let Some(carrier_order_id) = order.carrier_order_id.clone() else {
            self.cancel_locally(&order.id, Actor::admin(), "No shipment was created")
                .await?;
            return Ok(CarrierOutcome::NoShipment);
        };

        let failure = match self.carrier.cancel(&[carrier_order_id.clone()]).await {
            Ok(result) if result.success => {
                let txn = self.db_pool.begin().await?;
                let locked_request = lock_request(&txn, request.id).await?;
                let mut active: order_cancellation_request::ActiveModel = locked_request.into();
                active.carrier_cancelled = Set(true);
                active.carrier_response = Set(Some(result.message.clone()));
                active.update(&txn).await?;

                let locked_order = lock_order(&txn, &order.id).await?;
                let old_status = locked_order.status;
                self.state_machine
                    .transition(
                        &txn,
                        locked_order,
                        OrderStatus::Cancelled,
                        Actor::admin(),
                        Some("Order cancelled in carrier system"),
                    )
                    .await?;
                txn.commit().await?;

                info!(order_id = %order.id, %carrier_order_id, "Carrier cancellation succeeded");
                self.emit(Event::OrderStatusChanged {
                    order_id: order.id.clone(),
                    old_status,
                    new_status: OrderStatus::Cancelled,
                })
                .await;
                return Ok(CarrierOutcome::Cancelled {
                    message: result.message,
                });
            }
            Ok(result) => result.message,
            Err(e) => e.to_string(),
        };

        CARRIER_CANCELLATION_FAILURES.inc();
        error!(order_id = %order.id, %carrier_order_id, reason = %failure, "Carrier cancellation failed, order left for operator retry");

        let txn = self.db_pool.begin().await?;
        let locked_request = lock_request(&txn, request.id).await?;
        let mut active: order_cancellation_request::ActiveModel = locked_request.into();
        active.carrier_response = Set(Some(failure.clone()));
        active.update(&txn).await?;
        txn.commit().await?;

        self.emit(Event::CarrierCancellationFailed {
            order_id: order.id.clone(),
            reason: failure.clone(),
            at: Utc::now(),
        })
        .await;
        Ok(CarrierOutcome::Failed { reason: failure })
    }

    #[instrument(skip(self, capability), fields(reviewer = capability.reviewer()))]
    pub async fn reject_request(
        &self,
        capability: &AdminCapability,
        request_id: Uuid,
        admin_notes: &str,
    ) -> Result<order_cancellation_request::Model, ServiceError> {
        let notes = admin_notes.trim();
        if notes.is_empty() {
            return Err(ServiceError::ValidationError(
                "Admin notes are required when rejecting a request".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let request = lock_request(&txn, request_id).await?;
        require_pending(&request)?;
        let order = lock_order(&txn, &request.order_id).await?;

        let mut active: order_cancellation_request::ActiveModel = request.into();
        active.request_status = Set(RequestStatus::Rejected);
        active.admin_notes = Set(Some(notes.to_string()));
        active.reviewed_by = Set(Some(capability.reviewer().to_string()));
        active.reviewed_at = Set(Some(Utc::now()));
        let request = active.update(&txn).await?;

        self.state_machine
            .record(
                &txn,
                &order,
                "Cancellation Request Rejected",
                format!("Cancellation request rejected by admin. Reason: {}", notes),
                Actor::admin(),
            )
            .await?;
        txn.commit().await?;

        info!(order_id = %request.order_id, %request_id, "Cancellation request rejected");
        self.emit(Event::CancellationRejected {
            order_id: request.order_id.clone(),
            request_id,
        })
        .await;
        Ok(request)
    }

    /// Manual retry of a failed carrier cancellation.
    #[instrument(skip(self, capability), fields(reviewer = capability.reviewer()))]
    pub async fn retry_carrier_cancellation(
        &self,
        capability: &AdminCapability,
        request_id: Uuid,
    ) -> Result<CarrierOutcome, ServiceError> {
        let request = CancellationRequestEntity::find_by_id(request_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cancellation request {} not found", request_id))
            })?;
        let settled = matches!(
            request.request_status,
            RequestStatus::RefundProcessed | RequestStatus::Approved
        );
        if !settled || request.carrier_cancelled {
            return Err(ServiceError::InvalidRequestState(format!(
                "Cancellation request {} has no pending carrier cancellation",
                request_id
            )));
        }
        self.cancel_with_carrier(&request).await
    }

    pub async fn cancellation_stats(
        &self,
        _capability: &AdminCapability,
    ) -> Result<CancellationStats, ServiceError> {
        let db = &*self.db_pool;
        let count = |status: RequestStatus| {
            CancellationRequestEntity::find()
                .filter(order_cancellation_request::Column::RequestStatus.eq(status))
                .count(db)
        };

        let pending = count(RequestStatus::Pending).await?;
        let approved = count(RequestStatus::Approved).await?;
        let rejected = count(RequestStatus::Rejected).await?;
        let refund_processed = count(RequestStatus::RefundProcessed).await?;
        let total_refunded: Decimal = CancellationRequestEntity::find()
            .filter(
                order_cancellation_request::Column::RequestStatus
                    .eq(RequestStatus::RefundProcessed),
            )
            .all(db)
            .await?
            .iter()
            .map(|r| r.final_refund_amount)
            .sum();

        Ok(CancellationStats {
            pending,
            approved,
            rejected,
            refund_processed,
            total: pending + approved + rejected + refund_processed,
            total_refunded,
        })
    }

    pub async fn get_request(
        &self,
        order_id: &str,
    ) -> Result<Option<order_cancellation_request::Model>, ServiceError> {
        Ok(CancellationRequestEntity::find()
            .filter(order_cancellation_request::Column::OrderId.eq(order_id))
            .one(&*self.db_pool)
            .await?)
    }

    /// Customer cancellation without an admin review. The carrier call is
    /// advisory; the local cancellation and optional refund record commit
    /// together.
    #[instrument(skip(self, req))]
    pub async fn direct_cancel(
        &self,
        order_id: &str,
        user_id: Uuid,
        req: DirectCancelRequest,
    ) -> Result<DirectCancelOutcome, ServiceError> {
        req.validate()?;
        let reason = req.reason.trim().to_string();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError("Reason is required".to_string()));
        }

        let order = self.owned_order(order_id, user_id).await?;
        if !order.can_be_cancelled() {
            return Err(ServiceError::ValidationError(format!(
                "Orders that are {} cannot be cancelled",
                order.status
            )));
        }

        let carrier = match order.carrier_order_id.clone() {
            None => CarrierOutcome::NoShipment,
            Some(carrier_order_id) => match self.carrier.cancel(&[carrier_order_id.clone()]).await {
                Ok(result) if result.success => CarrierOutcome::Cancelled {
                    message: result.message,
                },
                Ok(result) => {
                    warn!(%order_id, %carrier_order_id, message = %result.message, "Carrier refused cancellation, cancelling locally");
                    CarrierOutcome::Failed {
                        reason: result.message,
                    }
                }
                Err(e) => {
                    warn!(%order_id, %carrier_order_id, error = %e, "Carrier unavailable, cancelling locally");
                    CarrierOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            },
        };
        if matches!(carrier, CarrierOutcome::Failed { .. }) {
            CARRIER_CANCELLATION_FAILURES.inc();
        }

        let txn = self.db_pool.begin().await?;
        let locked = lock_order(&txn, order_id).await?;
        if !locked.can_be_cancelled() {
            return Err(ServiceError::ValidationError(format!(
                "Orders that are {} cannot be cancelled",
                locked.status
            )));
        }

        let note = match &carrier {
            CarrierOutcome::Cancelled { message } => {
                format!("Reason: {} | Carrier: {}", reason, message)
            }
            CarrierOutcome::Failed { .. } => format!(
                "Reason: {} | Carrier cancellation failed but order cancelled locally",
                reason
            ),
            _ => format!("Reason: {}", reason),
        };
        let old_status = locked.status;
        let cancelled = self
            .state_machine
            .transition(
                &txn,
                locked,
                OrderStatus::Cancelled,
                Actor::customer(user_id),
                Some(note.as_str()),
            )
            .await?;

        let refund = if req.refund_required && cancelled.payment_status == PaymentStatus::Completed
        {
            let processing_fee = cancelled.gateway_fee;
            let record = order_refund::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(cancelled.id.clone()),
                refund_type: Set("full".to_string()),
                refund_status: Set(RefundStatus::Initiated),
                refund_amount: Set(cancelled.total_amount),
                processing_fee: Set(processing_fee),
                final_refund_amount: Set(round_money(
                    (cancelled.total_amount - processing_fee).max(Decimal::ZERO),
                )),
                reason: Set(reason.clone()),
                estimated_refund_days: Set(DIRECT_REFUND_ESTIMATE.to_string()),
                initiated_by: Set(Some(user_id)),
                initiated_at: Set(Utc::now()),
                completed_at: Set(None),
            };
            Some(record.insert(&txn).await?)
        } else {
            None
        };
        txn.commit().await?;

        info!(%order_id, refund = refund.is_some(), "Order cancelled by customer");
        self.emit(Event::OrderStatusChanged {
            order_id: order_id.to_string(),
            old_status,
            new_status: OrderStatus::Cancelled,
        })
        .await;
        Ok(DirectCancelOutcome {
            order: cancelled,
            carrier,
            refund,
        })
    }
}
