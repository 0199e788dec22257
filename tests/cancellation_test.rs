mod common;

use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use common::{CarrierEligibilityMode, TestContext};
use farmgate_settlement::entities::order::{self, OrderStatus, PaymentMethod, PaymentStatus};
use farmgate_settlement::entities::order_cancellation_request::{ReasonCode, RequestStatus};
use farmgate_settlement::entities::order_refund::RefundStatus;
use farmgate_settlement::errors::ServiceError;
use farmgate_settlement::services::cancellation::{
    CarrierOutcome, CreateCancellationRequest, DirectCancelRequest, ProcessRefundRequest,
    RefundOutcome,
};
use farmgate_settlement::services::shipments::DataSource;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

fn request(reason: &str) -> CreateCancellationRequest {
    CreateCancellationRequest {
        reason: reason.to_string(),
        description: Some("Ordered the wrong variety".to_string()),
    }
}

async fn set_fees(ctx: &TestContext, order: &order::Model, total: Decimal, gateway: Decimal, platform: Decimal) {
    let mut active: order::ActiveModel = order.clone().into();
    active.total_amount = Set(total);
    active.gateway_fee = Set(gateway);
    active.platform_fee = Set(platform);
    active.update(&*ctx.db).await.unwrap();
}

#[tokio::test]
async fn eligibility_follows_local_rules() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(100.00), dec!(20)).await;
    let engine = &ctx.services.cancellations;

    let cod = ctx
        .place_order(user, address, product, dec!(1), PaymentMethod::Cod)
        .await
        .unwrap();
    let verdict = engine.check_eligibility(&cod.id, user).await.unwrap();
    assert!(!verdict.eligible);
    assert!(verdict.reason.unwrap().contains("Cash on Delivery"));

    let unpaid = ctx
        .place_order(user, address, product, dec!(1), PaymentMethod::Upi)
        .await
        .unwrap();
    assert!(!engine.check_eligibility(&unpaid.id, user).await.unwrap().eligible);

    let paid = ctx.pay(&unpaid.id).await;
    let verdict = engine.check_eligibility(&paid.id, user).await.unwrap();
    assert!(verdict.eligible);
    assert_eq!(verdict.source, DataSource::Local);

    assert_matches!(
        engine.check_eligibility(&paid.id, Uuid::new_v4()).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn carrier_decides_pickups_and_outages_fall_back() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    ctx.services
        .shipments
        .create_shipment(&order.id, None)
        .await
        .unwrap();
    let engine = &ctx.services.cancellations;

    ctx.carrier.set_eligibility(CarrierEligibilityMode::PickupScheduled);
    let verdict = engine.check_eligibility(&order.id, user).await.unwrap();
    assert!(!verdict.eligible);
    assert_eq!(verdict.source, DataSource::Carrier);
    assert_eq!(verdict.pickup_scheduled_date.as_deref(), Some("2026-10-20"));
    assert_matches!(
        engine.create_request(&order.id, user, request("Changed my mind")).await,
        Err(ServiceError::ValidationError(_))
    );

    ctx.carrier.set_eligibility(CarrierEligibilityMode::Unavailable);
    let verdict = engine.check_eligibility(&order.id, user).await.unwrap();
    assert!(verdict.eligible);
    assert_eq!(verdict.source, DataSource::Fallback);
    assert!(verdict.reason.unwrap().contains("Could not verify pickup status"));
}

#[tokio::test]
async fn request_snapshots_order_amounts_once() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    let engine = &ctx.services.cancellations;

    let created = engine
        .create_request(&order.id, user, request("ordered by mistake"))
        .await
        .unwrap();
    assert_eq!(created.reason, ReasonCode::OrderedByMistake);
    assert_eq!(created.request_status, RequestStatus::Pending);
    assert_eq!(created.refund_amount, dec!(1020.00));
    assert_eq!(created.platform_fee_deduction, dec!(20.00));
    assert_eq!(created.gateway_fee_deduction, Decimal::ZERO);
    assert_eq!(created.final_refund_amount, dec!(1000.00));
    assert_eq!(ctx.history(&order.id).await.last().unwrap().title, "Cancellation Requested");

    assert_matches!(
        engine.create_request(&order.id, user, request("Changed my mind")).await,
        Err(ServiceError::Conflict(_))
    );
    assert!(!engine.check_eligibility(&order.id, user).await.unwrap().eligible);
}

#[tokio::test]
async fn unknown_reason_is_rejected_before_anything_is_written() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    let history_before = ctx.history(&order.id).await.len();

    let result = ctx
        .services
        .cancellations
        .create_request(&order.id, user, request("the moon is full"))
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(msg)) if msg.contains("Duplicate order"));
    assert!(ctx.services.cancellations.get_request(&order.id).await.unwrap().is_none());
    assert_eq!(ctx.history(&order.id).await.len(), history_before);
}

#[tokio::test]
async fn request_is_refused_when_order_is_cancelled_mid_check() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    ctx.services
        .shipments
        .create_shipment(&order.id, None)
        .await
        .unwrap();
    let history_before = ctx.history(&order.id).await.len();
    *ctx.carrier.cancel_during_check.lock().unwrap() = Some((ctx.db.clone(), order.id.clone()));

    let result = ctx
        .services
        .cancellations
        .create_request(&order.id, user, request("Changed my mind"))
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(msg)) if msg.contains("Orders that are cancelled"));
    assert!(ctx.services.cancellations.get_request(&order.id).await.unwrap().is_none());
    assert_eq!(ctx.history(&order.id).await.len(), history_before);
}

#[tokio::test]
async fn inconsistent_final_amount_override_is_rejected() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    set_fees(&ctx, &order, dec!(500.00), dec!(10.00), dec!(5.00)).await;
    let engine = &ctx.services.cancellations;

    let created = engine
        .create_request(&order.id, user, request("Found a better price"))
        .await
        .unwrap();
    assert_eq!(created.final_refund_amount, dec!(485.00));

    let result = engine
        .process_refund(
            &ctx.admin,
            created.id,
            ProcessRefundRequest {
                final_refund_amount: Some(dec!(490.00)),
                ..Default::default()
            },
        )
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert_eq!(ctx.gateway.refund_calls.load(Ordering::SeqCst), 0);
    let unchanged = engine.get_request(&order.id).await.unwrap().unwrap();
    assert_eq!(unchanged, created);
}

#[tokio::test]
async fn failed_refund_leaves_request_and_order_untouched() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, product) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    ctx.services
        .shipments
        .create_shipment(&order.id, None)
        .await
        .unwrap();
    let engine = &ctx.services.cancellations;
    let created = engine
        .create_request(&order.id, user, request("changed_mind"))
        .await
        .unwrap();
    let order_before = ctx.order(&order.id).await;
    let history_before = ctx.history(&order.id).await;
    ctx.gateway.fail_refunds.store(true, Ordering::SeqCst);

    let result = engine
        .process_refund(&ctx.admin, created.id, ProcessRefundRequest::default())
        .await;

    assert_matches!(result, Err(ServiceError::RefundFailed(_)));
    assert_eq!(ctx.gateway.refund_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.carrier.cancel_calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_request(&order.id).await.unwrap().unwrap(), created);
    assert_eq!(ctx.history(&order.id).await, history_before);
    let order_after = ctx.order(&order.id).await;
    assert_eq!(order_after.status, order_before.status);
    assert_eq!(order_after.payment_status, PaymentStatus::Completed);
    assert_eq!(ctx.product(product).await.quantity_available, dec!(96));

    // the request is still pending and can be settled once the gateway recovers
    ctx.gateway.fail_refunds.store(false, Ordering::SeqCst);
    let settled = engine
        .process_refund(&ctx.admin, created.id, ProcessRefundRequest::default())
        .await
        .unwrap();
    assert_matches!(settled.refund, RefundOutcome::Processed { .. });
}

#[tokio::test]
async fn approval_refunds_then_cancels_with_carrier() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, product) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    ctx.services
        .shipments
        .create_shipment(&order.id, Some("24".into()))
        .await
        .unwrap();
    let engine = &ctx.services.cancellations;
    let created = engine
        .create_request(&order.id, user, request("Delivery time is too long"))
        .await
        .unwrap();

    let settlement = engine
        .process_refund(
            &ctx.admin,
            created.id,
            ProcessRefundRequest {
                admin_notes: Some("Approved per policy".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_matches!(
        &settlement.refund,
        RefundOutcome::Processed { amount, .. } if *amount == dec!(1000.00)
    );
    assert_matches!(settlement.carrier, CarrierOutcome::Cancelled { .. });
    assert_eq!(settlement.order_status, OrderStatus::Cancelled);
    assert_eq!(settlement.request.request_status, RequestStatus::RefundProcessed);
    assert!(settlement.request.carrier_cancelled);
    assert!(settlement.request.gateway_refund_id.is_some());
    assert_eq!(settlement.request.reviewed_by.as_deref(), Some("ops@farmgate"));
    assert_eq!(settlement.request.admin_notes.as_deref(), Some("Approved per policy"));

    let refunds = ctx.gateway.refunds.lock().unwrap().clone();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].1, 100_000);

    let order = ctx.order(&order.id).await;
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert_eq!(ctx.product(product).await.quantity_available, dec!(100));

    let titles: Vec<String> = ctx.history(&order.id).await.into_iter().map(|h| h.title).collect();
    let refund_at = titles.iter().position(|t| t == "Refund Processed").unwrap();
    let cancel_at = titles.iter().position(|t| t == "Order Cancelled").unwrap();
    assert!(refund_at < cancel_at);

    assert_matches!(
        engine
            .process_refund(&ctx.admin, created.id, ProcessRefundRequest::default())
            .await,
        Err(ServiceError::InvalidRequestState(_))
    );
    assert_eq!(ctx.gateway.refund_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn carrier_failure_keeps_refund_and_allows_retry() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, product) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    ctx.services
        .shipments
        .create_shipment(&order.id, None)
        .await
        .unwrap();
    let engine = &ctx.services.cancellations;
    let created = engine
        .create_request(&order.id, user, request("Payment issue"))
        .await
        .unwrap();
    ctx.carrier.fail_cancel.store(true, Ordering::SeqCst);

    let settlement = engine
        .process_refund(&ctx.admin, created.id, ProcessRefundRequest::default())
        .await
        .unwrap();

    assert_matches!(settlement.refund, RefundOutcome::Processed { .. });
    assert_matches!(settlement.carrier, CarrierOutcome::Failed { .. });
    assert_eq!(settlement.order_status, OrderStatus::Confirmed);
    assert_eq!(settlement.request.request_status, RequestStatus::RefundProcessed);
    assert!(!settlement.request.carrier_cancelled);
    assert!(settlement.request.carrier_response.is_some());
    assert_eq!(ctx.order(&order.id).await.payment_status, PaymentStatus::Refunded);
    assert_eq!(ctx.product(product).await.quantity_available, dec!(96));

    ctx.carrier.fail_cancel.store(false, Ordering::SeqCst);
    let retried = engine
        .retry_carrier_cancellation(&ctx.admin, created.id)
        .await
        .unwrap();
    assert_matches!(retried, CarrierOutcome::Cancelled { .. });
    assert_eq!(ctx.order(&order.id).await.status, OrderStatus::Cancelled);
    assert_eq!(ctx.product(product).await.quantity_available, dec!(100));
    assert_eq!(ctx.gateway.refund_calls.load(Ordering::SeqCst), 1);

    assert_matches!(
        engine.retry_carrier_cancellation(&ctx.admin, created.id).await,
        Err(ServiceError::InvalidRequestState(_))
    );
}

#[tokio::test]
async fn order_without_shipment_is_cancelled_locally() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    let engine = &ctx.services.cancellations;
    let created = engine
        .create_request(&order.id, user, request("Duplicate order"))
        .await
        .unwrap();

    let settlement = engine
        .process_refund(&ctx.admin, created.id, ProcessRefundRequest::default())
        .await
        .unwrap();

    assert_eq!(settlement.carrier, CarrierOutcome::NoShipment);
    assert_eq!(settlement.order_status, OrderStatus::Cancelled);
    assert_eq!(ctx.carrier.cancel_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn approval_without_refund_leaves_request_approved() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    let engine = &ctx.services.cancellations;
    let created = engine
        .create_request(&order.id, user, request("Other"))
        .await
        .unwrap();

    let settlement = engine
        .process_refund(
            &ctx.admin,
            created.id,
            ProcessRefundRequest {
                process_refund: false,
                cancel_in_carrier: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(settlement.refund, RefundOutcome::NotRequested);
    assert_eq!(settlement.carrier, CarrierOutcome::NotRequested);
    assert_eq!(settlement.request.request_status, RequestStatus::Approved);
    assert_eq!(settlement.order_status, OrderStatus::Confirmed);
    assert_eq!(ctx.gateway.refund_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejection_requires_notes_and_happens_once() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    let engine = &ctx.services.cancellations;
    let created = engine
        .create_request(&order.id, user, request("Changed my mind"))
        .await
        .unwrap();

    assert_matches!(
        engine.reject_request(&ctx.admin, created.id, "  ").await,
        Err(ServiceError::ValidationError(_))
    );

    let rejected = engine
        .reject_request(&ctx.admin, created.id, "Already packed")
        .await
        .unwrap();
    assert_eq!(rejected.request_status, RequestStatus::Rejected);
    assert_eq!(rejected.admin_notes.as_deref(), Some("Already packed"));
    let last = ctx.history(&order.id).await.pop().unwrap();
    assert_eq!(last.title, "Cancellation Request Rejected");
    assert!(last.message.ends_with("Reason: Already packed"));

    assert_matches!(
        engine.reject_request(&ctx.admin, created.id, "again").await,
        Err(ServiceError::InvalidRequestState(_))
    );
    assert_matches!(
        engine
            .process_refund(&ctx.admin, created.id, ProcessRefundRequest::default())
            .await,
        Err(ServiceError::InvalidRequestState(_))
    );
    assert_eq!(ctx.order(&order.id).await.status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn stats_count_requests_by_status() {
    let ctx = TestContext::new().await;
    let engine = &ctx.services.cancellations;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let user = Uuid::new_v4();
        let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
        ids.push(
            engine
                .create_request(&order.id, user, request("Changed my mind"))
                .await
                .unwrap()
                .id,
        );
    }
    engine
        .process_refund(&ctx.admin, ids[0], ProcessRefundRequest::default())
        .await
        .unwrap();
    engine
        .reject_request(&ctx.admin, ids[1], "Out of policy")
        .await
        .unwrap();

    let stats = engine.cancellation_stats(&ctx.admin).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.refund_processed, 1);
    assert_eq!(stats.approved, 0);
    assert_eq!(stats.total, 3);
    assert_eq!(stats.total_refunded, dec!(1000.00));
}

#[tokio::test]
async fn direct_cancel_records_refund_and_restores_stock() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, product) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    set_fees(&ctx, &order, dec!(1020.00), dec!(20.40), dec!(20.00)).await;

    let outcome = ctx
        .services
        .cancellations
        .direct_cancel(
            &order.id,
            user,
            DirectCancelRequest {
                reason: "No longer needed".into(),
                refund_required: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    assert_eq!(outcome.carrier, CarrierOutcome::NoShipment);
    let refund = outcome.refund.unwrap();
    assert_eq!(refund.refund_type, "full");
    assert_eq!(refund.refund_status, RefundStatus::Initiated);
    assert_eq!(refund.refund_amount, dec!(1020.00));
    assert_eq!(refund.processing_fee, dec!(20.40));
    assert_eq!(refund.final_refund_amount, dec!(999.60));
    assert_eq!(refund.estimated_refund_days, "5-7 business days");
    assert_eq!(ctx.product(product).await.quantity_available, dec!(100));

    let last = ctx.history(&order.id).await.pop().unwrap();
    assert_eq!(last.status, OrderStatus::Cancelled);
    assert!(last.message.contains("No longer needed"));
}

#[tokio::test]
async fn direct_cancel_survives_carrier_outage() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, _) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    ctx.services
        .shipments
        .create_shipment(&order.id, None)
        .await
        .unwrap();
    ctx.carrier.fail_cancel.store(true, Ordering::SeqCst);

    let outcome = ctx
        .services
        .cancellations
        .direct_cancel(
            &order.id,
            user,
            DirectCancelRequest {
                reason: "Changed plans".into(),
                refund_required: false,
            },
        )
        .await
        .unwrap();

    assert_matches!(outcome.carrier, CarrierOutcome::Failed { .. });
    assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    assert!(outcome.refund.is_none());
    assert!(ctx
        .history(&order.id)
        .await
        .pop()
        .unwrap()
        .message
        .contains("cancelled locally"));

    assert_matches!(
        ctx.services
            .cancellations
            .direct_cancel(
                &order.id,
                user,
                DirectCancelRequest {
                    reason: "again".into(),
                    refund_required: false,
                },
            )
            .await,
        Err(ServiceError::ValidationError(_))
    );
}
