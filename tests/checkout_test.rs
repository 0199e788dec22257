mod common;

use assert_matches::assert_matches;
use common::{FakeGateway, TestContext};
use farmgate_settlement::entities::order::{OrderStatus, PaymentMethod, PaymentStatus};
use farmgate_settlement::errors::ServiceError;
use farmgate_settlement::services::cancellation::{
    CreateCancellationRequest, ProcessRefundRequest,
};
use farmgate_settlement::services::orders::{
    OrderLineRequest, PlaceOrderRequest, UpdateItemQuantityRequest,
};
use farmgate_settlement::services::payments::ConfirmPaymentRequest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn upi_order_above_threshold_ships_free_with_platform_fee() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(250.00), dec!(10)).await;

    let order = ctx
        .place_order(user, address, product, dec!(4), PaymentMethod::Upi)
        .await
        .unwrap();

    assert_eq!(order.subtotal, dec!(1000.00));
    assert_eq!(order.shipping_charges, Decimal::ZERO);
    assert_eq!(order.platform_fee, dec!(20.00));
    assert_eq!(order.total_amount, dec!(1020.00));
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert!(order.id.starts_with("KC"));
    assert_eq!(ctx.product(product).await.quantity_available, dec!(6));

    let history = ctx.history(&order.id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].title, "Payment Pending");
}

#[tokio::test]
async fn cod_order_is_confirmed_without_fees() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(120.00), dec!(10)).await;

    let order = ctx
        .place_order(user, address, product, dec!(2), PaymentMethod::Cod)
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.shipping_charges, dec!(50.00));
    assert_eq!(order.platform_fee, Decimal::ZERO);
    assert_eq!(order.gateway_fee, Decimal::ZERO);
    assert_eq!(order.total_amount, dec!(290.00));
    assert_eq!(ctx.history(&order.id).await[0].title, "Order Placed");
}

#[tokio::test]
async fn concurrent_checkouts_cannot_oversell() {
    let ctx = TestContext::with_pool_size(4).await;
    let product = ctx.seed_product(dec!(100.00), dec!(5)).await;
    let (first_user, second_user) = (Uuid::new_v4(), Uuid::new_v4());
    let first_address = ctx.seed_address(first_user).await;
    let second_address = ctx.seed_address(second_user).await;

    let (first, second) = tokio::join!(
        ctx.place_order(first_user, first_address, product, dec!(3), PaymentMethod::Upi),
        ctx.place_order(second_user, second_address, product, dec!(3), PaymentMethod::Upi),
    );

    // SQLite may turn the losing writer away with a busy error before the
    // stock guard runs.
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(
        r,
        Err(ServiceError::InsufficientStock(_)) | Err(ServiceError::DatabaseError(_))
    )));
    assert_eq!(ctx.product(product).await.quantity_available, dec!(2));
}

#[tokio::test]
async fn short_stock_leaves_nothing_behind() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(80.00), dec!(1)).await;

    let result = ctx
        .place_order(user, address, product, dec!(2), PaymentMethod::Card)
        .await;

    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(ctx.product(product).await.quantity_available, dec!(1));
}

#[tokio::test]
async fn foreign_address_is_forbidden() {
    let ctx = TestContext::new().await;
    let address = ctx.seed_address(Uuid::new_v4()).await;
    let product = ctx.seed_product(dec!(80.00), dec!(5)).await;

    let result = ctx
        .place_order(Uuid::new_v4(), address, product, dec!(1), PaymentMethod::Upi)
        .await;

    assert_matches!(result, Err(ServiceError::Forbidden(_)));
    assert_eq!(ctx.product(product).await.quantity_available, dec!(5));
}

#[tokio::test]
async fn quantity_edits_move_stock_once_and_recompute_totals() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(100.00), dec!(20)).await;
    let order = ctx
        .place_order(user, address, product, dec!(2), PaymentMethod::Upi)
        .await
        .unwrap();
    let item = ctx.services.checkout.list_items(&order.id).await.unwrap()[0].clone();

    let grown = ctx
        .services
        .checkout
        .update_item_quantity(&order.id, item.id, UpdateItemQuantityRequest { quantity: dec!(7) })
        .await
        .unwrap();
    assert_eq!(ctx.product(product).await.quantity_available, dec!(13));
    assert_eq!(grown.order.subtotal, dec!(700.00));
    assert_eq!(grown.order.shipping_charges, Decimal::ZERO);

    let shrunk = ctx
        .services
        .checkout
        .update_item_quantity(&order.id, item.id, UpdateItemQuantityRequest { quantity: dec!(1) })
        .await
        .unwrap();
    assert_eq!(ctx.product(product).await.quantity_available, dec!(19));
    assert_eq!(shrunk.order.subtotal, dec!(100.00));
    assert_eq!(shrunk.order.shipping_charges, dec!(50.00));
    assert_eq!(shrunk.order.total_amount, dec!(153.00));

    let too_many = ctx
        .services
        .checkout
        .update_item_quantity(&order.id, item.id, UpdateItemQuantityRequest { quantity: dec!(50) })
        .await;
    assert_matches!(too_many, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(ctx.product(product).await.quantity_available, dec!(19));
}

#[tokio::test]
async fn paid_order_lines_are_frozen() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let (order, product) = ctx.paid_order(user, dec!(250.00), dec!(4)).await;
    let item = ctx.services.checkout.list_items(&order.id).await.unwrap()[0].clone();

    let result = ctx
        .services
        .checkout
        .update_item_quantity(&order.id, item.id, UpdateItemQuantityRequest { quantity: dec!(8) })
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert_eq!(ctx.order(&order.id).await.total_amount, dec!(1020.00));
    assert_eq!(ctx.product(product).await.quantity_available, dec!(96));

    let engine = &ctx.services.cancellations;
    let created = engine
        .create_request(
            &order.id,
            user,
            CreateCancellationRequest {
                reason: "Changed my mind".into(),
                description: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(created.refund_amount, dec!(1020.00));
    engine
        .process_refund(&ctx.admin, created.id, ProcessRefundRequest::default())
        .await
        .unwrap();
    let refunds = ctx.gateway.refunds.lock().unwrap().clone();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].1, 100_000);
}

#[tokio::test]
async fn lines_are_frozen_once_gateway_order_exists() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(250.00), dec!(20)).await;
    let order = ctx
        .place_order(user, address, product, dec!(4), PaymentMethod::Upi)
        .await
        .unwrap();
    let item = ctx.services.checkout.list_items(&order.id).await.unwrap()[0].clone();
    let gateway_order = ctx.services.payments.initiate_payment(&order.id).await.unwrap();

    let edit = ctx
        .services
        .checkout
        .update_item_quantity(&order.id, item.id, UpdateItemQuantityRequest { quantity: dec!(2) })
        .await;
    assert_matches!(edit, Err(ServiceError::ValidationError(_)));

    let payment_id = FakeGateway::payment_id_for(&gateway_order.gateway_order_id);
    let signature = FakeGateway::checkout_signature(&gateway_order.gateway_order_id, &payment_id);
    let confirmed = ctx
        .services
        .payments
        .confirm_payment(
            &order.id,
            ConfirmPaymentRequest {
                gateway_order_id: gateway_order.gateway_order_id,
                payment_id,
                signature,
            },
        )
        .await
        .unwrap();
    assert_eq!(confirmed.status, OrderStatus::Confirmed);
    assert_eq!(confirmed.total_amount, dec!(1020.00));
}

#[tokio::test]
async fn repeated_lines_reserve_their_combined_quantity() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let mangoes = ctx.seed_product(dec!(100.00), dec!(10)).await;
    let onions = ctx.seed_product(dec!(40.00), dec!(10)).await;
    let line = |product_id, quantity| OrderLineRequest {
        product_id,
        quantity,
    };

    let placed = ctx
        .services
        .checkout
        .place_order(
            user,
            PlaceOrderRequest {
                delivery_address_id: address,
                payment_method: PaymentMethod::Upi,
                items: vec![line(onions, dec!(1)), line(mangoes, dec!(2)), line(onions, dec!(3))],
                discount: Decimal::ZERO,
                notes: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(placed.items.len(), 2);
    assert_eq!(placed.order.subtotal, dec!(360.00));
    assert_eq!(ctx.product(mangoes).await.quantity_available, dec!(8));
    assert_eq!(ctx.product(onions).await.quantity_available, dec!(6));

    let short = ctx
        .services
        .checkout
        .place_order(
            user,
            PlaceOrderRequest {
                delivery_address_id: address,
                payment_method: PaymentMethod::Upi,
                items: vec![line(onions, dec!(4)), line(onions, dec!(3))],
                discount: Decimal::ZERO,
                notes: None,
            },
        )
        .await;
    assert_matches!(short, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(ctx.product(onions).await.quantity_available, dec!(6));
}

#[tokio::test]
async fn last_item_cannot_be_removed() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(100.00), dec!(5)).await;
    let order = ctx
        .place_order(user, address, product, dec!(1), PaymentMethod::Upi)
        .await
        .unwrap();
    let item = ctx.services.checkout.list_items(&order.id).await.unwrap()[0].clone();

    let result = ctx.services.checkout.remove_item(&order.id, item.id).await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert_eq!(ctx.product(product).await.quantity_available, dec!(4));
}

#[tokio::test]
async fn payment_confirmation_moves_order_to_confirmed() {
    let ctx = TestContext::new().await;
    let (order, _) = ctx.paid_order(Uuid::new_v4(), dec!(250.00), dec!(4)).await;

    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Completed);
    assert!(order.gateway_payment_id.is_some());

    let titles: Vec<String> = ctx
        .history(&order.id)
        .await
        .into_iter()
        .map(|h| h.title)
        .collect();
    assert_eq!(
        titles,
        vec!["Payment Pending", "Payment Initiated", "Order Confirmed"]
    );
}

#[tokio::test]
async fn reorder_is_offered_only_after_cancellation_or_delivery() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let address = ctx.seed_address(user).await;
    let product = ctx.seed_product(dec!(60.00), dec!(10)).await;
    let order = ctx
        .place_order(user, address, product, dec!(3), PaymentMethod::Cod)
        .await
        .unwrap();

    assert_matches!(
        ctx.services.checkout.reorder_availability(&order.id).await,
        Err(ServiceError::ValidationError(_))
    );
}
