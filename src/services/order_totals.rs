//! Order totals
//!
//! `OrderTotalsCalculator` is pure: given line amounts, a payment method, a
//! discount and a `FeeSchedule` snapshot it produces every money field of an
//! order. All arithmetic is `Decimal`, rounded half away from zero to paise.

use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::config::{FeeRate, SettlementConfig};
use crate::entities::order::PaymentMethod;
use crate::entities::payment_mode_charge::{self, Entity as PaymentModeChargeEntity};
use crate::errors::ServiceError;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `amount × percent / 100`, rounded to paise.
pub fn percent_of(amount: Decimal, percent: Decimal) -> Decimal {
    round_money(amount * percent / HUNDRED)
}

/// Converts rupees to paise for the gateway.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("Amount {} is out of range", amount)))
}

/// Immutable fee configuration used for one calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSchedule {
    pub free_shipping_threshold: Decimal,
    pub flat_shipping_fee: Decimal,
    pub tax_rate_percent: Decimal,
    rates: HashMap<PaymentMethod, FeeRate>,
}

impl FeeSchedule {
    pub fn from_config(settlement: &SettlementConfig) -> Self {
        let configured = &settlement.fee_rates;
        let rates = HashMap::from([
            (PaymentMethod::Upi, configured.upi.clone()),
            (PaymentMethod::Card, configured.card.clone()),
            (PaymentMethod::Netbanking, configured.netbanking.clone()),
            (PaymentMethod::Wallet, configured.wallet.clone()),
        ]);
        Self {
            free_shipping_threshold: settlement.free_shipping_threshold,
            flat_shipping_fee: settlement.flat_shipping_fee,
            tax_rate_percent: settlement.tax_rate_percent,
            rates,
        }
    }

    pub fn with_rate(mut self, method: PaymentMethod, rate: FeeRate) -> Self {
        if !method.is_cod() {
            self.rates.insert(method, rate);
        }
        self
    }

    /// Cash on delivery never carries fees.
    pub fn rate_for(&self, method: PaymentMethod) -> FeeRate {
        if method.is_cod() {
            return FeeRate::new(Decimal::ZERO, Decimal::ZERO);
        }
        self.rates
            .get(&method)
            .cloned()
            .unwrap_or_else(|| FeeRate::new(Decimal::ZERO, Decimal::ZERO))
    }

    /// Free strictly above the threshold, flat fee otherwise.
    pub fn shipping_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal > self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.flat_shipping_fee
        }
    }
}

/// One priced line as seen by the calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineAmount {
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl LineAmount {
    pub fn new(quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            quantity,
            unit_price,
        }
    }

    pub fn total(&self) -> Decimal {
        crate::entities::order_item::line_total(self.quantity, self.unit_price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub shipping: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub platform_fee: Decimal,
    /// Retained by the gateway; not part of `total`.
    pub gateway_fee: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    pub fn is_consistent(&self) -> bool {
        self.total == self.subtotal + self.shipping + self.tax + self.platform_fee - self.discount
    }
}

#[derive(Debug, Clone)]
pub struct OrderTotalsCalculator {
    schedule: FeeSchedule,
}

impl OrderTotalsCalculator {
    pub fn new(schedule: FeeSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &FeeSchedule {
        &self.schedule
    }

    pub fn calculate(
        &self,
        lines: &[LineAmount],
        method: PaymentMethod,
        discount: Decimal,
    ) -> Result<OrderTotals, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "An order needs at least one item".to_string(),
            ));
        }
        if discount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Discount cannot be negative".to_string(),
            ));
        }

        let subtotal: Decimal = lines.iter().map(LineAmount::total).sum();
        if discount > subtotal {
            return Err(ServiceError::ValidationError(format!(
                "Discount {} exceeds subtotal {}",
                discount, subtotal
            )));
        }

        let shipping = self.schedule.shipping_for(subtotal);
        let tax = percent_of(subtotal, self.schedule.tax_rate_percent);
        let rate = self.schedule.rate_for(method);
        let platform_fee = percent_of(subtotal + shipping, rate.platform_percent);
        let discount = round_money(discount);
        let total = subtotal + shipping + tax + platform_fee - discount;
        let gateway_fee = percent_of(total, rate.gateway_percent);

        Ok(OrderTotals {
            subtotal,
            shipping,
            tax,
            discount,
            platform_fee,
            gateway_fee,
            total,
        })
    }
}

/// Builds `FeeSchedule` snapshots from the admin rate table.
pub struct FeeScheduleRepository;

impl FeeScheduleRepository {
    /// Active `payment_mode_charges` rows layered over the configured rates.
    #[instrument(skip(db, settlement))]
    pub async fn load_snapshot<C: ConnectionTrait>(
        db: &C,
        settlement: &SettlementConfig,
    ) -> Result<FeeSchedule, ServiceError> {
        let rows = PaymentModeChargeEntity::find()
            .filter(payment_mode_charge::Column::IsActive.eq(true))
            .all(db)
            .await?;

        let schedule = rows
            .into_iter()
            .fold(FeeSchedule::from_config(settlement), |schedule, row| {
                schedule.with_rate(
                    row.payment_method,
                    FeeRate::new(row.platform_fee_percent, row.gateway_fee_percent),
                )
            });
        debug!("Fee schedule snapshot loaded");
        Ok(schedule)
    }
}
