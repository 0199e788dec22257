use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::order::PaymentMethod;

/// Admin-maintained fee rates, one row per payment method.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_mode_charges")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub payment_method: PaymentMethod,
    /// Percentage of (subtotal + shipping)
    pub platform_fee_percent: Decimal,
    /// Percentage of the order total retained by the gateway
    pub gateway_fee_percent: Decimal,
    pub is_active: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
