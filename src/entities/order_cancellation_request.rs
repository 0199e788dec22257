use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "rejected")]
    Rejected,
    #[sea_orm(string_value = "refund_processed")]
    RefundProcessed,
}

/// Closed set of reasons a customer may give for cancelling.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReasonCode {
    #[sea_orm(string_value = "changed_mind")]
    ChangedMind,
    #[sea_orm(string_value = "ordered_by_mistake")]
    OrderedByMistake,
    #[sea_orm(string_value = "found_better_price")]
    FoundBetterPrice,
    #[sea_orm(string_value = "delivery_too_late")]
    DeliveryTooLate,
    #[sea_orm(string_value = "duplicate_order")]
    DuplicateOrder,
    #[sea_orm(string_value = "payment_issue")]
    PaymentIssue,
    #[sea_orm(string_value = "product_quality_concern")]
    ProductQualityConcern,
    #[sea_orm(string_value = "other")]
    Other,
}

impl ReasonCode {
    pub fn label(&self) -> &'static str {
        match self {
            ReasonCode::ChangedMind => "Changed my mind",
            ReasonCode::OrderedByMistake => "Ordered by mistake",
            ReasonCode::FoundBetterPrice => "Found a better price",
            ReasonCode::DeliveryTooLate => "Delivery time is too long",
            ReasonCode::DuplicateOrder => "Duplicate order",
            ReasonCode::PaymentIssue => "Payment issue",
            ReasonCode::ProductQualityConcern => "Concerned about product quality",
            ReasonCode::Other => "Other",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_cancellation_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_id: String,
    pub user_id: Uuid,
    pub reason: ReasonCode,
    pub description: Option<String>,
    pub request_status: RequestStatus,

    /// Order total at request time.
    pub refund_amount: Decimal,
    pub gateway_fee_deduction: Decimal,
    pub platform_fee_deduction: Decimal,
    pub final_refund_amount: Decimal,

    pub gateway_refund_id: Option<String>,
    pub reviewed_by: Option<String>,
    pub admin_notes: Option<String>,
    pub carrier_cancelled: bool,
    pub carrier_response: Option<String>,

    pub requested_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub refund_processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();
        if insert {
            active_model.requested_at = Set(now);
        }
        active_model.updated_at = Set(now);
        Ok(active_model)
    }
}
