use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::ServiceError;

/// Free-form key/value metadata attached to gateway objects.
pub type Notes = BTreeMap<String, String>;

/// Gateway-side order created before the customer pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub payment_id: String,
    pub gateway_order_id: Option<String>,
    /// `created`, `authorized`, `captured`, `refunded` or `failed`
    pub status: String,
    pub amount_minor: i64,
    pub currency: String,
    pub method: Option<String>,
}

impl GatewayPayment {
    pub fn is_captured(&self) -> bool {
        self.status == "captured"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: String,
    pub amount_minor: i64,
    pub status: String,
}

/// Contract for the card/UPI payment gateway. Amounts are in minor units
/// (paise). Every failure surfaces as `ServiceError::GatewayError`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount_minor: i64,
        receipt: &str,
        notes: Notes,
    ) -> Result<GatewayOrder, ServiceError>;

    /// Checks the signature returned to the client after checkout.
    fn verify_signature(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool;

    /// Checks the signature header of an inbound webhook against the raw body.
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError>;

    async fn refund(
        &self,
        payment_id: &str,
        amount_minor: i64,
        notes: Notes,
    ) -> Result<GatewayRefund, ServiceError>;
}
