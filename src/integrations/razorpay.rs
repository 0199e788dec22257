use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, instrument};

use super::payment_gateway::{GatewayOrder, GatewayPayment, GatewayRefund, Notes, PaymentGateway};
use super::signature;
use crate::config::PaymentGatewayConfig;
use crate::errors::ServiceError;

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    notes: Notes,
}

#[derive(Debug, Serialize)]
struct RefundBody {
    amount: i64,
    notes: Notes,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    amount: i64,
    currency: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    order_id: Option<String>,
    status: String,
    amount: i64,
    currency: String,
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    amount: i64,
    status: String,
}

/// HTTP client for the Razorpay REST API (basic auth with key id and secret).
#[derive(Clone)]
pub struct RazorpayClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    webhook_secret: String,
    currency: String,
}

impl RazorpayClient {
    pub fn new(config: &PaymentGatewayConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
            webhook_secret: config.webhook_secret.clone(),
            currency: config.currency.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<T, ServiceError> {
        let response = request
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(|e| {
                error!(operation, error = %e, "Payment gateway request failed");
                ServiceError::GatewayError(format!("{} failed: {}", operation, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let description = body
                .pointer("/error/description")
                .and_then(Value::as_str)
                .unwrap_or("unexpected response")
                .to_string();
            error!(operation, status = %status, %description, "Payment gateway rejected request");
            return Err(ServiceError::GatewayError(format!(
                "{} rejected ({}): {}",
                operation,
                status.as_u16(),
                description
            )));
        }

        response.json::<T>().await.map_err(|e| {
            ServiceError::GatewayError(format!("{} returned an unreadable body: {}", operation, e))
        })
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    #[instrument(skip(self, notes))]
    async fn create_order(
        &self,
        amount_minor: i64,
        receipt: &str,
        notes: Notes,
    ) -> Result<GatewayOrder, ServiceError> {
        let body = CreateOrderBody {
            amount: amount_minor,
            currency: &self.currency,
            receipt,
            notes,
        };
        let created: OrderResponse = self
            .send(self.http.post(self.url("/orders")).json(&body), "create_order")
            .await?;

        info!(gateway_order_id = %created.id, "Gateway order created");
        Ok(GatewayOrder {
            gateway_order_id: created.id,
            amount_minor: created.amount,
            currency: created.currency,
            status: created.status,
        })
    }

    fn verify_signature(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool {
        signature::verify_payment_signature(&self.key_secret, gateway_order_id, payment_id, signature)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        signature::verify_webhook_signature(&self.webhook_secret, payload, signature)
    }

    #[instrument(skip(self))]
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError> {
        let payment: PaymentResponse = self
            .send(
                self.http.get(self.url(&format!("/payments/{}", payment_id))),
                "fetch_payment",
            )
            .await?;

        Ok(GatewayPayment {
            payment_id: payment.id,
            gateway_order_id: payment.order_id,
            status: payment.status,
            amount_minor: payment.amount,
            currency: payment.currency,
            method: payment.method,
        })
    }

    #[instrument(skip(self, notes))]
    async fn refund(
        &self,
        payment_id: &str,
        amount_minor: i64,
        notes: Notes,
    ) -> Result<GatewayRefund, ServiceError> {
        let body = RefundBody {
            amount: amount_minor,
            notes,
        };
        let refund: RefundResponse = self
            .send(
                self.http
                    .post(self.url(&format!("/payments/{}/refund", payment_id)))
                    .json(&body),
                "refund",
            )
            .await?;

        info!(refund_id = %refund.id, amount_minor = refund.amount, "Gateway refund created");
        Ok(GatewayRefund {
            refund_id: refund.id,
            amount_minor: refund.amount,
            status: refund.status,
        })
    }
}
