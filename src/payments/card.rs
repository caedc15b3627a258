//! Card processor adapter. Intent-based flow: `create_payment` opens a
//! payment intent for the exact minor-unit amount and hands the client
//! secret to the front end for 3-D-secure/card entry; the webhook (or an
//! explicit confirm) reports the outcome.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::config::CardProviderConfig;
use crate::errors::ServiceError;

use super::{
    read_provider_json, to_minor_units, PaymentProvider, PaymentRequest, PaymentResult,
    ProviderEvent, ProviderEventKind, ProviderKind, ProviderStatus,
};

pub struct CardGateway {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
    webhook_secret: String,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    amount: i64,
    currency: String,
}

impl CardGateway {
    pub fn new(cfg: &CardProviderConfig, timeout_secs: u64) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("card http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            secret_key: cfg.secret_key.clone(),
            webhook_secret: cfg.webhook_secret.clone(),
        })
    }

    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    fn result_from_intent(&self, intent: IntentResponse) -> PaymentResult {
        let status = self.map_status(&intent.status);
        PaymentResult {
            success: status != ProviderStatus::Failed,
            transaction_id: intent.id,
            amount_minor: intent.amount,
            currency: intent.currency.to_ascii_uppercase(),
            status,
            client_secret: intent.client_secret,
            checkout_url: None,
            embedded_snippet: None,
        }
    }

    async fn fetch_intent(&self, intent_id: &str) -> Result<IntentResponse, ServiceError> {
        let response = self
            .http
            .get(format!("{}/v1/payment_intents/{}", self.base_url, intent_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderError(format!("card: {}", e)))?;

        let body = read_provider_json(ProviderKind::Card, response).await?;
        serde_json::from_value(body)
            .map_err(|e| ServiceError::ProviderError(format!("card: unexpected intent shape: {}", e)))
    }
}

#[async_trait]
impl PaymentProvider for CardGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Card
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentResult, ServiceError> {
        let amount_minor = to_minor_units(request.amount, &request.currency)?;

        let response = self
            .http
            .post(format!("{}/v1/payment_intents", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&json!({
                "amount": amount_minor,
                "currency": request.currency.to_ascii_lowercase(),
                "receipt_email": request.customer_email,
                "metadata": { "order_id": request.order_id },
            }))
            .send()
            .await
            .map_err(|e| ServiceError::ProviderError(format!("card: {}", e)))?;

        let body = read_provider_json(ProviderKind::Card, response).await?;
        let intent: IntentResponse = serde_json::from_value(body).map_err(|e| {
            ServiceError::ProviderError(format!("card: unexpected intent shape: {}", e))
        })?;

        info!(intent_id = %intent.id, "card payment intent created");
        Ok(self.result_from_intent(intent))
    }

    async fn confirm_payment(&self, transaction_id: &str) -> Result<PaymentResult, ServiceError> {
        let intent = self.fetch_intent(transaction_id).await?;
        Ok(self.result_from_intent(intent))
    }

    async fn cancel_payment(&self, transaction_id: &str) -> Result<bool, ServiceError> {
        let response = self
            .http
            .post(format!(
                "{}/v1/payment_intents/{}/cancel",
                self.base_url, transaction_id
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderError(format!("card: {}", e)))?;

        let body = read_provider_json(ProviderKind::Card, response).await?;
        let intent: IntentResponse = serde_json::from_value(body).map_err(|e| {
            ServiceError::ProviderError(format!("card: unexpected intent shape: {}", e))
        })?;

        Ok(self.map_status(&intent.status) == ProviderStatus::Cancelled)
    }

    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount_minor: i64,
    ) -> Result<PaymentResult, ServiceError> {
        let response = self
            .http
            .post(format!("{}/v1/refunds", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&json!({
                "payment_intent": transaction_id,
                "amount": amount_minor,
            }))
            .send()
            .await
            .map_err(|e| ServiceError::ProviderError(format!("card: {}", e)))?;

        let body = read_provider_json(ProviderKind::Card, response).await?;
        let refund_status = body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("failed");

        let status = match refund_status {
            "succeeded" => ProviderStatus::Completed,
            "pending" => ProviderStatus::Pending,
            _ => ProviderStatus::Failed,
        };

        Ok(PaymentResult {
            success: status != ProviderStatus::Failed,
            transaction_id: transaction_id.to_string(),
            amount_minor,
            currency: String::new(),
            status,
            client_secret: None,
            checkout_url: None,
            embedded_snippet: None,
        })
    }

    fn map_status(&self, raw: &str) -> ProviderStatus {
        match raw {
            "requires_payment_method" | "requires_confirmation" | "requires_action"
            | "processing" => ProviderStatus::Pending,
            "requires_capture" => ProviderStatus::Authorized,
            "succeeded" => ProviderStatus::Completed,
            "canceled" => ProviderStatus::Cancelled,
            _ => ProviderStatus::Failed,
        }
    }

    fn parse_webhook(&self, payload: &serde_json::Value) -> Result<ProviderEvent, ServiceError> {
        let event_id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::BadRequest("card webhook: missing event id".into()))?
            .to_string();
        let event_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let object = payload.pointer("/data/object").cloned().unwrap_or_default();

        let kind = match event_type.as_str() {
            "payment_intent.succeeded" => ProviderEventKind::StatusChanged(ProviderStatus::Completed),
            "payment_intent.amount_capturable_updated" => {
                ProviderEventKind::StatusChanged(ProviderStatus::Authorized)
            }
            "payment_intent.payment_failed" => {
                ProviderEventKind::StatusChanged(ProviderStatus::Failed)
            }
            "payment_intent.canceled" => ProviderEventKind::StatusChanged(ProviderStatus::Cancelled),
            "charge.refunded" => ProviderEventKind::Refund,
            _ => ProviderEventKind::Ignored,
        };

        // Refund events reference the intent through the charge object.
        let transaction_id = if kind == ProviderEventKind::Refund {
            object
                .get("payment_intent")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        } else {
            object
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };

        Ok(ProviderEvent {
            event_id,
            transaction_id,
            event_type,
            kind,
        })
    }
}
