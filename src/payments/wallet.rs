//! Regional wallet adapter. The wallet API wants an OAuth-style access
//! token; the customer finishes payment out-of-band on a redirect URL and
//! status is polled via a details endpoint. Every call carries an
//! idempotency request-id header.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::WalletProviderConfig;
use crate::errors::ServiceError;

use super::{
    read_provider_json, to_minor_units, PaymentProvider, PaymentRequest, PaymentResult,
    ProviderEvent, ProviderEventKind, ProviderKind, ProviderStatus,
};

/// Refresh the token this many minutes before it actually expires.
const TOKEN_REFRESH_MARGIN_MINS: i64 = 5;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::minutes(TOKEN_REFRESH_MARGIN_MINS) < self.expires_at
    }
}

pub struct WalletGateway {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    webhook_secret: String,
    /// Owned token cache; no module-level mutable state.
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct WalletPaymentResponse {
    payment_id: String,
    status: String,
    #[serde(default)]
    redirect_url: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

impl WalletGateway {
    pub fn new(cfg: &WalletProviderConfig, timeout_secs: u64) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("wallet http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            webhook_secret: cfg.webhook_secret.clone(),
            token: Mutex::new(None),
        })
    }

    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    /// Returns a valid access token, refreshing it when it is within the
    /// refresh margin of expiry. The lock is held across the refresh so
    /// concurrent callers do not stampede the token endpoint.
    async fn access_token(&self) -> Result<String, ServiceError> {
        let mut guard = self.token.lock().await;
        let now = Utc::now();

        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh(now) {
                return Ok(cached.access_token.clone());
            }
            debug!("wallet access token near expiry, refreshing");
        }

        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| ServiceError::ProviderError(format!("wallet: token refresh: {}", e)))?;

        let body = read_provider_json(ProviderKind::Wallet, response).await?;
        let token: TokenResponse = serde_json::from_value(body).map_err(|e| {
            ServiceError::ProviderError(format!("wallet: unexpected token shape: {}", e))
        })?;

        let cached = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: now + chrono::Duration::seconds(token.expires_in),
        };
        *guard = Some(cached);

        info!("wallet access token refreshed");
        Ok(token.access_token)
    }

    fn result_from_payment(&self, payment: WalletPaymentResponse) -> PaymentResult {
        let status = self.map_status(&payment.status);
        PaymentResult {
            success: status != ProviderStatus::Failed,
            transaction_id: payment.payment_id,
            amount_minor: payment.amount.unwrap_or(0),
            currency: payment.currency.unwrap_or_default(),
            status,
            client_secret: None,
            checkout_url: payment.redirect_url,
            embedded_snippet: None,
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ServiceError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderError(format!("wallet: {}", e)))?;

        read_provider_json(ProviderKind::Wallet, response).await
    }
}

#[async_trait]
impl PaymentProvider for WalletGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Wallet
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentResult, ServiceError> {
        let amount_minor = to_minor_units(request.amount, &request.currency)?;

        let body = self
            .post_json(
                "/v2/payments",
                json!({
                    "amount": { "value": amount_minor, "currency": request.currency.to_ascii_uppercase() },
                    "reference": request.order_id,
                    "customer": { "email": request.customer_email },
                }),
            )
            .await?;

        let payment: WalletPaymentResponse = serde_json::from_value(body).map_err(|e| {
            ServiceError::ProviderError(format!("wallet: unexpected payment shape: {}", e))
        })?;

        info!(payment_id = %payment.payment_id, "wallet payment created");
        Ok(self.result_from_payment(payment))
    }

    async fn confirm_payment(&self, transaction_id: &str) -> Result<PaymentResult, ServiceError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!(
                "{}/v2/payments/{}/details",
                self.base_url, transaction_id
            ))
            .bearer_auth(token)
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(|e| ServiceError::ProviderError(format!("wallet: {}", e)))?;

        let body = read_provider_json(ProviderKind::Wallet, response).await?;
        let payment: WalletPaymentResponse = serde_json::from_value(body).map_err(|e| {
            ServiceError::ProviderError(format!("wallet: unexpected payment shape: {}", e))
        })?;

        Ok(self.result_from_payment(payment))
    }

    async fn cancel_payment(&self, transaction_id: &str) -> Result<bool, ServiceError> {
        let body = self
            .post_json(&format!("/v2/payments/{}/cancel", transaction_id), json!({}))
            .await?;

        let status = body.get("status").and_then(|v| v.as_str()).unwrap_or("");
        Ok(matches!(
            self.map_status(status),
            ProviderStatus::Cancelled | ProviderStatus::Expired
        ))
    }

    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount_minor: i64,
    ) -> Result<PaymentResult, ServiceError> {
        let body = self
            .post_json(
                &format!("/v2/payments/{}/refunds", transaction_id),
                json!({ "amount": amount_minor }),
            )
            .await?;

        let status_raw = body.get("status").and_then(|v| v.as_str()).unwrap_or("");
        let status = match status_raw {
            "refunded" | "settled" => ProviderStatus::Completed,
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
            "created" | "initiated" | "pending_user_action" => ProviderStatus::Pending,
            "authorized" => ProviderStatus::Authorized,
            "paid" | "settled" => ProviderStatus::Completed,
            "cancelled" | "canceled" => ProviderStatus::Cancelled,
            "expired" => ProviderStatus::Expired,
            "failed" | "declined" => ProviderStatus::Failed,
            _ => ProviderStatus::Failed,
        }
    }

    fn parse_webhook(&self, payload: &serde_json::Value) -> Result<ProviderEvent, ServiceError> {
        let event_id = payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::BadRequest("wallet webhook: missing event_id".into()))?
            .to_string();
        let event_type = payload
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let transaction_id = payload
            .get("payment_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let kind = match event_type.as_str() {
            "payment.status.changed" => {
                let raw = payload.get("status").and_then(|v| v.as_str()).unwrap_or("");
                ProviderEventKind::StatusChanged(self.map_status(raw))
            }
            "payment.refunded" => ProviderEventKind::Refund,
            _ => ProviderEventKind::Ignored,
        };

        Ok(ProviderEvent {
            event_id,
            transaction_id,
            event_type,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn gateway() -> WalletGateway {
        WalletGateway::new(
            &WalletProviderConfig {
                base_url: "https://wallet.invalid".into(),
                client_id: "cid".into(),
                client_secret: "csec".into(),
                webhook_secret: "whsec".into(),
            },
            5,
        )
        .unwrap()
    }

    #[test_case("created", ProviderStatus::Pending)]
    #[test_case("initiated", ProviderStatus::Pending)]
    #[test_case("pending_user_action", ProviderStatus::Pending)]
    #[test_case("authorized", ProviderStatus::Authorized)]
    #[test_case("paid", ProviderStatus::Completed)]
    #[test_case("settled", ProviderStatus::Completed)]
    #[test_case("cancelled", ProviderStatus::Cancelled)]
    #[test_case("expired", ProviderStatus::Expired)]
    #[test_case("declined", ProviderStatus::Failed)]
    #[test_case("totally_new_status", ProviderStatus::Failed; "unknown values fail safe")]
    fn status_mapping(raw: &str, expected: ProviderStatus) {
        assert_eq!(gateway().map_status(raw), expected);
    }

    #[test]
    fn token_freshness_respects_refresh_margin() {
        let now = Utc::now();
        let fresh = CachedToken {
            access_token: "t".into(),
            expires_at: now + chrono::Duration::hours(1),
        };
        // Expires in 4 minutes: inside the 5 minute margin, must refresh.
        let stale = CachedToken {
            access_token: "t".into(),
            expires_at: now + chrono::Duration::minutes(4),
        };

        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
    }

    #[test]
    fn parses_status_changed_webhook() {
        let payload = serde_json::json!({
            "event_id": "we_1",
            "event_type": "payment.status.changed",
            "payment_id": "wp_42",
            "status": "paid"
        });

        let event = gateway().parse_webhook(&payload).unwrap();
        assert_eq!(event.transaction_id, "wp_42");
        assert_eq!(
            event.kind,
            ProviderEventKind::StatusChanged(ProviderStatus::Completed)
        );
    }
}
