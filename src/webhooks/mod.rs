//! Webhook intake: signature verification over the raw body, provider
//! event parsing, and idempotent reconciliation of the reported state onto
//! the local payment and order rows.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, DatabaseConnection, TransactionTrait};
use sha2::Sha256;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    payment::{self, PaymentState, ProviderKind},
    webhook_event,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::payments::{PaymentGateways, ProviderEventKind};
use crate::services::payments::{apply_payment_transition, TransitionOutcome};

type HmacSha256 = Hmac<Sha256>;

/// What reconciliation did with a verified delivery. Every variant is
/// acknowledged with 200 so the provider stops retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied {
        payment_id: Uuid,
        old: PaymentState,
        new: PaymentState,
    },
    /// Same external event id seen before; no side effects.
    Duplicate,
    /// Recognized event type that carries no state change.
    Ignored,
    /// The reported transition is illegal from the current state, which
    /// means this delivery is older than what we already know.
    Stale,
}

/// Verifies the HMAC-SHA256 signature over the raw request body.
///
/// Accepts either `x-timestamp`/`x-signature` headers (signature over
/// `"{timestamp}.{body}"`) or a Stripe-style combined `t=...,v1=...`
/// header. The timestamp must be within `tolerance_secs` of now.
pub fn verify_signature(
    secret: &str,
    tolerance_secs: u64,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ServiceError> {
    let (timestamp, signature_hex) = extract_signature(headers)?;

    let now = Utc::now().timestamp();
    if (now - timestamp).unsigned_abs() > tolerance_secs {
        return Err(ServiceError::SignatureError(
            "webhook timestamp outside tolerance".into(),
        ));
    }

    let signature = hex::decode(signature_hex.trim())
        .map_err(|_| ServiceError::SignatureError("signature is not valid hex".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ServiceError::InternalError("webhook secret unusable as hmac key".into()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    // verify_slice is constant-time.
    mac.verify_slice(&signature)
        .map_err(|_| ServiceError::SignatureError("signature mismatch".into()))
}

fn extract_signature(headers: &HeaderMap) -> Result<(i64, String), ServiceError> {
    if let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) {
        let timestamp = ts
            .to_str()
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| ServiceError::SignatureError("malformed x-timestamp header".into()))?;
        let signature = sig
            .to_str()
            .map_err(|_| ServiceError::SignatureError("malformed x-signature header".into()))?
            .to_string();
        return Ok((timestamp, signature));
    }

    if let Some(combined) = headers.get("stripe-signature") {
        let combined = combined
            .to_str()
            .map_err(|_| ServiceError::SignatureError("malformed signature header".into()))?;
        let mut timestamp = None;
        let mut signature = None;
        for part in combined.split(',') {
            match part.trim().split_once('=') {
                Some(("t", v)) => timestamp = v.parse::<i64>().ok(),
                Some(("v1", v)) => signature = Some(v.to_string()),
                _ => {}
            }
        }
        if let (Some(timestamp), Some(signature)) = (timestamp, signature) {
            return Ok((timestamp, signature));
        }
        return Err(ServiceError::SignatureError(
            "signature header missing t= or v1=".into(),
        ));
    }

    Err(ServiceError::SignatureError(
        "missing signature headers".into(),
    ))
}

/// Applies verified provider notifications to local state, exactly once per
/// external event id.
#[derive(Clone)]
pub struct Reconciler {
    db: Arc<DatabaseConnection>,
    gateways: Arc<PaymentGateways>,
    event_sender: EventSender,
}

impl Reconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateways: Arc<PaymentGateways>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            gateways,
            event_sender,
        }
    }

    #[instrument(skip(self, headers, body), fields(%provider))]
    pub async fn handle(
        &self,
        provider: ProviderKind,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Disposition, ServiceError> {
        verify_signature(
            self.gateways.webhook_secret(provider),
            self.gateways.webhook_tolerance_secs(),
            headers,
            body,
        )?;

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ServiceError::BadRequest(format!("webhook body is not json: {}", e)))?;
        let event = self.gateways.get(provider).parse_webhook(&payload)?;

        let target = match &event.kind {
            ProviderEventKind::StatusChanged(status) => status.payment_state(),
            ProviderEventKind::Refund => PaymentState::Refunded,
            ProviderEventKind::Ignored => {
                info!(event_type = %event.event_type, "webhook event carries no state change");
                return Ok(Disposition::Ignored);
            }
        };
        if event.transaction_id.is_empty() {
            return Err(ServiceError::BadRequest(
                "webhook event has no transaction id".into(),
            ));
        }

        // 404 here makes the provider retry later, covering the race where
        // the webhook outruns the intent insert.
        let payment = payment::Entity::find()
            .filter(payment::Column::Provider.eq(provider))
            .filter(payment::Column::ProviderTransactionId.eq(event.transaction_id.as_str()))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "no payment for {} transaction {}",
                    provider, event.transaction_id
                ))
            })?;

        let txn = self.db.begin().await?;

        let dedup_key = webhook_event::Model::dedup_key_for(provider, &event.event_id);
        let seen = webhook_event::Entity::find()
            .filter(webhook_event::Column::DedupKey.eq(dedup_key.as_str()))
            .one(&txn)
            .await?;
        if seen.is_some() {
            info!(%dedup_key, "webhook event already processed");
            return Ok(Disposition::Duplicate);
        }

        let record = webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            provider: Set(provider),
            dedup_key: Set(dedup_key.clone()),
            external_event_id: Set(event.event_id.clone()),
            event_type: Set(event.event_type.clone()),
            payment_id: Set(Some(payment.id)),
            received_at: Set(Utc::now()),
        };
        if let Err(e) = record.insert(&txn).await {
            let err = ServiceError::from(e);
            // A concurrent delivery of the same event won the insert race.
            if err.is_unique_violation() {
                info!(%dedup_key, "webhook event raced a concurrent delivery");
                return Ok(Disposition::Duplicate);
            }
            return Err(err);
        }

        let payment = payment::Entity::find_by_id(payment.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {} not found", payment.id)))?;
        let payment_id = payment.id;

        let (updated, outcome) = apply_payment_transition(&txn, payment, target).await?;

        if let TransitionOutcome::Stale { current, attempted } = outcome {
            // Keep the dedup record so the retry does not reprocess, but
            // change nothing else.
            txn.commit().await?;
            warn!(
                %payment_id,
                current = current.as_str(),
                attempted = attempted.as_str(),
                "out-of-order webhook ignored"
            );
            return Ok(Disposition::Stale);
        }

        // A provider-driven refund is always for the full amount.
        if target == PaymentState::Refunded
            && matches!(outcome, TransitionOutcome::Applied { .. })
        {
            let amount = updated.amount;
            let version = updated.version;
            let mut refund_update: payment::ActiveModel = updated.clone().into();
            refund_update.refunded_amount = Set(amount);
            refund_update.version = Set(version + 1);
            refund_update.update(&txn).await?;
        }

        txn.commit().await?;

        if let TransitionOutcome::Applied { old, new } = outcome {
            info!(%payment_id, old = old.as_str(), new = new.as_str(), "webhook reconciled");
            if let Err(e) = self
                .event_sender
                .send(Event::PaymentStatusChanged {
                    payment_id,
                    old_status: old,
                    new_status: new,
                })
                .await
            {
                warn!(error = %e, "event channel closed, webhook event dropped");
            }
            // Two-phase providers want the authorization acknowledged.
            if new == PaymentState::Authorized {
                if let Err(e) = self
                    .gateways
                    .get(provider)
                    .acknowledge(&event.transaction_id)
                    .await
                {
                    warn!(%payment_id, error = %e, "acknowledgment failed, provider will retry the webhook");
                }
            }
            return Ok(Disposition::Applied {
                payment_id,
                old,
                new,
            });
        }

        info!(%payment_id, "webhook reported the state we already hold");
        Ok(Disposition::Duplicate)
    }
}

/// Computes the signature a caller must attach; shared with the tests and
/// usable for local manual testing.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signed_headers(secret: &str, timestamp: i64, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-timestamp",
            HeaderValue::from_str(&timestamp.to_string()).unwrap(),
        );
        headers.insert(
            "x-signature",
            HeaderValue::from_str(&sign_payload(secret, timestamp, body)).unwrap(),
        );
        headers
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"event_id":"e1"}"#;
        let now = Utc::now().timestamp();
        let headers = signed_headers("whsec", now, body);
        assert!(verify_signature("whsec", 300, &headers, body).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"event_id":"e1"}"#;
        let now = Utc::now().timestamp();
        let headers = signed_headers("other", now, body);
        let err = verify_signature("whsec", 300, &headers, body).unwrap_err();
        assert!(matches!(err, ServiceError::SignatureError(_)));
    }

    #[test]
    fn tampered_body_fails() {
        let now = Utc::now().timestamp();
        let headers = signed_headers("whsec", now, br#"{"amount":100}"#);
        let err = verify_signature("whsec", 300, &headers, br#"{"amount":999}"#).unwrap_err();
        assert!(matches!(err, ServiceError::SignatureError(_)));
    }

    #[test]
    fn old_timestamp_fails() {
        let body = br#"{}"#;
        let stale = Utc::now().timestamp() - 3600;
        let headers = signed_headers("whsec", stale, body);
        let err = verify_signature("whsec", 300, &headers, body).unwrap_err();
        assert!(matches!(err, ServiceError::SignatureError(_)));
    }

    #[test]
    fn stripe_style_combined_header_is_accepted() {
        let body = br#"{"id":"evt_1"}"#;
        let now = Utc::now().timestamp();
        let sig = sign_payload("whsec", now, body);

        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            HeaderValue::from_str(&format!("t={},v1={}", now, sig)).unwrap(),
        );
        assert!(verify_signature("whsec", 300, &headers, body).is_ok());
    }

    #[test]
    fn missing_headers_fail() {
        let err = verify_signature("whsec", 300, &HeaderMap::new(), b"{}").unwrap_err();
        assert!(matches!(err, ServiceError::SignatureError(_)));
    }
}
