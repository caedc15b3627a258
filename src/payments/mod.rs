//! Payment provider adapters.
//!
//! Three incompatible external back-ends (card processor, regional wallet,
//! buy-now-pay-later checkout) are normalized behind [`PaymentProvider`],
//! producing a canonical [`PaymentResult`] and the canonical status set in
//! [`ProviderStatus`]. Providers are a closed enum ([`ProviderKind`]); adding
//! one is a compile-time change.

pub mod bnpl;
pub mod card;
pub mod wallet;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::config::PaymentsConfig;
use crate::entities::payment::PaymentState;
use crate::errors::ServiceError;

pub use crate::entities::payment::ProviderKind;

use bnpl::BnplGateway;
use card::CardGateway;
use wallet::WalletGateway;

/// Canonical payment status, after mapping away each provider's native
/// vocabulary. Every provider value must map to exactly one of these;
/// unmapped values map to `Failed` rather than silently passing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Authorized,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Authorized => "authorized",
            ProviderStatus::Completed => "completed",
            ProviderStatus::Cancelled => "cancelled",
            ProviderStatus::Expired => "expired",
            ProviderStatus::Failed => "failed",
        }
    }

    /// The payment-row state this canonical status lands on. An expired
    /// checkout is treated as cancelled: the customer abandoned the flow,
    /// nothing was charged.
    pub fn payment_state(&self) -> PaymentState {
        match self {
            ProviderStatus::Pending => PaymentState::Pending,
            ProviderStatus::Authorized => PaymentState::Authorized,
            ProviderStatus::Completed => PaymentState::Paid,
            ProviderStatus::Cancelled | ProviderStatus::Expired => PaymentState::Cancelled,
            ProviderStatus::Failed => PaymentState::Failed,
        }
    }
}

/// Line item forwarded to providers that require an itemized order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentLineItem {
    pub name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    /// Percentage, e.g. 19.00 for 19%.
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
}

/// Provider-independent payment creation request. Amounts stay in major
/// units here; each adapter converts to the smallest currency unit at its
/// own wire boundary.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub customer_email: String,
    pub line_items: Vec<PaymentLineItem>,
}

/// Canonical result shape shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResult {
    pub success: bool,
    pub transaction_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: ProviderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_snippet: Option<String>,
}

/// A parsed webhook notification, still provider-flavored in `event_type`
/// but with the interesting parts extracted.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub event_id: String,
    pub transaction_id: String,
    pub event_type: String,
    pub kind: ProviderEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEventKind {
    StatusChanged(ProviderStatus),
    Refund,
    /// Recognized as harmless but carrying no state change. Acknowledged
    /// with 200 so the provider does not retry.
    Ignored,
}

/// The single interface every external payment back-end is adapted to.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn create_payment(&self, request: &PaymentRequest)
        -> Result<PaymentResult, ServiceError>;

    /// Re-fetches the provider-side state of a payment.
    async fn confirm_payment(&self, transaction_id: &str) -> Result<PaymentResult, ServiceError>;

    async fn cancel_payment(&self, transaction_id: &str) -> Result<bool, ServiceError>;

    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount_minor: i64,
    ) -> Result<PaymentResult, ServiceError>;

    /// Turns an authorized payment into settled funds. Only meaningful for
    /// two-phase providers.
    async fn capture_payment(
        &self,
        _transaction_id: &str,
        _amount_minor: i64,
    ) -> Result<PaymentResult, ServiceError> {
        Err(ServiceError::InvalidOperation(format!(
            "provider {} does not support a separate capture step",
            self.kind()
        )))
    }

    /// Post-authorization acknowledgment, required by some providers before
    /// the order is considered settled on their side.
    async fn acknowledge(&self, _transaction_id: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Maps one provider-native status value to the canonical set. Unknown
    /// values must come back as [`ProviderStatus::Failed`].
    fn map_status(&self, raw: &str) -> ProviderStatus;

    /// Extracts event id, transaction id and status change from a verified
    /// webhook body.
    fn parse_webhook(&self, payload: &serde_json::Value) -> Result<ProviderEvent, ServiceError>;
}

/// The closed registry of configured gateways, owned by the app state.
pub struct PaymentGateways {
    card: CardGateway,
    wallet: WalletGateway,
    bnpl: BnplGateway,
    webhook_tolerance_secs: u64,
}

impl PaymentGateways {
    pub fn from_config(cfg: &PaymentsConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            card: CardGateway::new(&cfg.card, cfg.provider_timeout_secs)?,
            wallet: WalletGateway::new(&cfg.wallet, cfg.provider_timeout_secs)?,
            bnpl: BnplGateway::new(&cfg.bnpl, cfg.provider_timeout_secs)?,
            webhook_tolerance_secs: cfg.webhook_tolerance_secs,
        })
    }

    pub fn get(&self, kind: ProviderKind) -> &dyn PaymentProvider {
        match kind {
            ProviderKind::Card => &self.card,
            ProviderKind::Wallet => &self.wallet,
            ProviderKind::Bnpl => &self.bnpl,
        }
    }

    pub fn webhook_secret(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Card => self.card.webhook_secret(),
            ProviderKind::Wallet => self.wallet.webhook_secret(),
            ProviderKind::Bnpl => self.bnpl.webhook_secret(),
        }
    }

    pub fn webhook_tolerance_secs(&self) -> u64 {
        self.webhook_tolerance_secs
    }
}

const ZERO_DECIMAL_CURRENCIES: &[&str] = &["JPY", "KRW", "VND", "CLP"];

/// Converts a major-unit amount to the smallest currency unit. Providers
/// only ever see integers.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ServiceError> {
    let factor = if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_uppercase().as_str()) {
        Decimal::ONE
    } else {
        Decimal::from(100)
    };

    (amount * factor)
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} out of range", amount)))
}

/// Inverse of [`to_minor_units`].
pub fn from_minor_units(amount_minor: i64, currency: &str) -> Decimal {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_uppercase().as_str()) {
        Decimal::from(amount_minor)
    } else {
        Decimal::new(amount_minor, 2)
    }
}

/// Reads a provider response body, turning non-2xx answers into
/// [`ServiceError::ProviderError`] with the raw body preserved in logs.
pub(crate) async fn read_provider_json(
    provider: ProviderKind,
    response: reqwest::Response,
) -> Result<serde_json::Value, ServiceError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ServiceError::ProviderError(format!("{}: failed to read body: {}", provider, e)))?;

    if !status.is_success() {
        error!(provider = %provider, status = %status, body = %body, "provider call failed");
        return Err(ServiceError::ProviderError(format!(
            "{}: http {}: {}",
            provider, status, body
        )));
    }

    serde_json::from_str(&body).map_err(|e| {
        error!(provider = %provider, body = %body, "provider returned invalid json");
        ServiceError::ProviderError(format!("{}: invalid json: {}", provider, e))
    })
}
