use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A payment attempt against an order. Rows are created when the attempt is
/// initiated and mutated in place as the provider reports progress; they are
/// never replaced.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: ProviderKind,
    /// The provider's own identifier. Webhooks resolve payments by this,
    /// never by our internal id.
    #[sea_orm(nullable)]
    pub provider_transaction_id: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentState,
    /// Secret or handle the client needs to complete an interactive flow.
    #[sea_orm(nullable)]
    pub client_secret: Option<String>,
    #[sea_orm(nullable)]
    pub checkout_url: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub embedded_snippet: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub refunded_amount: Decimal,
    #[sea_orm(nullable)]
    pub authorized_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
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

impl ActiveModelBehavior for ActiveModel {}

/// The closed set of supported payment back-ends. Adding a provider is a
/// compile-time-checked addition, not a string match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Card processor with a payment-intent flow.
    #[sea_orm(string_value = "card")]
    Card,
    /// Regional wallet with an OAuth token and redirect checkout.
    #[sea_orm(string_value = "wallet")]
    Wallet,
    /// Buy-now-pay-later checkout with two-phase authorize/capture.
    #[sea_orm(string_value = "bnpl")]
    Bnpl,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Card => "card",
            ProviderKind::Wallet => "wallet",
            ProviderKind::Bnpl => "bnpl",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "card" => Ok(ProviderKind::Card),
            "wallet" => Ok(ProviderKind::Wallet),
            "bnpl" => Ok(ProviderKind::Bnpl),
            other => Err(format!("unknown payment provider: {}", other)),
        }
    }
}

/// Payment state machine:
/// `Pending -> Authorized -> Paid`, with `Pending|Authorized -> Cancelled|Failed`
/// as terminal failure branches and `Paid -> Refunded` post-hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "authorized")]
    Authorized,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Authorized => "authorized",
            PaymentState::Paid => "paid",
            PaymentState::Cancelled => "cancelled",
            PaymentState::Failed => "failed",
            PaymentState::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Cancelled | PaymentState::Failed | PaymentState::Refunded
        )
    }

    /// Legal forward transitions. Re-applying the current state is allowed
    /// and treated by callers as a no-op; that guard is what makes webhook
    /// redelivery idempotent.
    pub fn can_transition_to(&self, target: PaymentState) -> bool {
        use PaymentState::*;
        match (self, target) {
            (a, b) if *a == b => true,
            (Pending, Authorized) | (Pending, Paid) | (Authorized, Paid) => true,
            (Pending, Cancelled) | (Pending, Failed) => true,
            (Authorized, Cancelled) | (Authorized, Failed) => true,
            (Paid, Refunded) => true,
            _ => false,
        }
    }
}
