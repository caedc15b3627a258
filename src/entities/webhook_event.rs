use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::payment::ProviderKind;

/// Record of a processed webhook delivery. The unique `dedup_key`
/// (`provider:external_event_id`) is the persisted replay guard: a second
/// delivery of the same event fails the insert and is acknowledged without
/// side effects.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub provider: ProviderKind,
    #[sea_orm(unique)]
    pub dedup_key: String,
    pub external_event_id: String,
    pub event_type: String,
    #[sea_orm(nullable)]
    pub payment_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn dedup_key_for(provider: ProviderKind, external_event_id: &str) -> String {
        format!("{}:{}", provider, external_event_id)
    }
}
