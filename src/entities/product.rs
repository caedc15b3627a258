use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Catalog product. For bundles the `quantity` column is not authoritative;
/// availability is derived from the bundle components.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub sku: String,
    pub name: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub price: Decimal,
    pub currency: String,
    /// When false the product is never stock-checked or decremented.
    pub track_quantity: bool,
    pub quantity: i32,
    pub is_bundle: bool,
    #[sea_orm(nullable)]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::bundle_component::Entity")]
    BundleComponents,
}

impl Related<super::bundle_component::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BundleComponents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
