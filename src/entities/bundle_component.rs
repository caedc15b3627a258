use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One component of a bundle product: `per_bundle_quantity` units of the
/// component product are required for every bundle unit sold.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "bundle_components")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub bundle_id: Uuid,
    pub component_id: Uuid,
    pub per_bundle_quantity: i32,
    pub position: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::BundleId",
        to = "super::product::Column::Id"
    )]
    Bundle,
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ComponentId",
        to = "super::product::Column::Id"
    )]
    Component,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Bundle.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
