//! Stock accounting. Tracked products are decremented with a guarded
//! conditional UPDATE so two concurrent checkouts can never both take the
//! last unit; untracked products always pass. Bundles resolve to their
//! component stock.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{ConnectionTrait, DatabaseConnection, QueryOrder};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::{bundle_component, product};
use crate::errors::ServiceError;

/// How many units of each concrete (non-bundle) product a requested
/// quantity of some catalog item consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDemand {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// A resolved catalog item: the product row plus the concrete component
/// demands one unit of it creates.
#[derive(Debug, Clone)]
pub struct ResolvedProduct {
    pub product: product::Model,
    /// Empty for plain products; one entry per component for bundles.
    pub components: Vec<(product::Model, i32)>,
}

impl ResolvedProduct {
    pub fn unit_price(&self) -> Decimal {
        self.product.price
    }

    /// Concrete stock demands for `quantity` units of this item.
    pub fn demands(&self, quantity: i32) -> Vec<ComponentDemand> {
        if self.components.is_empty() {
            vec![ComponentDemand {
                product_id: self.product.id,
                quantity,
            }]
        } else {
            self.components
                .iter()
                .map(|(component, per_bundle)| ComponentDemand {
                    product_id: component.id,
                    quantity: per_bundle * quantity,
                })
                .collect()
        }
    }
}

/// Loads a product and, for bundles, its components. Nested bundles are
/// rejected: a bundle may only contain plain products.
pub async fn resolve_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<ResolvedProduct, ServiceError> {
    let item = product::Entity::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("product {} not found", product_id)))?;

    if !item.is_bundle {
        return Ok(ResolvedProduct {
            product: item,
            components: Vec::new(),
        });
    }

    let links = bundle_component::Entity::find()
        .filter(bundle_component::Column::BundleId.eq(product_id))
        .order_by_asc(bundle_component::Column::Position)
        .all(conn)
        .await?;

    if links.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "bundle '{}' has no components",
            item.name
        )));
    }

    let component_ids: Vec<Uuid> = links.iter().map(|link| link.component_id).collect();
    let component_rows = product::Entity::find()
        .filter(product::Column::Id.is_in(component_ids))
        .all(conn)
        .await?;
    let by_id: HashMap<Uuid, product::Model> =
        component_rows.into_iter().map(|p| (p.id, p)).collect();

    let mut components = Vec::with_capacity(links.len());
    for link in links {
        let component = by_id.get(&link.component_id).cloned().ok_or_else(|| {
            ServiceError::InternalError(format!(
                "bundle component {} references a missing product",
                link.component_id
            ))
        })?;
        if component.is_bundle {
            return Err(ServiceError::ValidationError(format!(
                "bundle '{}' contains nested bundle '{}'",
                item.name, component.name
            )));
        }
        components.push((component, link.per_bundle_quantity));
    }

    Ok(ResolvedProduct {
        product: item,
        components,
    })
}

/// Sellable units of a resolved item right now. Untracked stock reads as
/// unlimited; a bundle is limited by its scarcest component.
pub fn available_units(resolved: &ResolvedProduct) -> Option<i32> {
    if resolved.components.is_empty() {
        if resolved.product.track_quantity {
            Some(resolved.product.quantity.max(0))
        } else {
            None
        }
    } else {
        resolved
            .components
            .iter()
            .filter(|(component, _)| component.track_quantity)
            .map(|(component, per_bundle)| {
                if *per_bundle <= 0 {
                    0
                } else {
                    (component.quantity.max(0)) / per_bundle
                }
            })
            .min()
    }
}

/// Advisory availability check used by cart validation. The authoritative
/// guard is [`decrement_if_available`] inside the checkout transaction.
pub fn check_availability(resolved: &ResolvedProduct, requested: i32) -> Result<(), ServiceError> {
    match available_units(resolved) {
        Some(available) if available < requested => {
            let name = if resolved.components.is_empty() {
                resolved.product.name.clone()
            } else {
                // Name the scarcest component so the shopper knows what ran out.
                resolved
                    .components
                    .iter()
                    .filter(|(c, _)| c.track_quantity)
                    .min_by_key(|(c, per)| {
                        if *per <= 0 {
                            0
                        } else {
                            c.quantity.max(0) / per
                        }
                    })
                    .map(|(c, _)| c.name.clone())
                    .unwrap_or_else(|| resolved.product.name.clone())
            };
            Err(ServiceError::InsufficientStock(format!(
                "insufficient stock for '{}': {} available, {} requested",
                name, available, requested
            )))
        }
        _ => Ok(()),
    }
}

/// Atomically takes `quantity` units of a tracked product. Returns an
/// [`ServiceError::InsufficientStock`] when the guarded UPDATE matched no
/// row, which means stock was taken by a concurrent transaction.
#[instrument(skip(conn))]
pub async fn decrement_if_available<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    product_name: &str,
    quantity: i32,
) -> Result<(), ServiceError> {
    let result = product::Entity::update_many()
        .col_expr(
            product::Column::Quantity,
            Expr::col(product::Column::Quantity).sub(quantity),
        )
        .col_expr(
            product::Column::UpdatedAt,
            Expr::value(chrono::Utc::now()),
        )
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::TrackQuantity.eq(true))
        .filter(product::Column::Quantity.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::InsufficientStock(format!(
            "insufficient stock for '{}'",
            product_name
        )));
    }

    debug!(%product_id, quantity, "stock decremented");
    Ok(())
}

/// Returns previously taken units, used by cancellation.
pub async fn increment<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    product::Entity::update_many()
        .col_expr(
            product::Column::Quantity,
            Expr::col(product::Column::Quantity).add(quantity),
        )
        .col_expr(
            product::Column::UpdatedAt,
            Expr::value(chrono::Utc::now()),
        )
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::TrackQuantity.eq(true))
        .exec(conn)
        .await?;

    debug!(%product_id, quantity, "stock restored");
    Ok(())
}

/// Merges demands by product id so one product hit through several cart
/// lines (or bundles sharing a component) is taken in a single UPDATE.
pub fn merge_demands(demands: Vec<ComponentDemand>) -> Vec<ComponentDemand> {
    let mut merged: HashMap<Uuid, i32> = HashMap::new();
    for demand in demands {
        *merged.entry(demand.product_id).or_insert(0) += demand.quantity;
    }
    merged
        .into_iter()
        .map(|(product_id, quantity)| ComponentDemand {
            product_id,
            quantity,
        })
        .collect()
}

/// Read-side stock queries for the HTTP surface.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        product::Entity::find_by_id(product_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("product {} not found", product_id)))
    }

    /// Availability for display purposes; `None` means untracked/unlimited.
    pub async fn availability(&self, product_id: Uuid) -> Result<Option<i32>, ServiceError> {
        let resolved = resolve_product(self.db.as_ref(), product_id).await?;
        Ok(available_units(&resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn plain_product(name: &str, tracked: bool, quantity: i32) -> product::Model {
        product::Model {
            id: Uuid::new_v4(),
            sku: format!("SKU-{}", name),
            name: name.to_string(),
            price: dec!(19.99),
            currency: "EUR".into(),
            track_quantity: tracked,
            quantity,
            is_bundle: false,
            image_url: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn untracked_products_read_as_unlimited() {
        let resolved = ResolvedProduct {
            product: plain_product("Vitamin D3", false, 0),
            components: Vec::new(),
        };
        assert_eq!(available_units(&resolved), None);
        assert!(check_availability(&resolved, 10_000).is_ok());
    }

    #[test]
    fn bundle_availability_is_limited_by_scarcest_component() {
        let bundle = ResolvedProduct {
            product: product::Model {
                is_bundle: true,
                ..plain_product("Immunity Pack", false, 0)
            },
            components: vec![
                (plain_product("Vitamin C", true, 5), 2),
                (plain_product("Zinc", true, 9), 1),
            ],
        };

        // Vitamin C allows floor(5 / 2) = 2 bundles, Zinc allows 9.
        assert_eq!(available_units(&bundle), Some(2));

        let err = check_availability(&bundle, 3).unwrap_err();
        match err {
            ServiceError::InsufficientStock(msg) => {
                assert!(msg.contains("Vitamin C"), "scarcest component named: {}", msg)
            }
            other => panic!("expected InsufficientStock, got {:?}", other),
        }
    }

    #[test]
    fn bundle_demands_multiply_per_bundle_quantities() {
        let c = plain_product("Vitamin C", true, 100);
        let z = plain_product("Zinc", true, 100);
        let c_id = c.id;
        let z_id = z.id;

        let bundle = ResolvedProduct {
            product: product::Model {
                is_bundle: true,
                ..plain_product("Immunity Pack", false, 0)
            },
            components: vec![(c, 2), (z, 1)],
        };

        let demands = bundle.demands(3);
        assert!(demands.contains(&ComponentDemand {
            product_id: c_id,
            quantity: 6
        }));
        assert!(demands.contains(&ComponentDemand {
            product_id: z_id,
            quantity: 3
        }));
    }

    #[test]
    fn merge_demands_sums_shared_components() {
        let shared = Uuid::new_v4();
        let merged = merge_demands(vec![
            ComponentDemand {
                product_id: shared,
                quantity: 2,
            },
            ComponentDemand {
                product_id: shared,
                quantity: 3,
            },
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].quantity, 5);
    }
}
