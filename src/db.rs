use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use tracing::info;

use crate::config::AppConfig;
use crate::entities;

pub type DbPool = DatabaseConnection;

/// Opens the database connection pool described by the app config.
pub async fn establish_connection(cfg: &AppConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(cfg.database_url.clone());
    options
        .max_connections(cfg.db_max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    info!("database connection established");
    Ok(db)
}

/// Creates any missing tables from the entity definitions. Used on startup
/// in development and by the test harness; production schema management is
/// an operational concern outside this service.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut statements = vec![
        schema.create_table_from_entity(entities::product::Entity),
        schema.create_table_from_entity(entities::bundle_component::Entity),
        schema.create_table_from_entity(entities::cart::Entity),
        schema.create_table_from_entity(entities::cart_item::Entity),
        schema.create_table_from_entity(entities::order::Entity),
        schema.create_table_from_entity(entities::order_line::Entity),
        schema.create_table_from_entity(entities::stock_reservation::Entity),
        schema.create_table_from_entity(entities::payment::Entity),
        schema.create_table_from_entity(entities::webhook_event::Entity),
        schema.create_table_from_entity(entities::outbox_notification::Entity),
    ];

    for statement in &mut statements {
        statement.if_not_exists();
        db.execute(backend.build(&*statement)).await?;
    }

    Ok(())
}
