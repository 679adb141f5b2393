//! Example consumer: a separate Rust project that uses entity-engine as a dependency.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Or from this directory: `cargo run`

use entity_engine::{
    connect, init_logging, Connection, Entity, EntityConfig, EntityManager, Field, IdHandlerRegistry, RepoQuery, Settings,
    SyncOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    init_logging("entity_engine=info");

    let connection = connect(&settings.database_url, settings.max_connections).await?;
    let mut manager = EntityManager::new(connection.clone(), IdHandlerRegistry::new())
        .with_options(settings.repository_options());

    manager.add_entity(Entity::new(
        "users",
        [
            Field::text("username").required().default_value("nobody"),
            Field::text("email").max_length(3),
        ],
        EntityConfig::default(),
    )?)?;

    let planned = manager.synchronizer().sync(SyncOptions::dry_run()).await?;
    println!("{}", serde_json::to_string_pretty(&planned)?);

    let applied = manager.synchronizer().sync(SyncOptions::force()).await?;
    tracing::info!(statements = applied.len(), "schema applied");

    let users = manager.repository("users")?;
    let found = users.find_many(&RepoQuery::default()).await?;
    println!("{}", serde_json::to_string_pretty(&found)?);

    connection.close().await;
    Ok(())
}
