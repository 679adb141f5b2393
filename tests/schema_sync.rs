use entity_engine::{
    Connection, Entity, EntityConfig, EntityIndex, EntityManager, Field, IdHandlerRegistry, Relation, SqliteConnection,
    SyncOptions, SyncState,
};
use std::sync::Arc;

async fn memory() -> Arc<dyn Connection> {
    Arc::new(SqliteConnection::memory().await.unwrap())
}

fn users() -> Entity {
    Entity::new(
        "users",
        [
            Field::text("username").required().default_value("nobody"),
            Field::text("email").max_length(3),
        ],
        EntityConfig::default(),
    )
    .unwrap()
}

fn posts() -> Entity {
    Entity::new("posts", [Field::text("title").required()], EntityConfig::default()).unwrap()
}

#[tokio::test]
async fn dry_run_plans_without_executing() {
    let conn = memory().await;
    let mut manager = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    manager.add_entity(users()).unwrap();

    let mut sync = manager.synchronizer();
    let planned = sync.sync(SyncOptions::dry_run()).await.unwrap();
    assert_eq!(sync.state(), SyncState::Idle);
    assert_eq!(planned.len(), 1);
    assert!(planned[0].sql.starts_with("CREATE TABLE \"users\""));
    assert!(planned[0].parameters.is_empty());

    assert!(conn.introspect().await.unwrap().is_empty());
}

#[tokio::test]
async fn force_then_sync_again_is_empty() {
    let conn = memory().await;
    let mut manager = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    manager.add_entities([users(), posts()]).unwrap();
    manager.add_relation(Relation::one_to_many("users", "posts")).unwrap();
    manager
        .add_index(EntityIndex::new("users", ["username"]).unique())
        .unwrap();

    let applied = manager.synchronizer().sync(SyncOptions::force()).await.unwrap();
    assert_eq!(applied.len(), 3);
    // referenced table is created first
    assert!(applied[0].sql.starts_with("CREATE TABLE \"users\""));
    assert!(applied[1].sql.starts_with("CREATE TABLE \"posts\""));
    assert!(applied[2].sql.starts_with("CREATE UNIQUE INDEX \"idx_users_username\""));

    let live = conn.introspect().await.unwrap();
    let posts = live.iter().find(|t| t.name == "posts").unwrap();
    assert!(posts.column("users_id").is_some());

    let again = manager.synchronizer().sync(SyncOptions::force()).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn new_fields_become_add_column() {
    let conn = memory().await;
    let mut first = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    first.add_entity(posts()).unwrap();
    first.synchronizer().sync(SyncOptions::force()).await.unwrap();

    let mut second = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    second
        .add_entity(
            Entity::new(
                "posts",
                [Field::text("title").required(), Field::number("rating")],
                EntityConfig::default(),
            )
            .unwrap(),
        )
        .unwrap();
    let planned = second.synchronizer().sync(SyncOptions::dry_run()).await.unwrap();
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].sql, "ALTER TABLE \"posts\" ADD COLUMN \"rating\" numeric");
}

#[tokio::test]
async fn drop_removes_undeclared_tables_only_when_asked() {
    let conn = memory().await;
    let mut full = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    full.add_entities([users(), posts()]).unwrap();
    full.synchronizer().sync(SyncOptions::force()).await.unwrap();

    let mut reduced = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    reduced.add_entity(users()).unwrap();

    let keep = reduced.synchronizer().sync(SyncOptions::dry_run()).await.unwrap();
    assert!(keep.is_empty());

    let dropped = reduced
        .synchronizer()
        .sync(SyncOptions::force().with_drop())
        .await
        .unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].sql, "DROP TABLE \"posts\"");

    let live = conn.introspect().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].name, "users");
}

#[tokio::test]
async fn failed_apply_leaves_schema_untouched() {
    let conn = memory().await;
    conn.execute(&entity_engine::Statement::new("CREATE TABLE \"posts\" (\"id\" integer PRIMARY KEY)"))
        .await
        .unwrap();

    // the index name collides with an existing table, so the last statement fails
    let mut manager = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    manager
        .add_entity(Entity::new("archive", [Field::text("body")], EntityConfig::default()).unwrap())
        .unwrap();
    manager
        .add_entity(
            Entity::new("posts", [Field::text("title").required()], EntityConfig::default()).unwrap(),
        )
        .unwrap();
    manager
        .add_index(EntityIndex::new("posts", ["title"]).named("idx_broken"))
        .unwrap();
    conn.execute(&entity_engine::Statement::new("CREATE TABLE \"idx_broken\" (\"x\" text)"))
        .await
        .unwrap();

    let mut sync = manager.synchronizer();
    let err = sync.sync(SyncOptions::force()).await.unwrap_err();
    assert_eq!(err.code(), "database_error");
    assert_eq!(sync.state(), SyncState::Idle);

    let live = conn.introspect().await.unwrap();
    assert!(live.iter().all(|t| t.name != "archive"));
    let posts = live.iter().find(|t| t.name == "posts").unwrap();
    assert!(posts.column("title").is_none());
}

#[tokio::test]
async fn drop_removes_referencing_tables_first() {
    let conn = memory().await;
    for sql in [
        "CREATE TABLE \"zoo\" (\"id\" integer PRIMARY KEY)",
        "CREATE TABLE \"apple\" (\"id\" integer PRIMARY KEY, \"zoo_id\" integer REFERENCES \"zoo\" (\"id\") ON DELETE NO ACTION)",
        "INSERT INTO \"zoo\" (\"id\") VALUES (1)",
        "INSERT INTO \"apple\" (\"id\", \"zoo_id\") VALUES (1, 1)",
    ] {
        conn.execute(&entity_engine::Statement::new(sql)).await.unwrap();
    }
    let live = conn.introspect().await.unwrap();
    let apple = live.iter().find(|t| t.name == "apple").unwrap();
    assert_eq!(apple.references, vec!["zoo".to_string()]);

    let mut manager = EntityManager::new(conn.clone(), IdHandlerRegistry::new());
    manager.add_entity(users()).unwrap();
    let applied = manager
        .synchronizer()
        .sync(SyncOptions::force().with_drop())
        .await
        .unwrap();
    let sql: Vec<&str> = applied.iter().map(|s| s.sql.as_str()).collect();
    assert_eq!(sql.len(), 3);
    assert!(sql[0].starts_with("CREATE TABLE \"users\""));
    assert_eq!(sql[1..].to_vec(), vec!["DROP TABLE \"apple\"", "DROP TABLE \"zoo\""]);

    let live = conn.introspect().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].name, "users");
}
