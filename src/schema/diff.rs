//! Declared model vs. live schema: ordered DDL to reconcile them.

use crate::connection::{Connection, Statement, TableSchema};
use crate::model::{Entity, EntityIndex, FieldKind};
use std::collections::{HashMap, HashSet};

/// Entities ordered so that referenced tables come before the tables holding
/// foreign keys to them. Cycles and self references keep declaration order.
pub fn dependency_order(entities: &[Entity]) -> Vec<&Entity> {
    let declared: HashSet<&str> = entities.iter().map(Entity::name).collect();
    let deps: HashMap<&str, HashSet<&str>> = entities
        .iter()
        .map(|e| {
            let targets = e
                .fields()
                .iter()
                .filter_map(|f| match &f.kind {
                    FieldKind::Relation { target, .. } => Some(target.as_str()),
                    _ => None,
                })
                .filter(|t| *t != e.name() && declared.contains(t))
                .collect();
            (e.name(), targets)
        })
        .collect();

    let mut placed: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(entities.len());
    while ordered.len() < entities.len() {
        let next = entities
            .iter()
            .find(|e| !placed.contains(e.name()) && deps[e.name()].iter().all(|d| placed.contains(d)))
            // a cycle: break it at the first unplaced entity
            .or_else(|| entities.iter().find(|e| !placed.contains(e.name())));
        let Some(e) = next else { break };
        placed.insert(e.name());
        ordered.push(e);
    }
    ordered
}

/// Live tables ordered so that every table comes before the tables it references.
/// Dropping in this order never removes a parent while a child still points at it.
pub fn drop_order<'a>(tables: &[&'a TableSchema]) -> Vec<&'a TableSchema> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(tables.len());
    while ordered.len() < tables.len() {
        let referenced = |name: &str| {
            tables
                .iter()
                .any(|t| t.name != name && !placed.contains(t.name.as_str()) && t.references.iter().any(|r| r == name))
        };
        let next = tables
            .iter()
            .find(|t| !placed.contains(t.name.as_str()) && !referenced(&t.name))
            .or_else(|| tables.iter().find(|t| !placed.contains(t.name.as_str())));
        let Some(t) = next else { break };
        placed.insert(t.name.as_str());
        ordered.push(*t);
    }
    ordered
}

pub fn create_table(conn: &dyn Connection, entity: &Entity) -> Statement {
    let defs: Vec<String> = entity
        .fields()
        .iter()
        .filter_map(|f| conn.field_schema(f))
        .map(|s| conn.column_definition(&s))
        .collect();
    Statement::new(format!(
        "CREATE TABLE {} (\n  {}\n)",
        conn.quote(entity.name()),
        defs.join(",\n  ")
    ))
}

pub fn create_index(conn: &dyn Connection, index: &EntityIndex) -> Statement {
    let cols: Vec<String> = index.fields.iter().map(|c| conn.quote(c)).collect();
    Statement::new(format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        conn.quote(&index.name),
        conn.quote(&index.entity),
        cols.join(", ")
    ))
}

pub fn drop_index(conn: &dyn Connection, name: &str) -> Statement {
    Statement::new(format!("DROP INDEX {}", conn.quote(name)))
}

/// Statements turning `live` into the declared model, in execution order:
/// create tables, add columns, (re)create indexes, then the drops allowed by `drop`.
pub fn plan(
    conn: &dyn Connection,
    entities: &[Entity],
    indices: &[EntityIndex],
    live: &[TableSchema],
    drop: bool,
) -> Vec<Statement> {
    let live_by_name: HashMap<&str, &TableSchema> = live.iter().map(|t| (t.name.as_str(), t)).collect();
    let ordered = dependency_order(entities);
    let mut creates = Vec::new();
    let mut adds = Vec::new();
    let mut index_ops = Vec::new();
    let mut drops = Vec::new();

    for entity in &ordered {
        match live_by_name.get(entity.name()) {
            None => creates.push(create_table(conn, entity)),
            Some(table) => {
                for schema in entity.fields().iter().filter_map(|f| conn.field_schema(f)) {
                    if table.column(&schema.name).is_none() {
                        adds.push(Statement::new(format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            conn.quote(entity.name()),
                            conn.column_definition(&schema)
                        )));
                    }
                }
            }
        }
    }

    for index in indices {
        let existing = live_by_name.get(index.entity.as_str()).and_then(|t| t.index(&index.name));
        match existing {
            None => index_ops.push(create_index(conn, index)),
            Some(live) if live.columns != index.fields || live.unique != index.unique => {
                index_ops.push(drop_index(conn, &index.name));
                index_ops.push(create_index(conn, index));
            }
            Some(_) => {}
        }
    }

    if drop {
        let declared_indexes: HashSet<&str> = indices.iter().map(|i| i.name.as_str()).collect();
        for entity in &ordered {
            let Some(table) = live_by_name.get(entity.name()) else { continue };
            for index in &table.indexes {
                if !declared_indexes.contains(index.name.as_str()) {
                    drops.push(drop_index(conn, &index.name));
                }
            }
        }
        for entity in &ordered {
            let Some(table) = live_by_name.get(entity.name()) else { continue };
            for column in &table.columns {
                if !entity.field(&column.name).is_some_and(|f| f.is_stored()) {
                    drops.push(Statement::new(format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        conn.quote(entity.name()),
                        conn.quote(&column.name)
                    )));
                }
            }
        }
        let declared: HashSet<&str> = entities.iter().map(Entity::name).collect();
        let undeclared: Vec<&TableSchema> = live.iter().filter(|t| !declared.contains(t.name.as_str())).collect();
        for table in drop_order(&undeclared) {
            drops.push(Statement::new(format!("DROP TABLE {}", conn.quote(&table.name))));
        }
    }

    creates.into_iter().chain(adds).chain(index_ops).chain(drops).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ColumnSchema, IndexSchema, SqliteConnection};
    use crate::model::{EntityConfig, Field, PrimaryFormat};

    fn entity(name: &str, fields: Vec<Field>) -> Entity {
        Entity::new(name, fields, EntityConfig::default()).unwrap()
    }

    fn blog() -> Vec<Entity> {
        vec![
            entity(
                "comments",
                vec![Field::relation("posts_id", "posts", PrimaryFormat::Integer)],
            ),
            entity("posts", vec![Field::relation("users_id", "users", PrimaryFormat::Integer)]),
            entity("users", vec![Field::text("username")]),
        ]
    }

    fn live_table(name: &str, columns: &[&str]) -> TableSchema {
        TableSchema {
            name: name.into(),
            columns: columns
                .iter()
                .map(|c| ColumnSchema {
                    name: c.to_string(),
                    data_type: "text".into(),
                    not_null: false,
                })
                .collect(),
            indexes: Vec::new(),
            references: Vec::new(),
        }
    }

    #[test]
    fn referenced_tables_come_first() {
        let entities = blog();
        let names: Vec<&str> = dependency_order(&entities).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["users", "posts", "comments"]);
    }

    #[test]
    fn cycles_still_place_everything() {
        let entities = vec![
            entity("a", vec![Field::relation("b_id", "b", PrimaryFormat::Integer)]),
            entity("b", vec![Field::relation("a_id", "a", PrimaryFormat::Integer)]),
        ];
        assert_eq!(dependency_order(&entities).len(), 2);
    }

    #[tokio::test]
    async fn empty_database_gets_creates() {
        let conn = SqliteConnection::memory().await.unwrap();
        let entities = blog();
        let stmts = plan(&conn, &entities, &[], &[], false);
        assert_eq!(stmts.len(), 3);
        assert_eq!(
            stmts[0].sql,
            "CREATE TABLE \"users\" (\n  \"id\" integer PRIMARY KEY AUTOINCREMENT NOT NULL,\n  \"username\" text\n)"
        );
        assert!(stmts[1].sql.starts_with("CREATE TABLE \"posts\""));
    }

    #[tokio::test]
    async fn missing_columns_are_added_and_extras_kept_without_drop() {
        let conn = SqliteConnection::memory().await.unwrap();
        let entities = vec![entity("users", vec![Field::text("username"), Field::text("email")])];
        let live = vec![live_table("users", &["id", "username", "legacy"]), live_table("old", &["id"])];
        let stmts = plan(&conn, &entities, &[], &live, false);
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].sql, "ALTER TABLE \"users\" ADD COLUMN \"email\" text");

        let stmts = plan(&conn, &entities, &[], &live, true);
        let sql: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"users\" ADD COLUMN \"email\" text",
                "ALTER TABLE \"users\" DROP COLUMN \"legacy\"",
                "DROP TABLE \"old\"",
            ]
        );
    }

    #[test]
    fn children_are_dropped_before_parents() {
        let mut apple = live_table("apple", &["id", "zoo_id"]);
        apple.references.push("zoo".into());
        let zoo = live_table("zoo", &["id"]);
        let mut core = live_table("core", &["id", "apple_id"]);
        core.references.push("apple".into());
        let names: Vec<&str> = drop_order(&[&apple, &core, &zoo]).iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["core", "apple", "zoo"]);
    }

    #[tokio::test]
    async fn changed_indexes_are_recreated() {
        let conn = SqliteConnection::memory().await.unwrap();
        let entities = vec![entity("users", vec![Field::text("username"), Field::text("email")])];
        let mut live = live_table("users", &["id", "username", "email"]);
        live.indexes.push(IndexSchema {
            name: "idx_users_email".into(),
            columns: vec!["email".into()],
            unique: false,
        });
        live.indexes.push(IndexSchema {
            name: "idx_stale".into(),
            columns: vec!["username".into()],
            unique: false,
        });
        let indices = vec![EntityIndex::new("users", ["email"]).unique()];
        let stmts = plan(&conn, &entities, &indices, &[live.clone()], false);
        let sql: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "DROP INDEX \"idx_users_email\"",
                "CREATE UNIQUE INDEX \"idx_users_email\" ON \"users\" (\"email\")",
            ]
        );
        let stmts = plan(&conn, &entities, &indices, &[live], true);
        assert_eq!(stmts.last().unwrap().sql, "DROP INDEX \"idx_stale\"");
    }
}
