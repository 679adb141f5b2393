//! SQLite dialect over an sqlx pool.

use crate::connection::value::{bytes_to_value, check, normalize_number};
use crate::connection::{
    Capabilities, ColumnModifier, ColumnSchema, Connection, FieldSchema, IndexSchema, References, Row,
    Statement, TableSchema,
};
use crate::error::DataError;
use crate::model::{Field, FieldKind, PrimaryFormat};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, Sqlite};
use std::str::FromStr;

/// SQLite has no native boolean or JSON type: booleans are stored as 0/1
/// integers and JSON as text, both converted at this boundary.
#[derive(Clone, Debug)]
pub struct SqliteConnection {
    pool: SqlitePool,
}

impl SqliteConnection {
    pub fn from_pool(pool: SqlitePool) -> Self {
        SqliteConnection { pool }
    }

    /// Open (creating if missing) a database file, e.g. `sqlite://data.db`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DataError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database. One pinned connection keeps the data alive.
    pub async fn memory() -> Result<Self, DataError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn prepare<'q>(statement: &'q Statement) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        let mut query = sqlx::query(&statement.sql);
        for p in &statement.parameters {
            query = bind(query, p);
        }
        query
    }
}

fn bind<'q>(query: Query<'q, Sqlite, SqliteArguments<'q>>, v: &Value) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match v {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_json(row: &SqliteRow) -> Row {
    let mut map = Row::new();
    for (i, col) in row.columns().iter().enumerate() {
        map.insert(col.name().to_string(), cell_to_value(row, i));
    }
    map
}

fn cell_to_value(row: &SqliteRow, i: usize) -> Value {
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(i) {
        return Value::Number(n.into());
    }
    if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(i) {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(i) {
        return Value::String(s);
    }
    if let Ok(Some(b)) = row.try_get::<Option<Vec<u8>>, _>(i) {
        return bytes_to_value(&b);
    }
    Value::Null
}

#[async_trait]
impl Connection for SqliteConnection {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SQLITE
    }

    fn field_schema(&self, field: &Field) -> Option<FieldSchema> {
        let mut modifier = ColumnModifier::default();
        let column_type = match &field.kind {
            FieldKind::Virtual => return None,
            FieldKind::Primary { format, .. } => {
                modifier.primary_key = true;
                modifier.not_null = true;
                if format.is_integer() {
                    modifier.auto_increment = true;
                    "integer"
                } else {
                    "text"
                }
            }
            FieldKind::Relation {
                target,
                target_key,
                target_format,
                on_delete,
                on_update,
            } => {
                modifier.references = Some(References {
                    table: target.clone(),
                    column: target_key.clone(),
                    on_delete: *on_delete,
                    on_update: *on_update,
                });
                if *target_format == PrimaryFormat::Integer {
                    "integer"
                } else {
                    "text"
                }
            }
            FieldKind::Text { .. } | FieldKind::Date | FieldKind::Datetime | FieldKind::Json => "text",
            FieldKind::Number { .. } => "numeric",
            FieldKind::Boolean => "integer",
            FieldKind::Blob => "blob",
        };
        Some(FieldSchema {
            name: field.name.clone(),
            column_type: column_type.to_string(),
            modifier,
        })
    }

    fn to_driver_value(&self, field: &Field, value: Value) -> Result<Value, DataError> {
        let value = check(field, value)?;
        Ok(match (&field.kind, value) {
            (_, Value::Null) => Value::Null,
            (FieldKind::Boolean, Value::Bool(b)) => Value::Number(i64::from(b).into()),
            (FieldKind::Json, v) => Value::String(serde_json::to_string(&v)?),
            (_, v) => v,
        })
    }

    fn from_driver_value(&self, field: &Field, value: Value) -> Value {
        match (&field.kind, value) {
            (FieldKind::Boolean, Value::Number(n)) if n.as_i64() == Some(1) => Value::Bool(true),
            (FieldKind::Boolean, Value::Number(n)) if n.as_i64() == Some(0) => Value::Bool(false),
            (FieldKind::Json, Value::String(s)) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            (FieldKind::Number { .. }, v) => normalize_number(v),
            (_, v) => v,
        }
    }

    fn placeholder(&self, _index: usize, field: Option<&Field>) -> String {
        match field.map(|f| &f.kind) {
            Some(FieldKind::Blob) => "unhex(?)".to_string(),
            _ => "?".to_string(),
        }
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, DataError> {
        tracing::debug!(sql = %statement.sql, params = ?statement.parameters, "query");
        let rows = Self::prepare(statement).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, DataError> {
        tracing::debug!(sql = %statement.sql, params = ?statement.parameters, "execute");
        let done = Self::prepare(statement).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn execute_queries(&self, statements: &[Statement]) -> Result<Vec<u64>, DataError> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            tracing::debug!(sql = %statement.sql, params = ?statement.parameters, "execute (tx)");
            match Self::prepare(statement).execute(&mut *tx).await {
                Ok(done) => out.push(done.rows_affected()),
                Err(source) => {
                    tracing::warn!(index, sql = %statement.sql, error = %source, "statement failed, rolling back");
                    return Err(DataError::StatementFailed {
                        index,
                        sql: statement.sql.clone(),
                        source,
                    });
                }
            }
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn introspect(&self) -> Result<Vec<TableSchema>, DataError> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            let columns: Vec<(String, String, i64)> =
                sqlx::query_as("SELECT name, type, \"notnull\" FROM pragma_table_info(?) ORDER BY cid")
                    .bind(&name)
                    .fetch_all(&self.pool)
                    .await?;
            let index_list: Vec<(String, i64)> = sqlx::query_as(
                "SELECT name, \"unique\" FROM pragma_index_list(?) WHERE origin = 'c' ORDER BY name",
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;

            let references: Vec<(String,)> =
                sqlx::query_as("SELECT DISTINCT \"table\" FROM pragma_foreign_key_list(?) ORDER BY 1")
                    .bind(&name)
                    .fetch_all(&self.pool)
                    .await?;

            let mut indexes = Vec::with_capacity(index_list.len());
            for (index_name, unique) in index_list {
                let cols: Vec<(String,)> =
                    sqlx::query_as("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
                        .bind(&index_name)
                        .fetch_all(&self.pool)
                        .await?;
                indexes.push(IndexSchema {
                    name: index_name,
                    columns: cols.into_iter().map(|(c,)| c).collect(),
                    unique: unique != 0,
                });
            }

            tables.push(TableSchema {
                name,
                columns: columns
                    .into_iter()
                    .map(|(name, data_type, not_null)| ColumnSchema {
                        name,
                        data_type: data_type.to_lowercase(),
                        not_null: not_null != 0,
                    })
                    .collect(),
                indexes,
                references: references.into_iter().map(|(t,)| t).collect(),
            });
        }
        Ok(tables)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReferentialAction;
    use serde_json::json;

    #[tokio::test]
    async fn primary_integer_is_autoincrement() {
        let conn = SqliteConnection::memory().await.unwrap();
        let schema = conn.field_schema(&Field::primary("id", PrimaryFormat::Integer)).unwrap();
        assert_eq!(
            conn.column_definition(&schema),
            "\"id\" integer PRIMARY KEY AUTOINCREMENT NOT NULL"
        );
        let schema = conn.field_schema(&Field::primary("id", PrimaryFormat::Uuid)).unwrap();
        assert_eq!(conn.column_definition(&schema), "\"id\" text PRIMARY KEY NOT NULL");
    }

    #[tokio::test]
    async fn relation_renders_references() {
        let conn = SqliteConnection::memory().await.unwrap();
        let f = Field::relation("users_id", "users", PrimaryFormat::Integer).on_delete(ReferentialAction::Cascade);
        let schema = conn.field_schema(&f).unwrap();
        assert_eq!(
            conn.column_definition(&schema),
            "\"users_id\" integer REFERENCES \"users\" (\"id\") ON DELETE CASCADE ON UPDATE NO ACTION"
        );
        assert!(conn.field_schema(&Field::virtual_field("v")).is_none());
    }

    #[tokio::test]
    async fn booleans_round_trip_as_integers() {
        let conn = SqliteConnection::memory().await.unwrap();
        let f = Field::boolean("active");
        assert_eq!(conn.to_driver_value(&f, json!(true)).unwrap(), json!(1));
        assert_eq!(conn.from_driver_value(&f, json!(1)), json!(true));
        assert_eq!(conn.from_driver_value(&f, json!(0)), json!(false));
        // only boolean fields convert
        assert_eq!(conn.from_driver_value(&Field::number("n"), json!(1)), json!(1));
    }

    #[tokio::test]
    async fn json_is_stored_as_text() {
        let conn = SqliteConnection::memory().await.unwrap();
        let f = Field::json("meta");
        let stored = conn.to_driver_value(&f, json!({"a": [1, 2]})).unwrap();
        assert_eq!(stored, json!("{\"a\":[1,2]}"));
        assert_eq!(conn.from_driver_value(&f, stored), json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn execute_queries_rolls_back_on_failure() {
        let conn = SqliteConnection::memory().await.unwrap();
        let err = conn
            .execute_queries(&[
                Statement::new("CREATE TABLE a (x integer)"),
                Statement::new("CREATE TABLE broken ("),
            ])
            .await
            .unwrap_err();
        match err {
            DataError::StatementFailed { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(conn.introspect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn introspects_tables_and_indexes() {
        let conn = SqliteConnection::memory().await.unwrap();
        conn.execute_queries(&[
            Statement::new("CREATE TABLE \"users\" (\"id\" integer PRIMARY KEY AUTOINCREMENT NOT NULL, \"email\" text)"),
            Statement::new("CREATE UNIQUE INDEX \"idx_users_email\" ON \"users\" (\"email\")"),
        ])
        .await
        .unwrap();
        let tables = conn.introspect().await.unwrap();
        assert_eq!(tables.len(), 1);
        let users = &tables[0];
        assert_eq!(users.name, "users");
        assert!(users.column("email").is_some());
        let idx = users.index("idx_users_email").unwrap();
        assert!(idx.unique);
        assert_eq!(idx.columns, vec!["email".to_string()]);
    }

    #[tokio::test]
    async fn query_returns_json_rows() {
        let conn = SqliteConnection::memory().await.unwrap();
        conn.execute(&Statement::new("CREATE TABLE t (a integer, b text, c real, d blob)"))
            .await
            .unwrap();
        conn.execute(&Statement::with_parameters(
            "INSERT INTO t (a, b, c, d) VALUES (?, ?, ?, unhex(?))",
            vec![json!(1), json!("x"), json!(1.5), json!("01ff")],
        ))
        .await
        .unwrap();
        let rows = conn.query(&Statement::new("SELECT a, b, c, d FROM t")).await.unwrap();
        assert_eq!(rows[0]["a"], json!(1));
        assert_eq!(rows[0]["b"], json!("x"));
        assert_eq!(rows[0]["c"], json!(1.5));
        assert_eq!(rows[0]["d"], json!("01ff"));
    }
}
