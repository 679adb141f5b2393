//! PostgreSQL dialect over an sqlx pool.

use crate::connection::value::{bytes_to_value, check, normalize_number};
use crate::connection::{
    Capabilities, ColumnModifier, ColumnSchema, Connection, FieldSchema, IndexSchema, References, Row,
    Statement, TableSchema,
};
use crate::error::DataError;
use crate::model::{Field, FieldKind};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _};

/// Parameters are sent as text or numbers and cast in SQL (`$1::jsonb`), so
/// one binding path serves every column type.
#[derive(Clone, Debug)]
pub struct PostgresConnection {
    pool: PgPool,
}

impl PostgresConnection {
    pub fn from_pool(pool: PgPool) -> Self {
        PostgresConnection { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DataError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn prepare<'q>(statement: &'q Statement) -> Query<'q, Postgres, PgArguments> {
        let mut query = sqlx::query(&statement.sql);
        for p in &statement.parameters {
            query = bind(query, p);
        }
        query
    }
}

fn bind<'q>(query: Query<'q, Postgres, PgArguments>, v: &Value) -> Query<'q, Postgres, PgArguments> {
    match v {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
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

fn row_to_json(row: &PgRow) -> Row {
    let mut map = Row::new();
    for col in row.columns() {
        map.insert(col.name().to_string(), cell_to_value(row, col.ordinal()));
    }
    map
}

fn cell_to_value(row: &PgRow, i: usize) -> Value {
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(i) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(i) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(i) {
        return Value::Number(n.into());
    }
    if let Ok(Some(f)) = row.try_get::<Option<f32>, _>(i) {
        if let Some(n) = serde_json::Number::from_f64(f64::from(f)) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(i) {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(i) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(i) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i) {
        return Value::String(d.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(i) {
        return Value::String(d.and_utc().to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(i) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(i) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<sqlx::types::Json<Value>>, _>(i) {
        return j.0;
    }
    if let Ok(Some(b)) = row.try_get::<Option<Vec<u8>>, _>(i) {
        return bytes_to_value(&b);
    }
    Value::Null
}

#[async_trait]
impl Connection for PostgresConnection {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::POSTGRESQL
    }

    fn field_schema(&self, field: &Field) -> Option<FieldSchema> {
        let mut modifier = ColumnModifier::default();
        let column_type = match &field.kind {
            FieldKind::Virtual => return None,
            FieldKind::Primary { format, .. } => {
                modifier.primary_key = true;
                modifier.not_null = true;
                if format.is_integer() {
                    "serial"
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
                if target_format.is_integer() {
                    "integer"
                } else {
                    "text"
                }
            }
            FieldKind::Text { .. } => "text",
            FieldKind::Number { .. } => "double precision",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Datetime => "timestamptz",
            FieldKind::Json => "jsonb",
            FieldKind::Blob => "bytea",
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
            (FieldKind::Json, v) => Value::String(serde_json::to_string(&v)?),
            (_, v) => v,
        })
    }

    fn from_driver_value(&self, field: &Field, value: Value) -> Value {
        match (&field.kind, value) {
            (FieldKind::Json, Value::String(s)) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            (FieldKind::Number { .. }, v) => normalize_number(v),
            (_, v) => v,
        }
    }

    fn placeholder(&self, index: usize, field: Option<&Field>) -> String {
        let cast = match field.map(|f| &f.kind) {
            Some(FieldKind::Blob) => return format!("decode(${}, 'hex')", index),
            Some(FieldKind::Number { .. }) => "::double precision",
            Some(FieldKind::Boolean) => "::boolean",
            Some(FieldKind::Date) => "::date",
            Some(FieldKind::Datetime) => "::timestamptz",
            Some(FieldKind::Json) => "::jsonb",
            Some(FieldKind::Primary { .. }) | Some(FieldKind::Relation { .. }) => {
                match field.and_then(Field::key_format) {
                    Some(f) if f.is_integer() => "::integer",
                    _ => "",
                }
            }
            _ => "",
        };
        format!("${}{}", index, cast)
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
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            let columns: Vec<(String, String, bool)> = sqlx::query_as(
                "SELECT column_name::text, data_type::text, (is_nullable = 'NO') AS not_null \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 ORDER BY ordinal_position",
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;

            let index_rows: Vec<(String, bool, String)> = sqlx::query_as(
                "SELECT i.relname::text, ix.indisunique, a.attname::text \
                 FROM pg_class t \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 JOIN pg_index ix ON ix.indrelid = t.oid \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
                 WHERE t.relname = $1 AND n.nspname = current_schema() AND NOT ix.indisprimary \
                   AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = ix.indexrelid) \
                 ORDER BY i.relname, array_position(ix.indkey::int2[], a.attnum)",
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;

            let references: Vec<(String,)> = sqlx::query_as(
                "SELECT DISTINCT r.relname::text \
                 FROM pg_constraint c \
                 JOIN pg_class t ON t.oid = c.conrelid \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 JOIN pg_class r ON r.oid = c.confrelid \
                 WHERE c.contype = 'f' AND t.relname = $1 AND n.nspname = current_schema() \
                 ORDER BY 1",
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;

            let mut indexes: Vec<IndexSchema> = Vec::new();
            for (index_name, unique, column) in index_rows {
                match indexes.last_mut() {
                    Some(last) if last.name == index_name => last.columns.push(column),
                    _ => indexes.push(IndexSchema {
                        name: index_name,
                        columns: vec![column],
                        unique,
                    }),
                }
            }

            tables.push(TableSchema {
                name,
                columns: columns
                    .into_iter()
                    .map(|(name, data_type, not_null)| ColumnSchema {
                        name,
                        data_type,
                        not_null,
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
    use crate::model::PrimaryFormat;
    use serde_json::json;

    fn conn() -> PostgresConnection {
        // connect_lazy never touches the network until a query runs
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        PostgresConnection::from_pool(pool)
    }

    #[tokio::test]
    async fn placeholders_carry_casts() {
        let c = conn();
        assert_eq!(c.placeholder(1, None), "$1");
        assert_eq!(c.placeholder(2, Some(&Field::json("meta"))), "$2::jsonb");
        assert_eq!(c.placeholder(3, Some(&Field::blob("b"))), "decode($3, 'hex')");
        assert_eq!(c.placeholder(4, Some(&Field::primary("id", PrimaryFormat::Integer))), "$4::integer");
        assert_eq!(c.placeholder(5, Some(&Field::primary("id", PrimaryFormat::Uuid))), "$5");
        assert_eq!(c.placeholder(6, Some(&Field::datetime("at"))), "$6::timestamptz");
    }

    #[tokio::test]
    async fn serial_primary_key() {
        let c = conn();
        let schema = c.field_schema(&Field::primary("id", PrimaryFormat::Integer)).unwrap();
        assert_eq!(c.column_definition(&schema), "\"id\" serial PRIMARY KEY NOT NULL");
        let schema = c.field_schema(&Field::number("score")).unwrap();
        assert_eq!(c.column_definition(&schema), "\"score\" double precision");
    }

    #[tokio::test]
    async fn booleans_stay_native() {
        let c = conn();
        assert_eq!(c.to_driver_value(&Field::boolean("b"), json!(1)).unwrap(), json!(true));
        assert_eq!(
            c.to_driver_value(&Field::json("j"), json!([1])).unwrap(),
            json!("[1]")
        );
        assert_eq!(c.from_driver_value(&Field::number("n"), json!(3.0)), json!(3));
    }
}
