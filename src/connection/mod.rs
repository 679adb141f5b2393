//! Connection abstraction: one trait, one implementation per SQL dialect.
//!
//! The repository, mutator and synchronizer only talk to [`Connection`]; type
//! mapping, value coercion, placeholders and execution live behind it.

mod postgres;
mod sqlite;
pub mod value;

pub use postgres::PostgresConnection;
pub use sqlite::SqliteConnection;

use crate::error::DataError;
use crate::model::{Field, ReferentialAction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A result row keyed by column name.
pub type Row = Map<String, Value>;

/// SQL text plus positional parameters. Serialized as `{sql, parameters}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub parameters: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Statement {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(sql: impl Into<String>, parameters: Vec<Value>) -> Self {
        Statement {
            sql: sql.into(),
            parameters,
        }
    }
}

/// What a backend can do beyond the common interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Sends several statements as one batch. Without it `execute_queries`
    /// still runs them in a single transaction.
    pub batching: bool,
    /// Extra scans (COUNT for totals) are cheap enough to run per query.
    pub softscans: bool,
}

impl Capabilities {
    pub const SQLITE: Self = Self {
        batching: true,
        softscans: true,
    };

    pub const POSTGRESQL: Self = Self {
        batching: false,
        ..Self::SQLITE
    };
}

#[derive(Clone, Debug, PartialEq)]
pub struct References {
    pub table: String,
    pub column: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnModifier {
    pub primary_key: bool,
    pub auto_increment: bool,
    pub not_null: bool,
    pub references: Option<References>,
}

/// Column declaration for one field: `(name, type, modifier)`.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub column_type: String,
    pub modifier: ColumnModifier,
}

/// Live table as seen by introspection.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexSchema>,
    /// Tables this one holds foreign keys to.
    pub references: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Dialect-specific execution and type-mapping boundary around a live database handle.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Dialect name, e.g. `"sqlite"`.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Column declaration for `field`; `None` for fields without a column.
    fn field_schema(&self, field: &Field) -> Option<FieldSchema>;

    /// Render a column definition for CREATE TABLE / ADD COLUMN.
    fn column_definition(&self, schema: &FieldSchema) -> String {
        let mut def = format!("{} {}", self.quote(&schema.name), schema.column_type);
        let m = &schema.modifier;
        if m.primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if m.auto_increment {
            def.push_str(" AUTOINCREMENT");
        }
        if m.not_null {
            def.push_str(" NOT NULL");
        }
        if let Some(r) = &m.references {
            def.push_str(&format!(
                " REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
                self.quote(&r.table),
                self.quote(&r.column),
                r.on_delete.as_sql(),
                r.on_update.as_sql()
            ));
        }
        def
    }

    /// Check and encode a caller value for storage in `field`.
    fn to_driver_value(&self, field: &Field, value: Value) -> Result<Value, DataError>;

    /// Decode a stored value read from `field`'s column.
    fn from_driver_value(&self, field: &Field, value: Value) -> Value;

    /// Placeholder for the 1-based parameter `index`, typed for `field` when given.
    fn placeholder(&self, index: usize, field: Option<&Field>) -> String;

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Run a statement that returns rows.
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, DataError>;

    /// Run a statement, returning the affected row count.
    async fn execute(&self, statement: &Statement) -> Result<u64, DataError>;

    /// Run statements in order inside one transaction. The first failure rolls
    /// back the transaction and is reported as [`DataError::StatementFailed`].
    async fn execute_queries(&self, statements: &[Statement]) -> Result<Vec<u64>, DataError>;

    /// Tables, columns and explicitly created indexes of the live database.
    async fn introspect(&self) -> Result<Vec<TableSchema>, DataError>;

    async fn close(&self);
}

/// Open a connection, choosing the dialect from the URL scheme.
pub async fn connect(url: &str, max_connections: u32) -> Result<Arc<dyn Connection>, DataError> {
    if url.starts_with("sqlite:") {
        let conn = if url.contains(":memory:") {
            SqliteConnection::memory().await?
        } else {
            SqliteConnection::connect(url, max_connections).await?
        };
        Ok(Arc::new(conn))
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        Ok(Arc::new(PostgresConnection::connect(url, max_connections).await?))
    } else {
        Err(DataError::UnsupportedUrl(url.to_string()))
    }
}
