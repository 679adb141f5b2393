//! Typed errors: construction, query validation and runtime failures.

use thiserror::Error;

/// Raised while declaring entities, relations, validators or handlers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid identifier '{0}'")]
    InvalidName(String),
    #[error("entity '{entity}': field '{field}' declared twice with different configuration")]
    ConflictingField { entity: String, field: String },
    #[error("entity '{entity}': more than one primary field ({first}, {second})")]
    MultiplePrimary {
        entity: String,
        first: String,
        second: String,
    },
    #[error("entity '{0}' already registered with a different configuration")]
    ConflictingEntity(String),
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("entity '{entity}' has no field '{field}'")]
    UnknownField { entity: String, field: String },
    #[error("relation: {0}")]
    Relation(String),
    #[error("index: {0}")]
    Index(String),
    #[error("invalid query expression '{0}': key must start with '$'")]
    InvalidExpression(String),
    #[error("duplicate query expression '{0}'")]
    DuplicateExpression(String),
    #[error("validator requires an '$eq' expression")]
    MissingEqExpression,
    #[error("id handler '{0}' already registered with a different handler")]
    HandlerConflict(String),
    #[error("id handler '{key}' rejected its config: {message}")]
    HandlerConfig { key: String, message: String },
    #[error("entity document: {0}")]
    Document(String),
    #[error("environment variable {key}: {message}")]
    Env { key: String, message: String },
}

/// Raised when a filter or query document fails validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("filter on '{field}': {reason}")]
    InvalidFilter { field: String, reason: String },
    #[error("filter on '{field}': operator '{operator}' {reason}")]
    InvalidOperator {
        field: String,
        operator: String,
        reason: String,
    },
    #[error("'{0}' is reserved and not accepted as a filter key")]
    ReservedKey(String),
    #[error("where must be an object or a JSON-encoded object: {0}")]
    InvalidWhere(String),
    #[error("query '{field}': {reason}")]
    InvalidQuery { field: String, reason: String },
    #[error("entity '{entity}' has no field '{field}'")]
    UnknownField { entity: String, field: String },
    #[error("entity '{entity}' has no relation '{relation}'")]
    UnknownRelation { entity: String, relation: String },
    #[error("relation '{0}' can not be joined (only to-one relations are joinable)")]
    NotJoinable(String),
    #[error("operator '{0}' has no SQL translation")]
    UnsupportedOperator(String),
}

/// Runtime error for repository, mutator, connection and synchronizer calls.
#[derive(Error, Debug)]
pub enum DataError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("id generation for '{entity}' failed: {message}")]
    IdGeneration { entity: String, message: String },
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("statement {index} failed ({sql}): {source}")]
    StatementFailed {
        index: usize,
        sql: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported database url '{0}'")]
    UnsupportedUrl(String),
}

impl DataError {
    /// Stable machine-readable code, used in row outcomes and logs.
    pub fn code(&self) -> &'static str {
        match self {
            DataError::Config(_) => "config_error",
            DataError::Query(_) => "query_error",
            DataError::Validation(_) => "validation_error",
            DataError::NotFound(_) => "not_found",
            DataError::IdGeneration { .. } => "id_generation_error",
            DataError::Db(_) | DataError::StatementFailed { .. } => "database_error",
            DataError::Json(_) => "json_error",
            DataError::UnsupportedUrl(_) => "config_error",
        }
    }
}
