//! Entity engine: declare entities and relations at runtime, sync them to a
//! SQL schema, then read and write rows through typed repositories.

pub mod connection;
pub mod error;
pub mod id;
pub mod model;
pub mod query;
pub mod schema;
pub mod service;
pub mod settings;
pub mod sql;

pub use connection::{connect, Capabilities, Connection, PostgresConnection, Row, SqliteConnection, Statement};
pub use error::{ConfigError, DataError, QueryError};
pub use id::{id_handler_fn, IdHandler, IdHandlerRegistry, IdOutcome};
pub use model::{
    Entity, EntityBuilder, EntityConfig, EntityIndex, EntityManager, Field, FieldKind, PrimaryFormat,
    ReferentialAction, Relation, RelationKind,
};
pub use query::{exp, Filter, FilterInput, QueryExpression, RepoQuery, RepositoryOptions, Validator};
pub use schema::{SchemaSynchronizer, SyncOptions, SyncState};
pub use service::{Mutator, MutatorResponse, Repository, RepositoryResponse, RowOutcome};
pub use settings::{init_logging, Settings};
