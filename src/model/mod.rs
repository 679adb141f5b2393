//! Declared data model: fields, entities, relations, indices and the manager
//! that binds them to one connection.

pub mod entity;
pub mod field;
pub mod index;
pub mod manager;
pub mod relation;

pub use entity::{is_identifier, Entity, EntityBuilder, EntityConfig, DEFAULT_PRIMARY};
pub use field::{Field, FieldKind, PrimaryFormat, ReferentialAction};
pub use index::EntityIndex;
pub use manager::EntityManager;
pub use relation::{Junction, Relation, RelationDirection, RelationKind, RelationPath};
