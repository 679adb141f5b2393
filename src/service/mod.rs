//! Repository and mutator: semantic reads and writes compiled to statements.

mod mutator;
mod repository;
pub mod validation;

pub use mutator::{Mutator, MutatorMeta, MutatorResponse, RowOutcome};
pub use repository::{Repository, RepositoryMeta, RepositoryResponse};
pub use validation::RowValidator;
