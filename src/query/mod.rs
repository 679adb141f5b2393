//! Filter language and query documents.

pub mod expression;
pub mod input;

pub use expression::{exp, filter_input_from_json, Evaluator, Filter, FilterInput, QueryExpression, TypeGuard, Validator};
pub use input::{
    ListInput, RepoQuery, RepoQueryInput, RepositoryOptions, Sort, SortDir, SortInput, WithInput, DEFAULT_LIMIT,
    MAX_LIMIT,
};
