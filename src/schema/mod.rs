//! Schema synchronization: compare declared entities with the live database.

pub mod diff;
mod sync;

pub use sync::{SchemaSynchronizer, SyncOptions, SyncState};
