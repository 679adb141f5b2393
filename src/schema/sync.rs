//! Schema synchronizer: introspect, diff, then report or apply.

use crate::connection::Statement;
use crate::error::DataError;
use crate::model::EntityManager;
use crate::schema::diff;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Introspecting,
    Diffing,
    DryRun,
    Applying,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Execute the statements instead of only returning them.
    pub force: bool,
    /// Also drop undeclared tables, columns and indexes.
    pub drop: bool,
}

impl SyncOptions {
    pub fn dry_run() -> Self {
        Self::default()
    }

    pub fn force() -> Self {
        SyncOptions {
            force: true,
            drop: false,
        }
    }

    pub fn with_drop(mut self) -> Self {
        self.drop = true;
        self
    }
}

/// Applying assumes no other writer changes the schema concurrently.
pub struct SchemaSynchronizer<'m> {
    manager: &'m EntityManager,
    state: SyncState,
}

impl<'m> SchemaSynchronizer<'m> {
    pub fn new(manager: &'m EntityManager) -> Self {
        SchemaSynchronizer {
            manager,
            state: SyncState::Idle,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn enter(&mut self, state: SyncState) {
        tracing::info!(from = ?self.state, to = ?state, "schema sync");
        self.state = state;
    }

    /// Compute (and with `force`, apply) the statements reconciling the live
    /// database with the declared model. Always ends back in `Idle`.
    pub async fn sync(&mut self, options: SyncOptions) -> Result<Vec<Statement>, DataError> {
        let result = self.run(options).await;
        self.enter(SyncState::Idle);
        result
    }

    async fn run(&mut self, options: SyncOptions) -> Result<Vec<Statement>, DataError> {
        let conn = self.manager.connection().clone();

        self.enter(SyncState::Introspecting);
        let live = conn.introspect().await?;

        self.enter(SyncState::Diffing);
        let statements = diff::plan(
            conn.as_ref(),
            self.manager.entities(),
            self.manager.indices(),
            &live,
            options.drop,
        );

        if !options.force || statements.is_empty() {
            self.enter(SyncState::DryRun);
            tracing::info!(statements = statements.len(), "schema sync dry run");
            return Ok(statements);
        }

        self.enter(SyncState::Applying);
        conn.execute_queries(&statements).await?;
        tracing::info!(statements = statements.len(), "schema sync applied");
        Ok(statements)
    }
}
