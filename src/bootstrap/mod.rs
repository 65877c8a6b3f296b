//! Schema bootstrap
//!
//! Applies migration scripts to a freshly created store. The whole run is
//! skipped when the schema probe finds the root table, so several clients
//! bootstrapping the same store concurrently is safe as long as every
//! statement carries an existence guard (`IF NOT EXISTS`).

mod splitter;

use tracing::{debug, error, info};

use crate::config::SyncConfig;
use crate::engine::StoreEngine;
use crate::error::{SyncError, SyncResult};
use crate::types::ScalarValue;

pub use splitter::split_statements;

/// Bundled migrations for the notes schema, applied in order
pub const DEFAULT_MIGRATIONS: [&str; 2] = [
    include_str!("../../migrations/0001_notes.sql"),
    include_str!("../../migrations/0002_note_history.sql"),
];

/// Outcome of a bootstrap run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The root table already existed; nothing ran
    AlreadyPresent,
    /// All statements ran successfully
    Applied { statements: usize },
}

/// Does the expected root table exist in this store?
pub fn probe_schema(engine: &dyn StoreEngine, root_table: &str) -> SyncResult<bool> {
    let rows = engine.query(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        &[ScalarValue::from(root_table)],
    )?;
    Ok(!rows.is_empty())
}

/// Ordered migration scripts plus the table that proves they ran
#[derive(Debug, Clone)]
pub struct SchemaBootstrap {
    root_table: String,
    scripts: Vec<String>,
}

impl SchemaBootstrap {
    pub fn new(root_table: impl Into<String>, scripts: Vec<String>) -> Self {
        Self {
            root_table: root_table.into(),
            scripts,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.root_table.clone(), config.migrations.clone())
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }

    /// Apply every script unless the schema is already present
    ///
    /// Stops at the first failing statement and reports its 1-based
    /// position across all scripts together with its text.
    pub fn apply(&self, engine: &mut dyn StoreEngine) -> SyncResult<BootstrapOutcome> {
        if probe_schema(engine, &self.root_table)? {
            debug!(root_table = %self.root_table, "schema present, skipping bootstrap");
            return Ok(BootstrapOutcome::AlreadyPresent);
        }

        let mut index = 0;
        for (script_no, script) in self.scripts.iter().enumerate() {
            for statement in split_statements(script) {
                index += 1;
                if let Err(e) = engine.execute(&statement) {
                    error!(
                        script = script_no + 1,
                        statement = index,
                        error = %e,
                        "migration statement failed"
                    );
                    return Err(SyncError::SchemaBootstrapFailure {
                        index,
                        statement,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(statements = index, scripts = self.scripts.len(), "schema bootstrap complete");
        Ok(BootstrapOutcome::Applied { statements: index })
    }
}

/// Convenience wrapper for one-off callers
pub fn apply_migrations(
    engine: &mut dyn StoreEngine,
    root_table: &str,
    scripts: &[String],
) -> SyncResult<BootstrapOutcome> {
    SchemaBootstrap::new(root_table, scripts.to_vec()).apply(engine)
}
