//! Embedded store abstraction
//!
//! The replication layer never talks to SQLite directly. It drives a
//! [`StoreEngine`] (one open handle) produced by an [`EngineFactory`]
//! (which knows where named stores live). [`StoreHandle`] wraps an
//! engine so exactly one caller touches it at a time.

mod sqlite;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SyncResult;
use crate::types::{Rows, ScalarValue};

pub use sqlite::{SqliteEngine, SqliteFactory};

/// One open handle to an embedded store
pub trait StoreEngine: Send {
    /// Execute one or more statements without parameters
    fn execute(&mut self, sql: &str) -> SyncResult<()>;

    /// Execute a single statement with positional parameters, returning
    /// the number of changed rows
    fn execute_with_params(&mut self, sql: &str, params: &[ScalarValue]) -> SyncResult<usize>;

    /// Run a query and collect every row
    fn query(&self, sql: &str, params: &[ScalarValue]) -> SyncResult<Rows>;

    /// Full byte-for-byte export of the store
    fn export_snapshot(&self) -> SyncResult<Vec<u8>>;

    /// Replace the store content with an exported snapshot
    fn import_snapshot(&mut self, bytes: &[u8]) -> SyncResult<()>;

    /// Fold the write-ahead log into the main database file
    fn checkpoint(&mut self) -> SyncResult<()>;
}

/// Creates and opens named stores
pub trait EngineFactory: Send + Sync {
    /// Whether a store with this name already exists physically
    fn exists(&self, name: &str) -> bool;

    /// Create a new empty store. Callers must hold the init right.
    fn create(&self, name: &str) -> SyncResult<Box<dyn StoreEngine>>;

    /// Open an existing store
    fn open(&self, name: &str) -> SyncResult<Box<dyn StoreEngine>>;

    /// Delete a store; missing stores are ignored
    fn remove(&self, name: &str) -> SyncResult<()>;

    /// Move the closed store `from` into place as `to`, replacing it
    fn promote(&self, from: &str, to: &str) -> SyncResult<()>;
}

/// A client's exclusive handle on its local store
#[derive(Clone)]
pub struct StoreHandle {
    name: Arc<str>,
    engine: Arc<Mutex<Box<dyn StoreEngine>>>,
}

impl StoreHandle {
    pub fn new(name: &str, engine: Box<dyn StoreEngine>) -> Self {
        Self {
            name: Arc::from(name),
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    /// Logical database name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execute(&self, sql: &str) -> SyncResult<()> {
        self.engine.lock().execute(sql)
    }

    pub fn execute_with_params(&self, sql: &str, params: &[ScalarValue]) -> SyncResult<usize> {
        self.engine.lock().execute_with_params(sql, params)
    }

    pub fn query(&self, sql: &str, params: &[ScalarValue]) -> SyncResult<Rows> {
        self.engine.lock().query(sql, params)
    }

    /// Run `f` with exclusive access to the engine
    ///
    /// The lock is released when `f` returns; never call this across an
    /// `.await`.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut dyn StoreEngine) -> R) -> R {
        let mut guard = self.engine.lock();
        f(guard.as_mut())
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").field("name", &self.name).finish()
    }
}
