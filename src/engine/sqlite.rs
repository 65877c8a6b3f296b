//! SQLite engine backed by rusqlite
//!
//! Stores live at `<dir>/<name>.sqlite3` in WAL mode. Snapshots are
//! produced with `VACUUM INTO` and imported with the online backup API,
//! so neither path depends on copying a live database file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::Progress;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, DatabaseName, OpenFlags, ToSql};
use tracing::debug;
use uuid::Uuid;

use super::{EngineFactory, StoreEngine};
use crate::error::{SyncError, SyncResult};
use crate::types::{Rows, ScalarValue};
use crate::utils::remove_with_sidecars;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for ScalarValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ScalarValue::Null => ToSqlOutput::Owned(Value::Null),
            ScalarValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            ScalarValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            ScalarValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            ScalarValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

fn scalar_from_ref(value: ValueRef<'_>) -> ScalarValue {
    match value {
        ValueRef::Null => ScalarValue::Null,
        ValueRef::Integer(v) => ScalarValue::Integer(v),
        ValueRef::Real(v) => ScalarValue::Real(v),
        ValueRef::Text(bytes) => ScalarValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => ScalarValue::Blob(bytes.to_vec()),
    }
}

fn path_str(path: &Path) -> SyncResult<&str> {
    path.to_str()
        .ok_or_else(|| SyncError::Engine(format!("non UTF-8 path: {}", path.display())))
}

/// One rusqlite connection
pub struct SqliteEngine {
    conn: Connection,
    /// Directory for export/import scratch files
    scratch_dir: PathBuf,
}

impl SqliteEngine {
    /// Open (or create) a file-backed store in WAL mode
    pub fn open_path(path: &Path, flags: OpenFlags) -> SyncResult<Self> {
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened store");

        let scratch_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        Ok(Self { conn, scratch_dir })
    }

    /// Private in-memory store, mostly useful in tests
    pub fn open_in_memory() -> SyncResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            scratch_dir: std::env::temp_dir(),
        })
    }

    fn scratch_path(&self, purpose: &str) -> PathBuf {
        self.scratch_dir
            .join(format!(".{}-{}.sqlite3", purpose, Uuid::new_v4().simple()))
    }
}

impl StoreEngine for SqliteEngine {
    fn execute(&mut self, sql: &str) -> SyncResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn execute_with_params(&mut self, sql: &str, params: &[ScalarValue]) -> SyncResult<usize> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    fn query(&self, sql: &str, params: &[ScalarValue]) -> SyncResult<Rows> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            (0..columns)
                .map(|i| row.get_ref(i).map(scalar_from_ref))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows.collect::<rusqlite::Result<Rows>>()?)
    }

    fn export_snapshot(&self) -> SyncResult<Vec<u8>> {
        let target = self.scratch_path("export");
        let exported = self
            .conn
            .execute("VACUUM INTO ?1", [path_str(&target)?])
            .map_err(SyncError::from)
            .and_then(|_| fs::read(&target).map_err(SyncError::from));
        remove_with_sidecars(&target)?;
        let bytes = exported?;
        debug!(bytes = bytes.len(), "exported snapshot");
        Ok(bytes)
    }

    fn import_snapshot(&mut self, bytes: &[u8]) -> SyncResult<()> {
        if bytes.is_empty() {
            return Err(SyncError::SnapshotCorrupt("empty snapshot".to_string()));
        }

        let source = self.scratch_path("import");
        fs::write(&source, bytes)?;
        let restored = self
            .conn
            .restore(DatabaseName::Main, &source, None::<fn(Progress)>);
        remove_with_sidecars(&source)?;
        restored.map_err(|e| SyncError::SnapshotCorrupt(e.to_string()))?;

        let status: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(|e| SyncError::SnapshotCorrupt(e.to_string()))?;
        if status != "ok" {
            return Err(SyncError::SnapshotCorrupt(status));
        }

        debug!(bytes = bytes.len(), "imported snapshot");
        Ok(())
    }

    fn checkpoint(&mut self) -> SyncResult<()> {
        let busy: i64 = self
            .conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
        if busy != 0 {
            debug!("checkpoint could not complete, readers still active");
        }
        Ok(())
    }
}

/// Maps store names to files in one directory
#[derive(Debug, Clone)]
pub struct SqliteFactory {
    dir: PathBuf,
}

impl SqliteFactory {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a store name
    pub fn path_for(&self, name: &str) -> SyncResult<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(SyncError::Engine(format!("invalid store name '{}'", name)));
        }
        Ok(self.dir.join(format!("{}.sqlite3", name)))
    }
}

impl EngineFactory for SqliteFactory {
    fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.exists()).unwrap_or(false)
    }

    fn create(&self, name: &str) -> SyncResult<Box<dyn StoreEngine>> {
        let path = self.path_for(name)?;
        if path.exists() {
            return Err(SyncError::Engine(format!("store '{}' already exists", name)));
        }
        fs::create_dir_all(&self.dir)?;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Ok(Box::new(SqliteEngine::open_path(&path, flags)?))
    }

    fn open(&self, name: &str) -> SyncResult<Box<dyn StoreEngine>> {
        let path = self.path_for(name)?;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Ok(Box::new(SqliteEngine::open_path(&path, flags)?))
    }

    fn remove(&self, name: &str) -> SyncResult<()> {
        remove_with_sidecars(self.path_for(name)?)?;
        Ok(())
    }

    fn promote(&self, from: &str, to: &str) -> SyncResult<()> {
        let from_path = self.path_for(from)?;
        let to_path = self.path_for(to)?;
        remove_with_sidecars(&to_path)?;
        fs::rename(&from_path, &to_path)?;
        remove_with_sidecars(&from_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded(factory: &SqliteFactory, name: &str) -> Box<dyn StoreEngine> {
        let mut engine = factory.create(name).unwrap();
        engine
            .execute("CREATE TABLE notes(id TEXT PRIMARY KEY, title TEXT, body BLOB, score REAL);")
            .unwrap();
        engine
            .execute_with_params(
                "INSERT INTO notes(id, title, body, score) VALUES (?1, ?2, ?3, ?4)",
                &["n1".into(), "".into(), ScalarValue::Blob(vec![1, 2, 3]), 1.5.into()],
            )
            .unwrap();
        engine
            .execute_with_params(
                "INSERT INTO notes(id, title, body, score) VALUES (?1, ?2, ?3, ?4)",
                &["n2".into(), ScalarValue::Null, ScalarValue::Null, ScalarValue::Null],
            )
            .unwrap();
        engine
    }

    #[test]
    fn test_params_bind_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let factory = SqliteFactory::new(temp_dir.path());
        let engine = seeded(&factory, "notes");

        let rows = engine
            .query("SELECT id, title, body, score FROM notes ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], ScalarValue::Text(String::new()));
        assert_eq!(rows[0][2], ScalarValue::Blob(vec![1, 2, 3]));
        assert_eq!(rows[0][3], ScalarValue::Real(1.5));
        assert_eq!(rows[1][1], ScalarValue::Null);
    }

    #[test]
    fn test_export_import_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let factory = SqliteFactory::new(temp_dir.path());
        let mut source = seeded(&factory, "notes");
        source.checkpoint().unwrap();
        let bytes = source.export_snapshot().unwrap();
        assert!(!bytes.is_empty());

        let mut target = factory.create("copy").unwrap();
        target.import_snapshot(&bytes).unwrap();

        let query = "SELECT id, title, body, score FROM notes ORDER BY id";
        assert_eq!(target.query(query, &[]).unwrap(), source.query(query, &[]).unwrap());
    }

    #[test]
    fn test_import_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let factory = SqliteFactory::new(temp_dir.path());
        let mut engine = factory.create("target").unwrap();

        let err = engine.import_snapshot(&[0xde, 0xad, 0xbe, 0xef].repeat(256)).unwrap_err();
        assert!(matches!(err, SyncError::SnapshotCorrupt(_)));

        let err = engine.import_snapshot(&[]).unwrap_err();
        assert!(matches!(err, SyncError::SnapshotCorrupt(_)));
    }

    #[test]
    fn test_factory_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let factory = SqliteFactory::new(temp_dir.path());

        assert!(!factory.exists("notes"));
        assert!(factory.open("notes").is_err());

        drop(factory.create("notes").unwrap());
        assert!(factory.exists("notes"));
        assert!(factory.create("notes").is_err());

        drop(factory.create("scratch").unwrap());
        factory.promote("scratch", "notes").unwrap();
        assert!(!factory.exists("scratch"));
        assert!(factory.exists("notes"));

        factory.remove("notes").unwrap();
        assert!(!factory.exists("notes"));
    }

    #[test]
    fn test_store_names_are_validated() {
        let factory = SqliteFactory::new("/tmp");
        assert!(factory.path_for("../escape").is_err());
        assert!(factory.path_for("").is_err());
        assert!(factory.path_for("notes.restore-abc").is_ok());
    }
}
