//! TL-013: State store - resource id → last converged record.
//!
//! Three backends: in-memory, one YAML file per resource (atomic write), and
//! SQLite. Concurrent runs against the same resource id are excluded by an
//! external lock; the store itself only guarantees per-key atomic writes.

use super::error::{Error, Result};
use super::types::{StateRecord, STATE_SCHEMA};
use rusqlite::OptionalExtension;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persisted mapping from resource identity to last-known remote attributes.
pub trait StateStore: Send + Sync {
    /// Load the record for a resource. Unreadable or mismatched records are
    /// reported as [`Error::StateCorruption`].
    fn load(&self, resource_id: &str) -> Result<Option<StateRecord>>;

    /// Insert or replace the record keyed by `record.resource_id`.
    fn save(&self, record: &StateRecord) -> Result<()>;

    /// Remove a record. Returns whether one existed.
    fn delete(&self, resource_id: &str) -> Result<bool>;

    /// All readable records, sorted by resource id.
    fn list(&self) -> Result<Vec<StateRecord>>;
}

fn corrupt(resource_id: &str, message: impl Into<String>) -> Error {
    Error::StateCorruption {
        resource_id: resource_id.to_string(),
        message: message.into(),
    }
}

/// Reject records written under another schema or for another id.
fn check_record(resource_id: &str, record: StateRecord) -> Result<StateRecord> {
    if record.schema != STATE_SCHEMA {
        return Err(corrupt(
            resource_id,
            format!("schema \"{}\", expected \"{}\"", record.schema, STATE_SCHEMA),
        ));
    }
    if record.resource_id != resource_id {
        return Err(corrupt(
            resource_id,
            format!("record belongs to '{}'", record.resource_id),
        ));
    }
    Ok(record)
}

// ============================================================================
// In-memory
// ============================================================================

/// Volatile store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, StateRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StateRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, resource_id: &str) -> Result<Option<StateRecord>> {
        self.records()
            .get(resource_id)
            .cloned()
            .map(|r| check_record(resource_id, r))
            .transpose()
    }

    fn save(&self, record: &StateRecord) -> Result<()> {
        self.records()
            .insert(record.resource_id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, resource_id: &str) -> Result<bool> {
        Ok(self.records().remove(resource_id).is_some())
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        Ok(self.records().values().cloned().collect())
    }
}

// ============================================================================
// YAML files
// ============================================================================

/// One `<id>.state.yaml` per resource under `<state_dir>/resources/`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("resources"),
        }
    }

    /// Derive the record path for a resource.
    pub fn record_path(&self, resource_id: &str) -> PathBuf {
        self.dir.join(format!("{}.state.yaml", resource_id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, resource_id: &str) -> Result<Option<StateRecord>> {
        let path = self.record_path(resource_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let content = String::from_utf8(bytes)
            .map_err(|e| corrupt(resource_id, format!("{}: {}", path.display(), e)))?;
        let record: StateRecord = serde_yaml_ng::from_str(&content)
            .map_err(|e| corrupt(resource_id, format!("{}: {}", path.display(), e)))?;
        check_record(resource_id, record).map(Some)
    }

    /// Atomic write: temp file + rename.
    fn save(&self, record: &StateRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.resource_id);
        let yaml = serde_yaml_ng::to_string(record)?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn delete(&self, resource_id: &str) -> Result<bool> {
        let path = self.record_path(resource_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".state.yaml") else {
                continue;
            };
            match self.load(id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(resource = id, error = %e, "skipping unreadable state record"),
            }
        }
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(records)
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Single-table SQLite store.
pub struct SqliteStateStore {
    conn: Mutex<rusqlite::Connection>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(rusqlite::Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS state (
                resource_id TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                record      TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self, resource_id: &str) -> Result<Option<StateRecord>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM state WHERE resource_id = ?1",
                [resource_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: StateRecord =
            serde_json::from_str(&raw).map_err(|e| corrupt(resource_id, e.to_string()))?;
        check_record(resource_id, record).map(Some)
    }

    fn save(&self, record: &StateRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.conn().execute(
            "INSERT INTO state (resource_id, kind, record) VALUES (?1, ?2, ?3)
             ON CONFLICT(resource_id) DO UPDATE SET kind = excluded.kind, record = excluded.record",
            rusqlite::params![record.resource_id, record.kind, json],
        )?;
        Ok(())
    }

    fn delete(&self, resource_id: &str) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM state WHERE resource_id = ?1", [resource_id])?;
        Ok(n > 0)
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT resource_id, record FROM state ORDER BY resource_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            let parsed = serde_json::from_str::<StateRecord>(&raw)
                .map_err(|e| corrupt(&id, e.to_string()))
                .and_then(|record| check_record(&id, record));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(resource = %id, error = %e, "skipping unreadable state record"),
            }
        }
        Ok(records)
    }
}

/// Build a fresh record stamped with the current time.
pub fn new_record(
    resource_id: &str,
    kind: &str,
    inputs_hash: &str,
    remote_attributes: super::types::Attributes,
) -> StateRecord {
    StateRecord {
        schema: STATE_SCHEMA.to_string(),
        resource_id: resource_id.to_string(),
        kind: kind.to_string(),
        inputs_hash: inputs_hash.to_string(),
        remote_attributes,
        applied_at: Some(crate::tripwire::eventlog::now_iso8601()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Attributes;
    use serde_json::json;

    fn make_record(id: &str) -> StateRecord {
        new_record(
            id,
            "project",
            "blake3:abc123",
            Attributes::from([("id".to_string(), json!(format!("{}-remote", id)))]),
        )
    }

    fn exercise(store: &dyn StateStore) {
        assert!(store.load("project").unwrap().is_none());
        store.save(&make_record("project")).unwrap();
        store.save(&make_record("app")).unwrap();

        let loaded = store.load("project").unwrap().unwrap();
        assert_eq!(loaded.inputs_hash, "blake3:abc123");
        assert_eq!(loaded.remote_id().as_deref(), Some("project-remote"));

        let mut updated = make_record("project");
        updated.inputs_hash = "blake3:def456".to_string();
        store.save(&updated).unwrap();
        assert_eq!(
            store.load("project").unwrap().unwrap().inputs_hash,
            "blake3:def456"
        );

        let ids: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(ids, vec!["app", "project"]);

        assert!(store.delete("project").unwrap());
        assert!(!store.delete("project").unwrap());
        assert!(store.load("project").unwrap().is_none());
    }

    #[test]
    fn test_tl013_memory_store() {
        exercise(&MemoryStateStore::new());
    }

    #[test]
    fn test_tl013_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStateStore::new(dir.path()));
    }

    #[test]
    fn test_tl013_sqlite_store() {
        exercise(&SqliteStateStore::in_memory().unwrap());
    }

    #[test]
    fn test_tl013_sqlite_store_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        SqliteStateStore::open(&path)
            .unwrap()
            .save(&make_record("pipeline"))
            .unwrap();
        let reopened = SqliteStateStore::open(&path).unwrap();
        assert!(reopened.load("pipeline").unwrap().is_some());
    }

    #[test]
    fn test_tl013_record_path() {
        let store = FileStateStore::new(Path::new("/state"));
        assert_eq!(
            store.record_path("project"),
            PathBuf::from("/state/resources/project.state.yaml")
        );
    }

    #[test]
    fn test_tl013_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&make_record("project")).unwrap();
        let path = store.record_path("project");
        assert!(path.exists());
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[test]
    fn test_tl013_garbage_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("resources")).unwrap();
        std::fs::write(store.record_path("project"), ": not [valid").unwrap();
        let err = store.load("project").unwrap_err();
        assert!(matches!(err, Error::StateCorruption { .. }));
        // list() skips it rather than failing
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_tl013_non_utf8_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("resources")).unwrap();
        std::fs::write(store.record_path("app"), [0xff, 0xfe, 0x00, 0x80]).unwrap();
        assert!(matches!(
            store.load("app"),
            Err(Error::StateCorruption { .. })
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_tl013_sqlite_list_skips_foreign_schema() {
        let store = SqliteStateStore::in_memory().unwrap();
        store.save(&make_record("project")).unwrap();
        let mut old = make_record("app");
        old.schema = "0.9".to_string();
        store.save(&old).unwrap();
        let ids: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(ids, vec!["project"]);
    }

    #[test]
    fn test_tl013_schema_mismatch_is_corruption() {
        let store = MemoryStateStore::new();
        let mut record = make_record("project");
        record.schema = "0.9".to_string();
        store.save(&record).unwrap();
        match store.load("project") {
            Err(Error::StateCorruption { message, .. }) => assert!(message.contains("0.9")),
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_tl013_sqlite_garbage_is_corruption() {
        let store = SqliteStateStore::in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO state (resource_id, kind, record) VALUES ('x', 'project', '{oops')",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.load("x"),
            Err(Error::StateCorruption { .. })
        ));
    }
}
