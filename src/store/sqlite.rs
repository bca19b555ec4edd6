//! SQLite-backed metadata store.
//!
//! One `metadata` table keyed by `(project, kind, id)` holding the mvcc and
//! the JSON body. A `meta` table records the schema version; a mismatch
//! refuses to open rather than silently dropping metadata.

use super::{check_version, EntityKey, EntityKind, MetadataStore, StoreError, StoredEntity, WriteOp};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Current store schema version.
const SCHEMA_VERSION: i32 = 1;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened metadata store");
        Self::init(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
                project TEXT NOT NULL,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                mvcc INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (project, kind, id)
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .optional()?;
        match stored_version {
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "metadata store schema version {} is not supported (expected {})",
                        v, SCHEMA_VERSION
                    ),
                )))
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('version', ?)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_stored(key: EntityKey, mvcc: i64, body: String) -> StoredEntity {
    StoredEntity {
        key,
        mvcc: mvcc as u64,
        body,
    }
}

impl MetadataStore for SqliteStore {
    fn read(&self, key: &EntityKey) -> Result<Option<StoredEntity>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT mvcc, body FROM metadata WHERE project = ? AND kind = ? AND id = ?",
                params![key.project, key.kind.as_str(), key.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(mvcc, body)| to_stored(key.clone(), mvcc, body)))
    }

    fn scan(&self, project: &str, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, mvcc, body FROM metadata WHERE project = ? AND kind = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project, kind.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, mvcc, body)| to_stored(EntityKey::new(project, kind, id), mvcc, body))
            .collect())
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        for op in &ops {
            let key = op.key();
            let actual: Option<i64> = tx
                .query_row(
                    "SELECT mvcc FROM metadata WHERE project = ? AND kind = ? AND id = ?",
                    params![key.project, key.kind.as_str(), key.id],
                    |row| row.get(0),
                )
                .optional()?;
            check_version(op, actual.map(|v| v as u64))?;

            match op {
                WriteOp::Put {
                    key,
                    expected,
                    body,
                } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO metadata (project, kind, id, mvcc, body) VALUES (?, ?, ?, ?, ?)",
                        params![
                            key.project,
                            key.kind.as_str(),
                            key.id,
                            WriteOp::next_mvcc(*expected) as i64,
                            body
                        ],
                    )?;
                }
                WriteOp::Delete { key, .. } => {
                    tx.execute(
                        "DELETE FROM metadata WHERE project = ? AND kind = ? AND id = ?",
                        params![key.project, key.kind.as_str(), key.id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
