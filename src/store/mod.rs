//! Versioned metadata storage.
//!
//! Every entity carries an mvcc counter. Writes are compare-and-swap: a
//! [`WriteOp`] names the version it expects to replace, and
//! [`MetadataStore::commit`] applies a batch of them atomically or not at all.
//!
//! ```text
//!   read ──▶ mutate a copy ──▶ commit [Put{expected: v}, ...]
//!                                 │
//!                 stored == v ────┴──── stored != v
//!                 store v + 1            StoreError::Conflict ──▶ retry
//! ```
//!
//! Keys are `(project, kind, id)`; bodies are JSON.

mod hash;
mod memory;
mod sqlite;

pub use hash::compute_hash;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::dataflow::Dataflow;
use crate::error::{CubeError, CubeResult};
use crate::index::IndexPlan;
use crate::model::{Model, TableDesc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        key: EntityKey,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Table,
    Model,
    IndexPlan,
    Dataflow,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Table => "table",
            EntityKind::Model => "model",
            EntityKind::IndexPlan => "index_plan",
            EntityKind::Dataflow => "dataflow",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub project: String,
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(project: impl Into<String>, kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.kind, self.id)
    }
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntity {
    pub key: EntityKey,
    pub mvcc: u64,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Create (`expected: None`) or replace the version `expected`.
    Put {
        key: EntityKey,
        expected: Option<u64>,
        body: String,
    },
    Delete { key: EntityKey, expected: u64 },
}

impl WriteOp {
    pub fn key(&self) -> &EntityKey {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }

    /// Version stored after this op succeeds.
    pub fn next_mvcc(expected: Option<u64>) -> u64 {
        expected.map_or(0, |v| v + 1)
    }
}

/// Raw storage contract.
pub trait MetadataStore: Send + Sync {
    fn read(&self, key: &EntityKey) -> Result<Option<StoredEntity>, StoreError>;

    /// Every entity of `kind` in `project`, ordered by id.
    fn scan(&self, project: &str, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError>;

    /// Apply `ops` atomically. Any version mismatch fails the whole batch
    /// with [`StoreError::Conflict`].
    fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}

/// A typed metadata entity.
pub trait Entity: Serialize + DeserializeOwned + Clone {
    const KIND: EntityKind;

    fn project(&self) -> &str;
    fn entity_id(&self) -> String;
    fn mvcc(&self) -> u64;
    fn set_mvcc(&mut self, mvcc: u64);

    fn key(&self) -> EntityKey {
        EntityKey::new(self.project(), Self::KIND, self.entity_id())
    }
}

impl Entity for TableDesc {
    const KIND: EntityKind = EntityKind::Table;

    fn project(&self) -> &str {
        &self.project
    }
    fn entity_id(&self) -> String {
        self.identity()
    }
    fn mvcc(&self) -> u64 {
        self.mvcc
    }
    fn set_mvcc(&mut self, mvcc: u64) {
        self.mvcc = mvcc;
    }
}

impl Entity for Model {
    const KIND: EntityKind = EntityKind::Model;

    fn project(&self) -> &str {
        &self.project
    }
    fn entity_id(&self) -> String {
        self.id.clone()
    }
    fn mvcc(&self) -> u64 {
        self.mvcc
    }
    fn set_mvcc(&mut self, mvcc: u64) {
        self.mvcc = mvcc;
    }
}

impl Entity for IndexPlan {
    const KIND: EntityKind = EntityKind::IndexPlan;

    fn project(&self) -> &str {
        &self.project
    }
    fn entity_id(&self) -> String {
        self.id.clone()
    }
    fn mvcc(&self) -> u64 {
        self.mvcc
    }
    fn set_mvcc(&mut self, mvcc: u64) {
        self.mvcc = mvcc;
    }
}

impl Entity for Dataflow {
    const KIND: EntityKind = EntityKind::Dataflow;

    fn project(&self) -> &str {
        &self.project
    }
    fn entity_id(&self) -> String {
        self.id.clone()
    }
    fn mvcc(&self) -> u64 {
        self.mvcc
    }
    fn set_mvcc(&mut self, mvcc: u64) {
        self.mvcc = mvcc;
    }
}

fn decode<E: Entity>(stored: StoredEntity) -> Result<E, StoreError> {
    let mut entity: E = serde_json::from_str(&stored.body)?;
    entity.set_mvcc(stored.mvcc);
    Ok(entity)
}

/// Typed access on top of any [`MetadataStore`].
pub trait MetadataStoreExt: MetadataStore {
    fn get<E: Entity>(&self, project: &str, id: &str) -> Result<Option<E>, StoreError> {
        self.read(&EntityKey::new(project, E::KIND, id))?
            .map(decode)
            .transpose()
    }

    fn list<E: Entity>(&self, project: &str) -> Result<Vec<E>, StoreError> {
        self.scan(project, E::KIND)?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Read-mutate-write one entity, retrying the whole cycle on conflicts.
    fn update<E: Entity>(
        &self,
        project: &str,
        id: &str,
        max_retries: u32,
        mut mutate: impl FnMut(E) -> CubeResult<E>,
    ) -> CubeResult<E> {
        let key = EntityKey::new(project, E::KIND, id);
        with_retries(&key.to_string(), max_retries, || {
            let current: E = self
                .get(project, id)?
                .ok_or_else(|| CubeError::not_found(E::KIND.as_str(), id))?;
            let mut unit = UnitOfWork::new();
            let next = mutate(current.clone())?;
            let next = unit.put(&next, current.mvcc())?;
            unit.commit(self)?;
            Ok(next)
        })
    }
}

impl<S: MetadataStore + ?Sized> MetadataStoreExt for S {}

/// A batch of writes committed together.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    ops: Vec<WriteOp>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Stage creation of `entity`. Returns it at its stored version.
    pub fn create<E: Entity>(&mut self, entity: &E) -> Result<E, StoreError> {
        self.stage(entity, None)
    }

    /// Stage replacement of version `expected` with `entity`. Returns it at
    /// its new version.
    pub fn put<E: Entity>(&mut self, entity: &E, expected: u64) -> Result<E, StoreError> {
        self.stage(entity, Some(expected))
    }

    pub fn delete<E: Entity>(&mut self, entity: &E) {
        self.ops.push(WriteOp::Delete {
            key: entity.key(),
            expected: entity.mvcc(),
        });
    }

    fn stage<E: Entity>(&mut self, entity: &E, expected: Option<u64>) -> Result<E, StoreError> {
        let mut staged = entity.clone();
        staged.set_mvcc(WriteOp::next_mvcc(expected));
        self.ops.push(WriteOp::Put {
            key: staged.key(),
            expected,
            body: serde_json::to_string(&staged)?,
        });
        Ok(staged)
    }

    pub fn commit<S: MetadataStore + ?Sized>(self, store: &S) -> Result<(), StoreError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        store.commit(self.ops)
    }
}

/// Run `attempt` until it stops failing with a version conflict, at most
/// `max_retries` times.
pub fn with_retries<T>(
    entity: &str,
    max_retries: u32,
    mut attempt: impl FnMut() -> CubeResult<T>,
) -> CubeResult<T> {
    let attempts = max_retries.max(1);
    for round in 1..=attempts {
        match attempt() {
            Err(CubeError::Store(StoreError::Conflict { key, .. })) => {
                debug!(entity, %key, round, "version conflict, retrying");
            }
            other => return other,
        }
    }
    Err(CubeError::TransactionConflict {
        entity: entity.to_string(),
        attempts,
    })
}

/// Check `op` against the currently stored version.
pub(crate) fn check_version(op: &WriteOp, actual: Option<u64>) -> Result<(), StoreError> {
    let expected = match op {
        WriteOp::Put { expected, .. } => *expected,
        WriteOp::Delete { expected, .. } => Some(*expected),
    };
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            key: op.key().clone(),
            expected,
            actual,
        })
    }
}
