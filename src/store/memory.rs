use super::{check_version, EntityKey, EntityKind, MetadataStore, StoreError, StoredEntity, WriteOp};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Process-local store; the reference implementation of the CAS contract.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<EntityKey, (u64, String)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryStore {
    fn read(&self, key: &EntityKey) -> Result<Option<StoredEntity>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.get(key).map(|(mvcc, body)| StoredEntity {
            key: key.clone(),
            mvcc: *mvcc,
            body: body.clone(),
        }))
    }

    fn scan(&self, project: &str, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(rows
            .iter()
            .filter(|(key, _)| key.project == project && key.kind == kind)
            .map(|(key, (mvcc, body))| StoredEntity {
                key: key.clone(),
                mvcc: *mvcc,
                body: body.clone(),
            })
            .collect())
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        for op in &ops {
            check_version(op, rows.get(op.key()).map(|(mvcc, _)| *mvcc))?;
        }
        for op in ops {
            match op {
                WriteOp::Put {
                    key,
                    expected,
                    body,
                } => {
                    rows.insert(key, (WriteOp::next_mvcc(expected), body));
                }
                WriteOp::Delete { key, .. } => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}
