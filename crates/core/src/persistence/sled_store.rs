//! Sled-backed persistence gateway.
//!
//! Rows are stored as JSON in four trees:
//! - `processes`: process id -> process row
//! - `snapshots`: snapshot id -> snapshot record
//! - `snapshot_keys`: `process:stage:branch` -> snapshot id
//! - `snapshot_index`: process id ++ snapshot id -> snapshot metadata
//!
//! The version predicate on process rows is enforced with `compare_and_swap`.
//! A snapshot is written to its three trees in one transaction, so a key never
//! points at a missing record.

use crate::persistence::{
    snapshot_key, PersistenceError, PersistenceGateway, PersistenceResult, SnapshotInsert,
    SnapshotRecord,
};
use crate::state::process::GenerationProcess;
use async_trait::async_trait;
use chrono::Utc;
use cp_protocol::SnapshotMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use std::path::Path;
use uuid::Uuid;

const PROCESSES_TREE: &str = "processes";
const SNAPSHOTS_TREE: &str = "snapshots";
const SNAPSHOT_KEYS_TREE: &str = "snapshot_keys";
const SNAPSHOT_INDEX_TREE: &str = "snapshot_index";

fn storage_error(action: &'static str) -> impl Fn(sled::Error) -> PersistenceError {
    move |e| PersistenceError::Storage(format!("Failed to {action}: {e}"))
}

fn encode<T: Serialize>(value: &T) -> PersistenceResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PersistenceError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> PersistenceResult<T> {
    serde_json::from_slice(bytes).map_err(|e| PersistenceError::Serialization(e.to_string()))
}

fn index_key(meta: &SnapshotMeta) -> Vec<u8> {
    let mut key = meta.process_id.as_bytes().to_vec();
    key.extend_from_slice(meta.snapshot_id.as_bytes());
    key
}

/// Gateway storing rows in a sled database on disk.
pub struct SledGateway {
    db: sled::Db,
    processes: sled::Tree,
    snapshots: sled::Tree,
    snapshot_keys: sled::Tree,
    snapshot_index: sled::Tree,
}

impl SledGateway {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> PersistenceResult<Self> {
        let db = sled::open(path).map_err(storage_error("open sled database"))?;
        let processes = db
            .open_tree(PROCESSES_TREE)
            .map_err(storage_error("open processes tree"))?;
        let snapshots = db
            .open_tree(SNAPSHOTS_TREE)
            .map_err(storage_error("open snapshots tree"))?;
        let snapshot_keys = db
            .open_tree(SNAPSHOT_KEYS_TREE)
            .map_err(storage_error("open snapshot keys tree"))?;
        let snapshot_index = db
            .open_tree(SNAPSHOT_INDEX_TREE)
            .map_err(storage_error("open snapshot index tree"))?;
        Ok(Self {
            db,
            processes,
            snapshots,
            snapshot_keys,
            snapshot_index,
        })
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> PersistenceResult<()> {
        self.db
            .flush_async()
            .await
            .map_err(storage_error("flush database"))?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for SledGateway {
    async fn insert_process(&self, process: &GenerationProcess) -> PersistenceResult<()> {
        let value = encode(process)?;
        let swapped = self
            .processes
            .compare_and_swap(process.id.as_bytes(), None as Option<&[u8]>, Some(value))
            .map_err(storage_error("insert process"))?;
        swapped.map_err(|_| PersistenceError::AlreadyExists(process.id))
    }

    async fn load_process(&self, id: Uuid) -> PersistenceResult<Option<GenerationProcess>> {
        match self
            .processes
            .get(id.as_bytes())
            .map_err(storage_error("load process"))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_process(
        &self,
        process: &GenerationProcess,
    ) -> PersistenceResult<GenerationProcess> {
        let current = self
            .processes
            .get(process.id.as_bytes())
            .map_err(storage_error("load process"))?
            .ok_or(PersistenceError::NotFound(process.id))?;
        let stored: GenerationProcess = decode(&current)?;
        if stored.version != process.version {
            return Err(PersistenceError::Conflict {
                process_id: process.id,
                expected: process.version,
                found: stored.version,
            });
        }

        let mut next = process.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        let value = encode(&next)?;

        // The bytes read above are the predicate: a concurrent writer between
        // the read and this swap makes it fail.
        let swapped = self
            .processes
            .compare_and_swap(process.id.as_bytes(), Some(current), Some(value))
            .map_err(storage_error("update process"))?;
        match swapped {
            Ok(()) => Ok(next),
            Err(cas) => {
                let found = match cas.current {
                    Some(bytes) => decode::<GenerationProcess>(&bytes)?.version,
                    None => return Err(PersistenceError::NotFound(process.id)),
                };
                Err(PersistenceError::Conflict {
                    process_id: process.id,
                    expected: process.version,
                    found,
                })
            }
        }
    }

    async fn list_processes(&self) -> PersistenceResult<Vec<GenerationProcess>> {
        let mut processes = Vec::new();
        for item in self.processes.iter() {
            let (_, value) = item.map_err(storage_error("iterate processes"))?;
            processes.push(decode::<GenerationProcess>(&value)?);
        }
        processes.sort_by_key(|p| p.created_at);
        Ok(processes)
    }

    async fn delete_process(&self, id: Uuid) -> PersistenceResult<bool> {
        let removed = self
            .processes
            .remove(id.as_bytes())
            .map_err(storage_error("delete process"))?;
        Ok(removed.is_some())
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> PersistenceResult<SnapshotInsert> {
        let key = snapshot_key(&record.meta);
        let snapshot_id = record.meta.snapshot_id;
        let value = encode(record)?;
        let meta = encode(&record.meta)?;
        let index = index_key(&record.meta);

        let result = (&self.snapshot_keys, &self.snapshots, &self.snapshot_index).transaction(
            |(keys, snapshots, index_tree)| -> ConflictableTransactionResult<_, PersistenceError> {
                if let Some(bytes) = keys.get(key.as_bytes())? {
                    let existing = Uuid::from_slice(&bytes).map_err(|_| {
                        ConflictableTransactionError::Abort(PersistenceError::Storage(format!(
                            "Corrupt snapshot key entry for {key}"
                        )))
                    })?;
                    // A key without its record is claimed again.
                    if snapshots.get(existing.as_bytes().to_vec())?.is_some() {
                        return Ok(SnapshotInsert::Existing(existing));
                    }
                }
                keys.insert(key.as_bytes(), snapshot_id.as_bytes().to_vec())?;
                snapshots.insert(snapshot_id.as_bytes().to_vec(), value.clone())?;
                index_tree.insert(index.clone(), meta.clone())?;
                Ok(SnapshotInsert::Created(snapshot_id))
            },
        );
        let inserted = result.map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => storage_error("insert snapshot")(err),
        })?;

        if matches!(inserted, SnapshotInsert::Created(_)) {
            self.flush().await?;
        }
        Ok(inserted)
    }

    async fn load_snapshot(&self, id: Uuid) -> PersistenceResult<Option<SnapshotRecord>> {
        match self
            .snapshots
            .get(id.as_bytes())
            .map_err(storage_error("load snapshot"))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_snapshots(&self, process_id: Uuid) -> PersistenceResult<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for item in self.snapshot_index.scan_prefix(process_id.as_bytes()) {
            let (_, value) = item.map_err(storage_error("iterate snapshot index"))?;
            metas.push(decode::<SnapshotMeta>(&value)?);
        }
        metas.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GenerationContext;
    use crate::state::process::create_process;
    use cp_protocol::{GenerationParams, Stage};
    use tempfile::TempDir;

    fn params() -> GenerationParams {
        GenerationParams {
            keywords: vec!["注文住宅".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_and_reload_process() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = SledGateway::open(temp_dir.path()).unwrap();
        let process = create_process("owner".to_string(), params(), None);

        gateway.insert_process(&process).await.unwrap();
        let loaded = gateway.load_process(process.id).await.unwrap().unwrap();
        assert_eq!(loaded, process);

        assert!(matches!(
            gateway.insert_process(&process).await,
            Err(PersistenceError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_optimistic_conflict_detection() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = SledGateway::open(temp_dir.path()).unwrap();
        let process = create_process("owner".to_string(), params(), None);
        gateway.insert_process(&process).await.unwrap();

        let mut first = process.clone();
        first.progress_percentage = 7;
        let stored = gateway.update_process(&first).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut stale = process.clone();
        stale.progress_percentage = 9;
        let err = gateway.update_process(&stale).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict { found: 1, .. }));

        let reloaded = gateway.load_process(process.id).await.unwrap().unwrap();
        assert_eq!(reloaded.progress_percentage, 7);
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let process = create_process("owner".to_string(), params(), None);
        let snapshot = SnapshotRecord {
            meta: SnapshotMeta {
                snapshot_id: Uuid::new_v4(),
                process_id: process.id,
                branch_id: process.branch_id,
                stage: Stage::PersonaSelection,
                created_at: Utc::now(),
            },
            owner_id: process.owner_id.clone(),
            auto: None,
            context: GenerationContext::new(params()),
        };
        {
            let gateway = SledGateway::open(temp_dir.path()).unwrap();
            gateway.insert_process(&process).await.unwrap();
            gateway.insert_snapshot(&snapshot).await.unwrap();
            gateway.flush().await.unwrap();
        }

        let gateway = SledGateway::open(temp_dir.path()).unwrap();
        assert!(gateway.load_process(process.id).await.unwrap().is_some());
        let loaded = gateway
            .load_snapshot(snapshot.meta.snapshot_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, snapshot);

        let duplicate = SnapshotRecord {
            meta: SnapshotMeta {
                snapshot_id: Uuid::new_v4(),
                ..snapshot.meta.clone()
            },
            ..snapshot.clone()
        };
        assert_eq!(
            gateway.insert_snapshot(&duplicate).await.unwrap(),
            SnapshotInsert::Existing(snapshot.meta.snapshot_id)
        );
    }

    fn snapshot_at(process: &GenerationProcess, stage: Stage) -> SnapshotRecord {
        SnapshotRecord {
            meta: SnapshotMeta {
                snapshot_id: Uuid::new_v4(),
                process_id: process.id,
                branch_id: process.branch_id,
                stage,
                created_at: Utc::now(),
            },
            owner_id: process.owner_id.clone(),
            auto: None,
            context: GenerationContext::new(params()),
        }
    }

    #[tokio::test]
    async fn test_orphaned_snapshot_key_is_claimed_again() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = SledGateway::open(temp_dir.path()).unwrap();
        let process = create_process("owner".to_string(), params(), None);
        let record = snapshot_at(&process, Stage::ThemeSelection);

        // A key whose record was never written.
        let missing = Uuid::new_v4();
        gateway
            .snapshot_keys
            .insert(snapshot_key(&record.meta).as_bytes(), missing.as_bytes().to_vec())
            .unwrap();

        let inserted = gateway.insert_snapshot(&record).await.unwrap();
        assert_eq!(inserted, SnapshotInsert::Created(record.meta.snapshot_id));
        assert!(gateway
            .load_snapshot(record.meta.snapshot_id)
            .await
            .unwrap()
            .is_some());
        let listed = gateway.list_snapshots(process.id).await.unwrap();
        assert_eq!(listed, vec![record.meta.clone()]);

        let later = snapshot_at(&process, Stage::ThemeSelection);
        assert_eq!(
            gateway.insert_snapshot(&later).await.unwrap(),
            SnapshotInsert::Existing(record.meta.snapshot_id)
        );
    }

    #[tokio::test]
    async fn test_list_snapshots_is_scoped_to_the_process() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = SledGateway::open(temp_dir.path()).unwrap();
        let process = create_process("owner".to_string(), params(), None);
        let other = create_process("owner".to_string(), params(), None);

        let first = snapshot_at(&process, Stage::PersonaSelection);
        let second = snapshot_at(&process, Stage::ThemeSelection);
        let foreign = snapshot_at(&other, Stage::PersonaSelection);
        for record in [&first, &second, &foreign] {
            gateway.insert_snapshot(record).await.unwrap();
        }

        let listed = gateway.list_snapshots(process.id).await.unwrap();
        assert_eq!(listed, vec![first.meta, second.meta]);
        assert_eq!(
            gateway.list_snapshots(other.id).await.unwrap(),
            vec![foreign.meta]
        );
    }
}
