//! In-memory persistence gateway, used by tests and short-lived runs.

use crate::persistence::{
    snapshot_key, PersistenceError, PersistenceGateway, PersistenceResult, SnapshotInsert,
    SnapshotRecord,
};
use crate::state::process::GenerationProcess;
use async_trait::async_trait;
use chrono::Utc;
use cp_protocol::SnapshotMeta;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    processes: HashMap<Uuid, GenerationProcess>,
    /// Snapshots in insertion order.
    snapshots: Vec<SnapshotRecord>,
    snapshot_keys: HashMap<String, Uuid>,
}

/// Gateway keeping every row in process memory.
#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<Tables>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn insert_process(&self, process: &GenerationProcess) -> PersistenceResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.processes.contains_key(&process.id) {
            return Err(PersistenceError::AlreadyExists(process.id));
        }
        tables.processes.insert(process.id, process.clone());
        Ok(())
    }

    async fn load_process(&self, id: Uuid) -> PersistenceResult<Option<GenerationProcess>> {
        Ok(self.tables.lock().await.processes.get(&id).cloned())
    }

    async fn update_process(
        &self,
        process: &GenerationProcess,
    ) -> PersistenceResult<GenerationProcess> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .processes
            .get_mut(&process.id)
            .ok_or(PersistenceError::NotFound(process.id))?;
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
        *stored = next.clone();
        Ok(next)
    }

    async fn list_processes(&self) -> PersistenceResult<Vec<GenerationProcess>> {
        let tables = self.tables.lock().await;
        let mut processes: Vec<_> = tables.processes.values().cloned().collect();
        processes.sort_by_key(|p| p.created_at);
        Ok(processes)
    }

    async fn delete_process(&self, id: Uuid) -> PersistenceResult<bool> {
        Ok(self.tables.lock().await.processes.remove(&id).is_some())
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> PersistenceResult<SnapshotInsert> {
        let mut tables = self.tables.lock().await;
        let key = snapshot_key(&record.meta);
        if let Some(existing) = tables.snapshot_keys.get(&key) {
            return Ok(SnapshotInsert::Existing(*existing));
        }
        tables.snapshot_keys.insert(key, record.meta.snapshot_id);
        tables.snapshots.push(record.clone());
        Ok(SnapshotInsert::Created(record.meta.snapshot_id))
    }

    async fn load_snapshot(&self, id: Uuid) -> PersistenceResult<Option<SnapshotRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .snapshots
            .iter()
            .find(|record| record.meta.snapshot_id == id)
            .cloned())
    }

    async fn list_snapshots(&self, process_id: Uuid) -> PersistenceResult<Vec<SnapshotMeta>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .snapshots
            .iter()
            .filter(|record| record.meta.process_id == process_id)
            .map(|record| record.meta.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GenerationContext;
    use crate::state::process::create_process;
    use cp_protocol::{GenerationParams, Stage};

    fn record(process_id: Uuid, branch_id: Uuid, stage: Stage) -> SnapshotRecord {
        SnapshotRecord {
            meta: SnapshotMeta {
                snapshot_id: Uuid::new_v4(),
                process_id,
                branch_id,
                stage,
                created_at: Utc::now(),
            },
            owner_id: "owner".to_string(),
            auto: None,
            context: GenerationContext::default(),
        }
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let gateway = MemoryGateway::new();
        let process = create_process("owner".to_string(), GenerationParams::default(), None);
        gateway.insert_process(&process).await.unwrap();

        let stored = gateway.update_process(&process).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = gateway.update_process(&process).await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_keeps_earliest() {
        let gateway = MemoryGateway::new();
        let (process_id, branch_id) = (Uuid::new_v4(), Uuid::new_v4());
        let first = record(process_id, branch_id, Stage::ThemeSelection);
        let second = record(process_id, branch_id, Stage::ThemeSelection);

        let created = gateway.insert_snapshot(&first).await.unwrap();
        let duplicate = gateway.insert_snapshot(&second).await.unwrap();

        assert_eq!(created, SnapshotInsert::Created(first.meta.snapshot_id));
        assert_eq!(duplicate, SnapshotInsert::Existing(first.meta.snapshot_id));
        assert_eq!(gateway.list_snapshots(process_id).await.unwrap().len(), 1);

        let other_branch = record(process_id, Uuid::new_v4(), Stage::ThemeSelection);
        gateway.insert_snapshot(&other_branch).await.unwrap();
        assert_eq!(gateway.list_snapshots(process_id).await.unwrap().len(), 2);
    }
}
