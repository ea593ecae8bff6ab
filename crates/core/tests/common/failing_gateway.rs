//! A gateway whose process updates can be made to fail.

use async_trait::async_trait;
use cp_core::persistence::{
    MemoryGateway, PersistenceError, PersistenceGateway, PersistenceResult, SnapshotInsert,
    SnapshotRecord,
};
use cp_core::state::process::GenerationProcess;
use cp_protocol::SnapshotMeta;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// In-memory storage that fails the next `n` row updates on request.
#[derive(Default)]
pub struct FailingGateway {
    inner: MemoryGateway,
    failures: AtomicUsize,
}

impl FailingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_updates(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PersistenceGateway for FailingGateway {
    async fn insert_process(&self, process: &GenerationProcess) -> PersistenceResult<()> {
        self.inner.insert_process(process).await
    }

    async fn load_process(&self, id: Uuid) -> PersistenceResult<Option<GenerationProcess>> {
        self.inner.load_process(id).await
    }

    async fn update_process(
        &self,
        process: &GenerationProcess,
    ) -> PersistenceResult<GenerationProcess> {
        if self.take_failure() {
            return Err(PersistenceError::Storage("disk unavailable".to_string()));
        }
        self.inner.update_process(process).await
    }

    async fn list_processes(&self) -> PersistenceResult<Vec<GenerationProcess>> {
        self.inner.list_processes().await
    }

    async fn delete_process(&self, id: Uuid) -> PersistenceResult<bool> {
        self.inner.delete_process(id).await
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> PersistenceResult<SnapshotInsert> {
        self.inner.insert_snapshot(record).await
    }

    async fn load_snapshot(&self, id: Uuid) -> PersistenceResult<Option<SnapshotRecord>> {
        self.inner.load_snapshot(id).await
    }

    async fn list_snapshots(&self, process_id: Uuid) -> PersistenceResult<Vec<SnapshotMeta>> {
        self.inner.list_snapshots(process_id).await
    }
}
