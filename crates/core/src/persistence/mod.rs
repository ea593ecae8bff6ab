//! Persistence gateway.
//!
//! Generation processes share no memory with each other; the gateway is the
//! only shared state. Process rows are written with a version predicate
//! (optimistic concurrency) and snapshots are keyed so that the first writer
//! for a `(process, stage, branch)` key wins.

pub mod memory;
pub mod sled_store;

use crate::context::GenerationContext;
use crate::engine::auto_decision::AutoModeSettings;
use crate::state::process::GenerationProcess;
use async_trait::async_trait;
use cp_protocol::SnapshotMeta;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryGateway;
pub use sled_store::SledGateway;

/// Bound on read-modify-write attempts when a row keeps changing underneath.
pub const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Errors raised by a persistence gateway.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The stored version no longer matches the one the update was based on.
    #[error("Version conflict on process {process_id}: expected {expected}, found {found}")]
    Conflict {
        process_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("Process {0} not found")]
    NotFound(Uuid),

    #[error("Process {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Type alias for Result with PersistenceError.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// A snapshot row: metadata plus the captured context.
///
/// Owner and auto-mode settings are carried so a restore can rebuild a run
/// without the source row, which may have been deleted.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub meta: SnapshotMeta,
    pub owner_id: String,
    #[serde(default)]
    pub auto: Option<AutoModeSettings>,
    pub context: GenerationContext,
}

/// Outcome of a snapshot insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotInsert {
    Created(Uuid),
    /// A snapshot already existed for the key; its id is returned.
    Existing(Uuid),
}

impl SnapshotInsert {
    pub fn id(&self) -> Uuid {
        match self {
            SnapshotInsert::Created(id) | SnapshotInsert::Existing(id) => *id,
        }
    }
}

/// Row storage for processes and snapshots.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn insert_process(&self, process: &GenerationProcess) -> PersistenceResult<()>;

    async fn load_process(&self, id: Uuid) -> PersistenceResult<Option<GenerationProcess>>;

    /// Write `process` if the stored row still has `process.version`.
    ///
    /// Returns the row as stored, with the version bumped and `updated_at`
    /// refreshed. Fails with [`PersistenceError::Conflict`] when another
    /// writer got there first.
    async fn update_process(&self, process: &GenerationProcess)
        -> PersistenceResult<GenerationProcess>;

    async fn list_processes(&self) -> PersistenceResult<Vec<GenerationProcess>>;

    /// Delete a process row. Its snapshots are kept. Returns false when the
    /// row did not exist.
    async fn delete_process(&self, id: Uuid) -> PersistenceResult<bool>;

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> PersistenceResult<SnapshotInsert>;

    async fn load_snapshot(&self, id: Uuid) -> PersistenceResult<Option<SnapshotRecord>>;

    /// Snapshot metadata for a process, oldest first.
    async fn list_snapshots(&self, process_id: Uuid) -> PersistenceResult<Vec<SnapshotMeta>>;
}

/// Read-modify-write a process row, retrying on version conflicts.
///
/// `apply` runs against a fresh copy of the row on every attempt and must not
/// have side effects beyond the row. An error from `apply` aborts without
/// writing.
///
/// # Returns
///
/// The stored row and the value produced by the successful `apply`.
pub async fn update_with_retry<T, E, F>(
    gateway: &dyn PersistenceGateway,
    id: Uuid,
    mut apply: F,
) -> Result<(GenerationProcess, T), E>
where
    F: FnMut(&mut GenerationProcess) -> Result<T, E>,
    E: From<PersistenceError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut process = gateway
            .load_process(id)
            .await?
            .ok_or(PersistenceError::NotFound(id))?;
        let value = apply(&mut process)?;
        match gateway.update_process(&process).await {
            Ok(stored) => return Ok((stored, value)),
            Err(PersistenceError::Conflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                tracing::debug!(process_id = %id, attempt, "version conflict, retrying update");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub(crate) fn snapshot_key(meta: &SnapshotMeta) -> String {
    format!("{}:{}:{}", meta.process_id, meta.stage, meta.branch_id)
}
