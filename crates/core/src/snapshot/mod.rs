//! Snapshot store.
//!
//! A snapshot captures the full generation context at a configured
//! awaiting-input stage. Snapshots are immutable once written. Restoring one
//! never rewrites history: it positions a process on a fresh branch with the
//! captured context and the request of the snapshot's stage outstanding.

use crate::context::GenerationContext;
use crate::error::{EngineError, EngineResult};
use crate::interaction::request::build_request;
use crate::persistence::{update_with_retry, PersistenceGateway, SnapshotInsert, SnapshotRecord};
use crate::state::process::{create_process, restore_process, GenerationProcess};
use chrono::Utc;
use cp_protocol::{Event, SnapshotMeta, Stage};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct SnapshotStore {
    gateway: Arc<dyn PersistenceGateway>,
    checkpoint_stages: Vec<Stage>,
}

impl SnapshotStore {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, checkpoint_stages: Vec<Stage>) -> Self {
        Self {
            gateway,
            checkpoint_stages,
        }
    }

    pub fn is_checkpoint(&self, stage: Stage) -> bool {
        self.checkpoint_stages.contains(&stage)
    }

    /// Capture `context` as the snapshot of `process_id` at `stage` on
    /// `branch_id`.
    ///
    /// Owner and auto-mode settings are taken from the stored process row.
    /// Saving the same `(process, stage, branch)` twice returns the id of the
    /// first snapshot.
    ///
    /// # Errors
    ///
    /// - `NotCheckpointStage` when `stage` is not a configured checkpoint
    /// - `ProcessNotFound` when the process row does not exist
    pub async fn save(
        &self,
        process_id: Uuid,
        branch_id: Uuid,
        stage: Stage,
        context: &GenerationContext,
    ) -> EngineResult<Uuid> {
        if !self.is_checkpoint(stage) {
            return Err(EngineError::NotCheckpointStage(stage));
        }
        let process = self
            .gateway
            .load_process(process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process_id))?;
        let record = SnapshotRecord {
            meta: SnapshotMeta {
                snapshot_id: Uuid::new_v4(),
                process_id,
                branch_id,
                stage,
                created_at: Utc::now(),
            },
            owner_id: process.owner_id,
            auto: process.auto,
            context: context.clone(),
        };
        Ok(self.insert(record).await?.id())
    }

    /// Capture `process` at its current stage and branch.
    ///
    /// Tells whether the snapshot was newly created or already existed.
    pub async fn checkpoint(&self, process: &GenerationProcess) -> EngineResult<SnapshotInsert> {
        let stage = process.current_stage;
        if !self.is_checkpoint(stage) {
            return Err(EngineError::NotCheckpointStage(stage));
        }
        let record = SnapshotRecord {
            meta: SnapshotMeta {
                snapshot_id: Uuid::new_v4(),
                process_id: process.id,
                branch_id: process.branch_id,
                stage,
                created_at: Utc::now(),
            },
            owner_id: process.owner_id.clone(),
            auto: process.auto.clone(),
            context: process.context.clone(),
        };
        self.insert(record).await
    }

    async fn insert(&self, record: SnapshotRecord) -> EngineResult<SnapshotInsert> {
        let inserted = self.gateway.insert_snapshot(&record).await?;
        if let SnapshotInsert::Created(snapshot_id) = inserted {
            info!(
                process_id = %record.meta.process_id,
                %snapshot_id,
                stage = %record.meta.stage,
                "snapshot saved"
            );
        }
        Ok(inserted)
    }

    /// Snapshots of a process, oldest first.
    pub async fn list(&self, process_id: Uuid) -> EngineResult<Vec<SnapshotMeta>> {
        Ok(self.gateway.list_snapshots(process_id).await?)
    }

    pub async fn get(&self, snapshot_id: Uuid) -> EngineResult<SnapshotRecord> {
        self.gateway
            .load_snapshot(snapshot_id)
            .await?
            .ok_or(EngineError::SnapshotNotFound(snapshot_id))
    }

    /// Restore a snapshot into a new process on a new branch.
    ///
    /// The source process is left untouched and may even be gone.
    ///
    /// # Returns
    ///
    /// The new process, as stored, and the events to emit for it.
    pub async fn restore(&self, snapshot_id: Uuid) -> EngineResult<(GenerationProcess, Vec<Event>)> {
        let record = self.get(snapshot_id).await?;
        let mut process = create_process(
            record.owner_id,
            record.context.input.requested.clone(),
            record.auto,
        );
        let request = build_request(record.meta.stage, &record.context, process.id)?;
        let mut events = vec![Event::ProcessStarted {
            process_id: process.id,
            owner_id: process.owner_id.clone(),
            auto_mode: process.is_auto(),
        }];
        events.extend(restore_process(
            &mut process,
            snapshot_id,
            record.context,
            request,
        ));
        self.gateway.insert_process(&process).await?;
        info!(
            source_process_id = %record.meta.process_id,
            process_id = %process.id,
            %snapshot_id,
            "snapshot restored into new process"
        );
        Ok((process, events))
    }

    /// Restore a snapshot of `process_id` in place, on a new branch.
    ///
    /// The caller must make sure no run task is live for the process.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotNotFound` when the snapshot does not exist or belongs
    /// to another process.
    pub async fn restore_into(
        &self,
        snapshot_id: Uuid,
        process_id: Uuid,
    ) -> EngineResult<(GenerationProcess, Vec<Event>)> {
        let record = self.get(snapshot_id).await?;
        if record.meta.process_id != process_id {
            return Err(EngineError::SnapshotNotFound(snapshot_id));
        }
        let request = build_request(record.meta.stage, &record.context, process_id)?;
        let (stored, events) = update_with_retry(self.gateway.as_ref(), process_id, |process| {
            Ok::<_, EngineError>(restore_process(
                process,
                snapshot_id,
                record.context.clone(),
                request.clone(),
            ))
        })
        .await?;
        info!(%process_id, %snapshot_id, branch_id = %stored.branch_id, "snapshot restored");
        Ok((stored, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::default_checkpoint_stages;
    use crate::context::Artifact;
    use crate::persistence::MemoryGateway;
    use cp_protocol::{GenerationParams, Persona, ProcessStatus};

    async fn process_at_persona_selection(
        gateway: &Arc<dyn PersistenceGateway>,
    ) -> GenerationProcess {
        let mut process = create_process(
            "owner".to_string(),
            GenerationParams {
                keywords: vec!["sapporo".to_string()],
                ..Default::default()
            },
            None,
        );
        process
            .context
            .commit(
                Stage::PersonaGeneration,
                Artifact::Personas(vec![Persona {
                    id: 0,
                    name: "Aki".to_string(),
                    description: "young family".to_string(),
                }]),
            )
            .unwrap();
        process.current_stage = Stage::PersonaSelection;
        gateway.insert_process(&process).await.unwrap();
        process
    }

    #[tokio::test]
    async fn test_save_only_at_checkpoints() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(MemoryGateway::new());
        let store = SnapshotStore::new(gateway.clone(), default_checkpoint_stages());
        let mut process = process_at_persona_selection(&gateway).await;

        let first = store.checkpoint(&process).await.unwrap();
        assert!(matches!(first, SnapshotInsert::Created(_)));
        let again = store.checkpoint(&process).await.unwrap();
        assert_eq!(again, SnapshotInsert::Existing(first.id()));

        process.current_stage = Stage::PlanApproval;
        assert!(matches!(
            store.checkpoint(&process).await,
            Err(EngineError::NotCheckpointStage(Stage::PlanApproval))
        ));
        assert!(matches!(
            store
                .save(process.id, process.branch_id, Stage::PlanApproval, &process.context)
                .await,
            Err(EngineError::NotCheckpointStage(Stage::PlanApproval))
        ));
    }

    #[tokio::test]
    async fn test_save_explicit_stage_and_context() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(MemoryGateway::new());
        let store = SnapshotStore::new(gateway.clone(), default_checkpoint_stages());
        let process = process_at_persona_selection(&gateway).await;

        // A context captured at another checkpoint than the row's current stage.
        let mut context = process.context.clone();
        context.apply_persona(Persona {
            id: 0,
            name: "Aki".to_string(),
            description: "young family".to_string(),
        })
        .unwrap();
        let snapshot_id = store
            .save(process.id, process.branch_id, Stage::ThemeSelection, &context)
            .await
            .unwrap();
        let again = store
            .save(process.id, process.branch_id, Stage::ThemeSelection, &process.context)
            .await
            .unwrap();
        assert_eq!(again, snapshot_id);

        let record = store.get(snapshot_id).await.unwrap();
        assert_eq!(record.meta.stage, Stage::ThemeSelection);
        assert_eq!(record.meta.branch_id, process.branch_id);
        assert_eq!(record.owner_id, "owner");
        assert_eq!(record.context, context);

        let metas = store.list(process.id).await.unwrap();
        assert_eq!(metas.len(), 1);

        assert!(matches!(
            store
                .save(Uuid::new_v4(), Uuid::new_v4(), Stage::ThemeSelection, &context)
                .await,
            Err(EngineError::ProcessNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_creates_new_branch_with_same_context() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(MemoryGateway::new());
        let store = SnapshotStore::new(gateway.clone(), default_checkpoint_stages());
        let process = process_at_persona_selection(&gateway).await;
        let snapshot_id = store.checkpoint(&process).await.unwrap().id();

        let (restored, _) = store.restore(snapshot_id).await.unwrap();

        assert_ne!(restored.id, process.id);
        assert_ne!(restored.branch_id, process.branch_id);
        assert_eq!(restored.context, process.context);
        assert_eq!(restored.current_stage, Stage::PersonaSelection);
        assert_eq!(restored.status, ProcessStatus::AwaitingInput);
        assert_eq!(restored.current_snapshot_id, Some(snapshot_id));
        let request = restored.pending_request.unwrap();
        assert_eq!(request.process_id, restored.id);
    }

    #[tokio::test]
    async fn test_restore_into_other_process_is_rejected() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(MemoryGateway::new());
        let store = SnapshotStore::new(gateway.clone(), default_checkpoint_stages());
        let process = process_at_persona_selection(&gateway).await;
        let other = process_at_persona_selection(&gateway).await;
        let snapshot_id = store.checkpoint(&process).await.unwrap().id();

        assert!(matches!(
            store.restore_into(snapshot_id, other.id).await,
            Err(EngineError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(EngineError::SnapshotNotFound(_))
        ));
    }
}
