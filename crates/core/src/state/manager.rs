//! Execution manager for coordinating pipeline runs.
//!
//! The ExecutionManager is the central orchestrator. It owns one cooperative
//! tokio task per live process, routes control commands and responses to those
//! tasks, and falls back to direct row writes for processes that have no live
//! task (paused after a restart, waiting on a response nobody delivered yet).
//!
//! Capacity is counted in working runs: a run gives its permit back while it
//! is paused or waiting for a manual response, and the call that lets it go
//! on (resume, respond) takes a permit again.

use crate::capability::Capability;
use crate::config::EngineConfig;
use crate::engine::auto_decision::AutoModeSettings;
use crate::engine::executor::StageExecutor;
use crate::engine::{PipelineEngine, RunCommand, RunControl};
use crate::error::{EngineError, EngineResult};
use crate::interaction::{EventBus, InteractionChannel};
use crate::persistence::{update_with_retry, PersistenceGateway};
use crate::snapshot::SnapshotStore;
use crate::state::process::{cancel_process, pause_process, resume_process, GenerationProcess};
use crate::telemetry::TelemetrySink;
use cp_protocol::{
    Event, GenerationParams, InteractionResponse, PauseReason, ProcessState, ProcessStatus,
    SnapshotMeta,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Parameters of a new run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Caller identity, recorded as given.
    pub owner_id: String,
    pub params: GenerationParams,
    /// Auto-mode settings; `None` runs interactively.
    pub auto: Option<AutoModeSettings>,
}

struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    halt: CancellationToken,
    inbox: mpsc::UnboundedSender<RunCommand>,
    state_rx: watch::Receiver<Option<ProcessState>>,
    join: JoinHandle<()>,
}

struct Inner {
    max_active_processes: usize,
    engine: Arc<PipelineEngine>,
    gateway: Arc<dyn PersistenceGateway>,
    snapshots: Arc<SnapshotStore>,
    bus: Arc<EventBus>,
    permits: Arc<Semaphore>,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
}

impl Inner {
    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_run(&self, process_id: Uuid, run_id: Uuid) {
        let mut runs = self.runs();
        if runs
            .get(&process_id)
            .is_some_and(|handle| handle.run_id == run_id)
        {
            runs.remove(&process_id);
        }
    }
}

/// Manages all generation processes.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<Inner>,
}

impl ExecutionManager {
    /// Create a new ExecutionManager.
    ///
    /// # Arguments
    ///
    /// * `config` - Engine configuration (retry policy, checkpoints, limits)
    /// * `capability` - Provider of generation calls
    /// * `gateway` - Row storage shared by every run
    /// * `telemetry` - Observability sink
    pub fn new(
        config: EngineConfig,
        capability: Arc<dyn Capability>,
        gateway: Arc<dyn PersistenceGateway>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let executor = Arc::new(StageExecutor::new(
            capability,
            config.retry.clone(),
            Arc::clone(&telemetry),
        ));
        let snapshots = Arc::new(SnapshotStore::new(
            Arc::clone(&gateway),
            config.checkpoint_stages.clone(),
        ));
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(PipelineEngine::new(
            executor,
            Arc::clone(&gateway),
            Arc::clone(&snapshots),
            Arc::clone(&bus),
            telemetry,
            config.auto.min_outline_sections,
        ));

        Self {
            inner: Arc::new(Inner {
                max_active_processes: config.max_active_processes,
                engine,
                gateway,
                snapshots,
                bus,
                permits: Arc::new(Semaphore::new(config.max_active_processes)),
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn acquire(&self) -> EngineResult<OwnedSemaphorePermit> {
        Arc::clone(&self.inner.permits)
            .try_acquire_owned()
            .map_err(|_| EngineError::CapacityExceeded(self.inner.max_active_processes))
    }

    /// Spawn the run task for `process_id` unless one is already live.
    ///
    /// `permit` may be `None` only for a run that parks as soon as it starts
    /// (a manual run waiting for input).
    fn spawn_run(&self, process_id: Uuid, permit: Option<OwnedSemaphorePermit>) {
        let mut runs = self.inner.runs();
        if runs.contains_key(&process_id) {
            return;
        }

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let halt = CancellationToken::new();
        let control = RunControl {
            cancel: cancel.clone(),
            halt: halt.clone(),
            inbox: inbox_rx,
            state_tx,
            permit,
        };
        let run_id = Uuid::new_v4();
        let engine = Arc::clone(&self.inner.engine);
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);

        let join = tokio::spawn(
            async move {
                match engine.run(process_id, control).await {
                    Ok(exit) => info!(?exit, "run task finished"),
                    Err(err) => error!(error = %err, "run task aborted"),
                }
                if let Some(inner) = registry.upgrade() {
                    inner.remove_run(process_id, run_id);
                }
            }
            .instrument(info_span!("run", %process_id)),
        );

        runs.insert(
            process_id,
            RunHandle {
                run_id,
                cancel,
                halt,
                inbox,
                state_rx,
                join,
            },
        );
    }

    /// Deliver a command to the live task, handing it back if there is none.
    fn send(&self, process_id: Uuid, command: RunCommand) -> Result<(), RunCommand> {
        let runs = self.inner.runs();
        match runs.get(&process_id) {
            Some(handle) => handle.inbox.send(command).map_err(|e| e.0),
            None => Err(command),
        }
    }

    async fn load(&self, process_id: Uuid) -> EngineResult<GenerationProcess> {
        self.inner
            .gateway
            .load_process(process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process_id))
    }

    /// Write a row that has no live task.
    async fn write_row<F>(&self, process_id: Uuid, apply: F) -> EngineResult<GenerationProcess>
    where
        F: FnMut(&mut GenerationProcess) -> EngineResult<Vec<Event>>,
    {
        let (stored, events) =
            update_with_retry(self.inner.gateway.as_ref(), process_id, apply).await?;
        self.inner.engine.emit(events);
        Ok(stored)
    }

    fn invalid_state(process: &GenerationProcess, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            process_id: process.id,
            status: process.status,
            operation,
        }
    }

    pub fn is_live(&self, process_id: Uuid) -> bool {
        self.inner.runs().contains_key(&process_id)
    }

    /// Start a new run in the background.
    ///
    /// # Returns
    ///
    /// The id of the new process. The run proceeds on its own task.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` when `max_active_processes` runs are
    /// working. Runs that are paused or waiting for a manual response do not
    /// count.
    pub async fn start(&self, request: StartRequest) -> EngineResult<Uuid> {
        let permit = self.acquire()?;
        let process = self
            .inner
            .engine
            .create(request.owner_id, request.params, request.auto)
            .await?;
        self.spawn_run(process.id, Some(permit));
        Ok(process.id)
    }

    /// Ask a running or waiting process to pause.
    ///
    /// A running process pauses at its next stage boundary; a waiting one
    /// pauses immediately and keeps its outstanding request.
    pub async fn pause(&self, process_id: Uuid) -> EngineResult<()> {
        let process = self.load(process_id).await?;
        if !matches!(
            process.status,
            ProcessStatus::Running | ProcessStatus::AwaitingInput
        ) {
            return Err(Self::invalid_state(&process, "pause"));
        }
        if self.send(process_id, RunCommand::Pause).is_ok() {
            return Ok(());
        }
        self.write_row(process_id, |p| Ok(pause_process(p, PauseReason::Requested)))
            .await?;
        info!(%process_id, "process paused");
        Ok(())
    }

    /// Cancel a process and wait until the cancellation is recorded.
    ///
    /// An in-flight capability call is not interrupted; its result is
    /// discarded when it arrives.
    pub async fn cancel(&self, process_id: Uuid) -> EngineResult<()> {
        let process = self.load(process_id).await?;
        if process.status.is_terminal() {
            return Err(Self::invalid_state(&process, "cancel"));
        }

        let live = {
            let runs = self.inner.runs();
            runs.get(&process_id).map(|handle| {
                handle.cancel.cancel();
                handle.state_rx.clone()
            })
        };
        if let Some(mut state_rx) = live {
            let settled = state_rx
                .wait_for(|state| {
                    state
                        .as_ref()
                        .is_some_and(|s| s.status.is_terminal())
                })
                .await
                .is_ok();
            if settled {
                return Ok(());
            }
            warn!(%process_id, "run task ended before recording the cancellation");
        }
        self.write_row(process_id, |p| {
            if p.status.is_terminal() {
                return Ok(Vec::new());
            }
            Ok(cancel_process(p))
        })
        .await?;
        info!(%process_id, "process cancelled");
        Ok(())
    }

    /// Resume a paused process, or restore it to one of its snapshots.
    ///
    /// With `snapshot_id`, any live task is stopped first and the process
    /// continues on a new branch from the snapshot. This is the only way out
    /// of the `error` stage.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if no snapshot is given and the process is not paused
    /// - `SnapshotNotFound` if the snapshot does not exist or belongs to
    ///   another process
    /// - `CapacityExceeded` if no capacity is free to continue the run
    pub async fn resume(&self, process_id: Uuid, snapshot_id: Option<Uuid>) -> EngineResult<()> {
        let process = self.load(process_id).await?;

        let Some(snapshot_id) = snapshot_id else {
            if process.status != ProcessStatus::Paused {
                return Err(Self::invalid_state(&process, "resume"));
            }
            let command = RunCommand::Resume {
                permit: self.acquire()?,
            };
            let permit = match self.send(process_id, command) {
                Ok(()) => return Ok(()),
                Err(RunCommand::Resume { permit }) => permit,
                Err(_) => self.acquire()?,
            };
            self.write_row(process_id, |p| {
                if p.status != ProcessStatus::Paused {
                    return Ok(Vec::new());
                }
                Ok(resume_process(p))
            })
            .await?;
            info!(%process_id, "process resumed");
            self.spawn_run(process_id, Some(permit));
            return Ok(());
        };

        // Validate before stopping anything.
        let record = self.inner.snapshots.get(snapshot_id).await?;
        if record.meta.process_id != process_id {
            return Err(EngineError::SnapshotNotFound(snapshot_id));
        }
        self.halt_run(process_id).await;

        let permit = self.acquire()?;
        let (_, events) = self
            .inner
            .snapshots
            .restore_into(snapshot_id, process_id)
            .await?;
        self.inner.engine.emit(events);
        self.spawn_run(process_id, Some(permit));
        Ok(())
    }

    /// Stop the live task of a process, if any, and wait for it to end.
    async fn halt_run(&self, process_id: Uuid) {
        let handle = self.inner.runs().remove(&process_id);
        if let Some(handle) = handle {
            handle.halt.cancel();
            if let Err(err) = handle.join.await {
                warn!(%process_id, error = %err, "run task did not stop cleanly");
            }
        }
    }

    /// Deliver a response to the process's outstanding request.
    ///
    /// Returns once the response has been applied (or rejected).
    ///
    /// # Errors
    ///
    /// - `Protocol` if no request is outstanding or its type is not accepted;
    ///   nothing changes and the caller may resubmit
    /// - `Validation` if the response is semantically invalid; the process is
    ///   now in `error`
    /// - `InvalidState` if the process is paused or terminal
    /// - `CapacityExceeded` if no capacity is free for the work the response
    ///   would start
    pub async fn submit_response(
        &self,
        process_id: Uuid,
        response: InteractionResponse,
    ) -> EngineResult<()> {
        if !self.is_live(process_id) {
            let process = self.load(process_id).await?;
            match process.status {
                ProcessStatus::AwaitingInput => {
                    let permit = if process.is_auto() {
                        Some(self.acquire()?)
                    } else {
                        None
                    };
                    self.spawn_run(process_id, permit);
                }
                ProcessStatus::Running => {
                    return Err(EngineError::Protocol(
                        "no outstanding interaction request".to_string(),
                    ));
                }
                _ => return Err(Self::invalid_state(&process, "respond to")),
            }
        }

        let permit = self.acquire()?;
        let (reply, reply_rx) = oneshot::channel();
        if self
            .send(
                process_id,
                RunCommand::Respond {
                    response,
                    reply,
                    permit,
                },
            )
            .is_err()
        {
            return Err(EngineError::Internal(format!(
                "run task for process {process_id} is gone"
            )));
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => {
                let process = self.load(process_id).await?;
                if process.status == ProcessStatus::Cancelled {
                    Err(EngineError::Cancelled(process_id))
                } else {
                    Err(EngineError::Internal(format!(
                        "run task for process {process_id} ended before handling the response"
                    )))
                }
            }
        }
    }

    /// Attach an interaction channel to a process.
    ///
    /// A previously attached channel is superseded. If the process was paused
    /// because its channel was lost, it goes back to waiting on the same
    /// request, which is delivered on the new channel.
    pub async fn attach(&self, process_id: Uuid) -> EngineResult<InteractionChannel> {
        let process = self.load(process_id).await?;
        let (connection_id, events) = self.inner.bus.register(process_id);
        let channel = InteractionChannel::new(process_id, connection_id, events, self.clone());

        if self.send(process_id, RunCommand::ChannelAttached).is_ok() {
            return Ok(channel);
        }
        match (process.status, process.pause_reason) {
            (ProcessStatus::AwaitingInput, _) => {
                let permit = if process.is_auto() {
                    Some(self.acquire()?)
                } else {
                    None
                };
                self.spawn_run(process_id, permit);
            }
            (ProcessStatus::Paused, Some(PauseReason::ConnectionLost)) => {
                self.write_row(process_id, |p| {
                    if p.status != ProcessStatus::Paused {
                        return Ok(Vec::new());
                    }
                    Ok(resume_process(p))
                })
                .await?;
                self.spawn_run(process_id, None);
            }
            _ => {}
        }
        Ok(channel)
    }

    /// Called when a channel goes away.
    pub(crate) fn detach(&self, process_id: Uuid, connection_id: Uuid) {
        if self.inner.bus.unregister(process_id, connection_id) {
            let _ = self.send(process_id, RunCommand::ChannelLost);
        }
    }

    pub(crate) fn is_current_channel(&self, process_id: Uuid, connection_id: Uuid) -> bool {
        self.inner.bus.is_current(process_id, connection_id)
    }

    pub async fn get_state(&self, process_id: Uuid) -> EngineResult<ProcessState> {
        Ok(self.load(process_id).await?.state())
    }

    /// Full stored row, including the generation context.
    pub async fn get_process(&self, process_id: Uuid) -> EngineResult<GenerationProcess> {
        self.load(process_id).await
    }

    pub async fn list_processes(&self) -> EngineResult<Vec<ProcessState>> {
        Ok(self
            .inner
            .gateway
            .list_processes()
            .await?
            .iter()
            .map(GenerationProcess::state)
            .collect())
    }

    pub async fn list_snapshots(&self, process_id: Uuid) -> EngineResult<Vec<SnapshotMeta>> {
        self.inner.snapshots.list(process_id).await
    }

    /// Restore a snapshot into a new process and start it.
    ///
    /// # Returns
    ///
    /// The id of the new process, waiting at the snapshot's stage.
    pub async fn restore_snapshot(&self, snapshot_id: Uuid) -> EngineResult<Uuid> {
        let permit = self.acquire()?;
        let (process, events) = self.inner.snapshots.restore(snapshot_id).await?;
        self.inner.engine.emit(events);
        self.spawn_run(process.id, Some(permit));
        Ok(process.id)
    }

    /// Delete a process row and its history. Snapshots are kept.
    pub async fn delete_process(&self, process_id: Uuid) -> EngineResult<()> {
        if self.is_live(process_id) {
            let process = self.load(process_id).await?;
            return Err(Self::invalid_state(&process, "delete"));
        }
        if self.inner.gateway.delete_process(process_id).await? {
            info!(%process_id, "process deleted");
            Ok(())
        } else {
            Err(EngineError::ProcessNotFound(process_id))
        }
    }

    /// Wait until the process state satisfies `predicate`.
    ///
    /// When the process has no live task, or its task ends first, the stored
    /// state is returned as is.
    pub async fn wait_for<P>(&self, process_id: Uuid, mut predicate: P) -> EngineResult<ProcessState>
    where
        P: FnMut(&ProcessState) -> bool,
    {
        let state_rx = self
            .inner
            .runs()
            .get(&process_id)
            .map(|handle| handle.state_rx.clone());
        if let Some(mut state_rx) = state_rx {
            let matched = state_rx
                .wait_for(|state| state.as_ref().is_some_and(&mut predicate))
                .await
                .ok()
                .and_then(|state| state.clone());
            if let Some(state) = matched {
                return Ok(state);
            }
        }
        self.get_state(process_id).await
    }

    /// Wait until the process is no longer `running`.
    pub async fn wait_until_settled(&self, process_id: Uuid) -> EngineResult<ProcessState> {
        self.wait_for(process_id, ProcessState::is_settled).await
    }

    /// Mark runs interrupted by a crash as paused.
    ///
    /// Call once on startup, before starting new runs. Interactive processes
    /// waiting on a request are left as they are; they are picked up when a
    /// response or a channel arrives.
    ///
    /// # Returns
    ///
    /// The ids of the processes that were marked.
    pub async fn recover(&self) -> EngineResult<Vec<Uuid>> {
        let mut recovered = Vec::new();
        for process in self.inner.gateway.list_processes().await? {
            if self.is_live(process.id) || !Self::needs_recovery(&process) {
                continue;
            }
            self.write_row(process.id, |p| {
                if !Self::needs_recovery(p) {
                    return Ok(Vec::new());
                }
                Ok(pause_process(p, PauseReason::Interrupted))
            })
            .await?;
            warn!(process_id = %process.id, stage = %process.current_stage, "interrupted run marked as paused");
            recovered.push(process.id);
        }
        Ok(recovered)
    }

    fn needs_recovery(process: &GenerationProcess) -> bool {
        match process.status {
            ProcessStatus::Running => true,
            ProcessStatus::AwaitingInput => process.is_auto(),
            _ => false,
        }
    }

    /// Every server event of every process from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    /// Stop every live task and mark unfinished autonomous work as interrupted.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let handles: Vec<(Uuid, RunHandle)> = self.inner.runs().drain().collect();
        for (_, handle) in &handles {
            handle.halt.cancel();
        }
        for (process_id, handle) in handles {
            if let Err(err) = handle.join.await {
                warn!(%process_id, error = %err, "run task did not stop cleanly");
            }
        }
        self.recover().await?;
        info!("execution manager shut down");
        Ok(())
    }
}
