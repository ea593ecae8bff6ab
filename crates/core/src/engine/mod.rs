//! Pipeline execution engine.
//!
//! The PipelineEngine drives one generation process through the state machine.
//! It runs autonomous stages through the [`executor::StageExecutor`], parks the
//! process at awaiting-input stages and applies decisions, manual or automated,
//! through a single validation path.
//!
//! Every state change goes through the persistence gateway first; events are
//! emitted only after the write succeeded.

pub mod auto_decision;
pub mod executor;
pub mod validation;

use crate::context::ContextField;
use crate::error::{EngineError, EngineResult};
use crate::interaction::request::build_request;
use crate::interaction::EventBus;
use crate::persistence::{update_with_retry, PersistenceGateway, SnapshotInsert};
use crate::snapshot::SnapshotStore;
use crate::state::machine::{Outcome, PipelineStateMachine, StageKind};
use crate::state::process::{
    await_input, cancel_process, complete_process, complete_stage, create_process, enter_stage,
    fail_process, pause_process, record_decision, resume_process, GenerationProcess,
};
use crate::telemetry::TelemetrySink;
use auto_decision::AutoModeSettings;
use cp_protocol::{
    Event, GenerationParams, InteractionResponse, PauseReason, ProcessState, ProcessStatus, Stage,
    UserInputType,
};
use executor::StageExecutor;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validation::{apply_decision, validate_response};

/// Commands delivered to a live run.
///
/// Commands that let a parked run go on carry the capacity permit it will
/// hold while working.
#[derive(Debug)]
pub(crate) enum RunCommand {
    Respond {
        response: InteractionResponse,
        reply: oneshot::Sender<EngineResult<()>>,
        permit: OwnedSemaphorePermit,
    },
    Pause,
    Resume {
        permit: OwnedSemaphorePermit,
    },
    ChannelAttached,
    ChannelLost,
}

/// Everything a run task needs besides the engine itself.
pub(crate) struct RunControl {
    /// Cancels the process; observed at boundaries and wait points.
    pub(crate) cancel: CancellationToken,
    /// Stops the task without touching the row, for shutdown and in-place restore.
    pub(crate) halt: CancellationToken,
    pub(crate) inbox: mpsc::UnboundedReceiver<RunCommand>,
    pub(crate) state_tx: watch::Sender<Option<ProcessState>>,
    /// Capacity slot; held while the run works, released while it is parked.
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl RunControl {
    fn publish(&self, process: &GenerationProcess) {
        self.state_tx.send_replace(Some(process.state()));
    }

    /// Give the capacity slot back while waiting on a person.
    fn park(&mut self) {
        if self.permit.take().is_some() {
            debug!("capacity released while parked");
        }
    }
}

/// How a run task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Completed,
    Failed,
    Cancelled,
    /// Stopped without a terminal state; the row can be picked up again.
    Halted,
}

/// Signals collected between boundaries.
#[derive(Debug, Default)]
struct RunFlags {
    pause_requested: bool,
    channel_lost: bool,
}

/// Whether the loop goes on or the task ends.
type Step = Option<RunExit>;

/// Context field written by an autonomous stage.
fn produced_field(stage: Stage) -> Option<ContextField> {
    match stage {
        Stage::Start => Some(ContextField::AcceptedParams),
        Stage::KeywordAnalysis => Some(ContextField::KeywordAnalysis),
        Stage::PersonaGeneration => Some(ContextField::PersonaCandidates),
        Stage::ThemeGeneration => Some(ContextField::ThemeCandidates),
        Stage::ResearchPlanning => Some(ContextField::ResearchPlan),
        Stage::ResearchExecution => Some(ContextField::ResearchResults),
        Stage::ResearchSynthesis => Some(ContextField::ResearchReport),
        Stage::OutlineGeneration => Some(ContextField::GeneratedOutline),
        Stage::SectionWriting => Some(ContextField::Sections),
        Stage::Editing => Some(ContextField::FinalOutput),
        _ => None,
    }
}

/// The main pipeline execution engine.
pub struct PipelineEngine {
    machine: PipelineStateMachine,
    executor: Arc<StageExecutor>,
    gateway: Arc<dyn PersistenceGateway>,
    snapshots: Arc<SnapshotStore>,
    bus: Arc<EventBus>,
    telemetry: Arc<dyn TelemetrySink>,
    /// Minimum outline sections for manual approval.
    min_outline_sections: usize,
}

impl PipelineEngine {
    /// Create a new PipelineEngine.
    ///
    /// # Arguments
    ///
    /// * `executor` - Runs autonomous stages
    /// * `gateway` - Shared row storage
    /// * `snapshots` - Checkpoint store
    /// * `bus` - Event fan-out
    /// * `telemetry` - Observability sink
    /// * `min_outline_sections` - Minimum outline sections accepted on approval
    pub fn new(
        executor: Arc<StageExecutor>,
        gateway: Arc<dyn PersistenceGateway>,
        snapshots: Arc<SnapshotStore>,
        bus: Arc<EventBus>,
        telemetry: Arc<dyn TelemetrySink>,
        min_outline_sections: usize,
    ) -> Self {
        Self {
            machine: PipelineStateMachine::new(),
            executor,
            gateway,
            snapshots,
            bus,
            telemetry,
            min_outline_sections,
        }
    }

    pub(crate) fn emit(&self, events: Vec<Event>) {
        for event in events {
            self.telemetry.record_event(&event);
            self.bus.emit(event);
        }
    }

    /// Create and store a new process positioned at `start`.
    pub async fn create(
        &self,
        owner_id: String,
        params: GenerationParams,
        auto: Option<AutoModeSettings>,
    ) -> EngineResult<GenerationProcess> {
        let mut process = create_process(owner_id, params, auto);
        let mut events = vec![Event::ProcessStarted {
            process_id: process.id,
            owner_id: process.owner_id.clone(),
            auto_mode: process.is_auto(),
        }];
        events.extend(enter_stage(&mut process, Stage::Start));
        self.gateway.insert_process(&process).await?;
        info!(process_id = %process.id, owner_id = %process.owner_id, auto = process.is_auto(), "process created");
        self.emit(events);
        Ok(process)
    }

    async fn load(&self, process_id: Uuid) -> EngineResult<GenerationProcess> {
        self.gateway
            .load_process(process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process_id))
    }

    /// Persist a change, then publish the new state and emit its events.
    async fn write<F>(
        &self,
        control: &RunControl,
        process_id: Uuid,
        apply: F,
    ) -> EngineResult<GenerationProcess>
    where
        F: FnMut(&mut GenerationProcess) -> EngineResult<Vec<Event>>,
    {
        let (stored, events) = update_with_retry(self.gateway.as_ref(), process_id, apply).await?;
        control.publish(&stored);
        self.emit(events);
        Ok(stored)
    }

    /// Drive the process until it reaches a terminal state or the task is halted.
    ///
    /// # Errors
    ///
    /// Only non-escalating failures are returned (persistence, internal).
    /// Escalating failures are recorded on the row and end the run with
    /// [`RunExit::Failed`].
    pub(crate) async fn run(&self, process_id: Uuid, mut control: RunControl) -> EngineResult<RunExit> {
        let mut flags = RunFlags::default();
        loop {
            if control.halt.is_cancelled() {
                return Ok(RunExit::Halted);
            }
            let process = self.load(process_id).await?;
            control.publish(&process);

            match process.status {
                ProcessStatus::Completed => return Ok(RunExit::Completed),
                ProcessStatus::Error => return Ok(RunExit::Failed),
                ProcessStatus::Cancelled => return Ok(RunExit::Cancelled),
                _ => {}
            }
            if control.cancel.is_cancelled() {
                return self.cancel_run(&control, process_id).await;
            }

            let stage = process.current_stage;
            let step = if process.status == ProcessStatus::Paused {
                self.wait_paused(&process, &mut control, &mut flags).await
            } else if flags.pause_requested {
                flags.pause_requested = false;
                self.pause(&mut control, process_id, PauseReason::Requested)
                    .await
                    .map(|_| None)
            } else {
                match self.machine.kind(stage) {
                    StageKind::Autonomous => self.run_autonomous(&process, &mut control, &mut flags).await,
                    StageKind::AwaitingInput => self.run_awaiting(&process, &mut control, &mut flags).await,
                    StageKind::Terminal => Err(EngineError::Internal(format!(
                        "process is {} at terminal stage {stage}",
                        process.status
                    ))),
                }
            };

            match step {
                Ok(None) => continue,
                Ok(Some(exit)) => return Ok(exit),
                Err(err) if err.escalates() => {
                    warn!(%process_id, %stage, error = %err, "stage failed");
                    let message = err.to_string();
                    self.write(&control, process_id, |p| {
                        Ok(fail_process(p, stage, message.clone()))
                    })
                    .await?;
                    return Ok(RunExit::Failed);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn cancel_run(&self, control: &RunControl, process_id: Uuid) -> EngineResult<RunExit> {
        self.write(control, process_id, |p| {
            if p.status.is_terminal() {
                return Ok(Vec::new());
            }
            Ok(cancel_process(p))
        })
        .await?;
        info!(%process_id, "process cancelled");
        Ok(RunExit::Cancelled)
    }

    async fn pause(
        &self,
        control: &mut RunControl,
        process_id: Uuid,
        reason: PauseReason,
    ) -> EngineResult<GenerationProcess> {
        control.park();
        let stored = self
            .write(control, process_id, |p| Ok(pause_process(p, reason)))
            .await?;
        info!(%process_id, ?reason, stage = %stored.current_stage, "process paused");
        Ok(stored)
    }

    /// Handle commands that arrived while a stage was executing.
    fn drain_inbox(control: &mut RunControl, flags: &mut RunFlags) {
        while let Ok(command) = control.inbox.try_recv() {
            match command {
                RunCommand::Respond { reply, .. } => {
                    let _ = reply.send(Err(EngineError::Protocol(
                        "no outstanding interaction request".to_string(),
                    )));
                }
                RunCommand::Pause => flags.pause_requested = true,
                RunCommand::Resume { .. } => {}
                RunCommand::ChannelAttached => flags.channel_lost = false,
                RunCommand::ChannelLost => flags.channel_lost = true,
            }
        }
    }

    async fn run_autonomous(
        &self,
        process: &GenerationProcess,
        control: &mut RunControl,
        flags: &mut RunFlags,
    ) -> EngineResult<Step> {
        let process_id = process.id;
        let stage = process.current_stage;
        let already_produced = produced_field(stage).is_some_and(|field| process.context.has(field));

        if already_produced {
            debug!(%process_id, %stage, "artifact already committed, advancing");
        } else {
            info!(%process_id, %stage, "stage started");
            let executor = Arc::clone(&self.executor);
            let context = process.context.clone();
            let mut task = tokio::spawn(async move { executor.execute(stage, &context).await });

            let result = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => {
                    // The in-flight call finishes on its own; its result is dropped.
                    return self.cancel_run(control, process_id).await.map(Some);
                }
                _ = control.halt.cancelled() => return Ok(Some(RunExit::Halted)),
                joined = &mut task => joined
                    .map_err(|e| EngineError::Internal(format!("stage task failed: {e}")))?,
            };
            let artifact = result.map_err(EngineError::from)?;

            if control.cancel.is_cancelled() {
                return self.cancel_run(control, process_id).await.map(Some);
            }
            self.write(control, process_id, |p| {
                p.context.commit(stage, artifact.clone())?;
                Ok(complete_stage(p, stage))
            })
            .await?;
            info!(%process_id, %stage, "stage completed");
        }

        let next = self
            .machine
            .get_next(stage, Outcome::Succeeded)
            .ok_or(EngineError::InvalidTransition {
                stage,
                outcome: Outcome::Succeeded,
            })?;
        self.write(control, process_id, |p| {
            if p.current_stage != stage {
                return Ok(Vec::new());
            }
            if next == Stage::Completed {
                Ok(complete_process(p))
            } else {
                Ok(enter_stage(p, next))
            }
        })
        .await?;
        if next == Stage::Completed {
            info!(%process_id, "process completed");
        }

        Self::drain_inbox(control, flags);
        Ok(None)
    }

    async fn run_awaiting(
        &self,
        process: &GenerationProcess,
        control: &mut RunControl,
        flags: &mut RunFlags,
    ) -> EngineResult<Step> {
        let process_id = process.id;
        let stage = process.current_stage;
        let request = match &process.pending_request {
            Some(pending) if pending.stage == stage => pending.clone(),
            _ => build_request(stage, &process.context, process_id)?,
        };

        if !process.is_auto() {
            control.park();
        }
        let snapshot = if self.snapshots.is_checkpoint(stage) {
            Some(self.snapshots.checkpoint(process).await?)
        } else {
            None
        };

        let stored = self
            .write(control, process_id, |p| {
                let mut events = Vec::new();
                if let Some(inserted) = snapshot {
                    p.current_snapshot_id = Some(inserted.id());
                    if matches!(inserted, SnapshotInsert::Created(_)) {
                        events.push(Event::SnapshotSaved {
                            process_id,
                            snapshot_id: inserted.id(),
                            stage,
                        });
                    }
                }
                events.extend(await_input(p, request.clone()));
                Ok(events)
            })
            .await?;
        debug!(%process_id, %stage, request_id = %request.request_id, "awaiting input");

        if let Some(settings) = &stored.auto {
            let decision = auto_decision::decide(&request, &stored.context, settings)?;
            info!(
                %process_id,
                %stage,
                response_type = %decision.response.response_type(),
                score = ?decision.score,
                reason = %decision.reason,
                "auto decision"
            );
            self.apply_response(
                control,
                process_id,
                &decision.response,
                true,
                Some(decision.reason),
                settings.min_outline_sections,
            )
            .await?;
            return Ok(None);
        }

        if flags.channel_lost {
            flags.channel_lost = false;
            self.pause(control, process_id, PauseReason::ConnectionLost)
                .await?;
            return Ok(None);
        }

        loop {
            let command = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => {
                    return self.cancel_run(control, process_id).await.map(Some);
                }
                _ = control.halt.cancelled() => return Ok(Some(RunExit::Halted)),
                command = control.inbox.recv() => command,
            };
            let Some(command) = command else {
                return Ok(Some(RunExit::Halted));
            };

            match command {
                RunCommand::Respond {
                    response,
                    reply,
                    permit,
                } => {
                    let applied = self
                        .apply_response(
                            control,
                            process_id,
                            &response,
                            false,
                            None,
                            self.min_outline_sections,
                        )
                        .await;
                    match applied {
                        Ok(()) => {
                            control.permit = Some(permit);
                            let _ = reply.send(Ok(()));
                            return Ok(None);
                        }
                        Err(err) if err.escalates() => {
                            warn!(%process_id, %stage, error = %err, "response rejected, failing run");
                            let message = err.to_string();
                            self.write(control, process_id, |p| {
                                Ok(fail_process(p, stage, message.clone()))
                            })
                            .await?;
                            let _ = reply.send(Err(err));
                            return Ok(Some(RunExit::Failed));
                        }
                        Err(err) => {
                            debug!(%process_id, %stage, error = %err, "response rejected");
                            let _ = reply.send(Err(err));
                        }
                    }
                }
                RunCommand::Pause => {
                    self.pause(control, process_id, PauseReason::Requested)
                        .await?;
                    return Ok(None);
                }
                RunCommand::ChannelLost => {
                    self.pause(control, process_id, PauseReason::ConnectionLost)
                        .await?;
                    return Ok(None);
                }
                RunCommand::ChannelAttached => {
                    self.emit(vec![Event::InteractionRequested {
                        process_id,
                        request: request.clone(),
                    }]);
                }
                RunCommand::Resume { .. } => {}
            }
        }
    }

    async fn wait_paused(
        &self,
        process: &GenerationProcess,
        control: &mut RunControl,
        flags: &mut RunFlags,
    ) -> EngineResult<Step> {
        let process_id = process.id;
        control.park();
        loop {
            let command = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => {
                    return self.cancel_run(control, process_id).await.map(Some);
                }
                _ = control.halt.cancelled() => return Ok(Some(RunExit::Halted)),
                command = control.inbox.recv() => command,
            };
            let Some(command) = command else {
                return Ok(Some(RunExit::Halted));
            };

            match command {
                RunCommand::Resume { permit } => {
                    control.permit = Some(permit);
                    flags.channel_lost = false;
                    self.resume(control, process_id).await?;
                    return Ok(None);
                }
                RunCommand::ChannelAttached => {
                    flags.channel_lost = false;
                    // Resumes into a manual wait, so no permit is needed.
                    if process.pause_reason == Some(PauseReason::ConnectionLost) {
                        self.resume(control, process_id).await?;
                        return Ok(None);
                    }
                }
                RunCommand::Respond { reply, .. } => {
                    let _ = reply.send(Err(EngineError::InvalidState {
                        process_id,
                        status: ProcessStatus::Paused,
                        operation: "respond to",
                    }));
                }
                RunCommand::Pause | RunCommand::ChannelLost => {}
            }
        }
    }

    async fn resume(&self, control: &RunControl, process_id: Uuid) -> EngineResult<()> {
        self.write(control, process_id, |p| {
            if p.status != ProcessStatus::Paused {
                return Ok(Vec::new());
            }
            Ok(resume_process(p))
        })
        .await?;
        info!(%process_id, "process resumed");
        Ok(())
    }

    /// Validate and apply a response in a single row write.
    ///
    /// Manual and automated responses both come through here.
    ///
    /// # Errors
    ///
    /// - `Protocol` if nothing is outstanding or the type is not accepted;
    ///   the row is not written
    /// - `Validation` if the response is semantically invalid
    /// - `InvalidTransition` if the table has no edge for the outcome
    async fn apply_response(
        &self,
        control: &RunControl,
        process_id: Uuid,
        response: &InteractionResponse,
        automated: bool,
        reason: Option<String>,
        min_outline_sections: usize,
    ) -> EngineResult<()> {
        let machine = self.machine;
        let response_type: UserInputType = response.response_type();
        let stored = self
            .write(control, process_id, |p| {
                let stage = p.current_stage;
                let decision = validate_response(
                    p.pending_request.as_ref(),
                    response,
                    &p.context,
                    min_outline_sections,
                )?;
                let outcome = apply_decision(&mut p.context, stage, decision)?;
                let next = machine
                    .get_next(stage, outcome)
                    .ok_or(EngineError::InvalidTransition { stage, outcome })?;
                let mut events = record_decision(p, response_type, automated, reason.clone());
                events.extend(enter_stage(p, next));
                Ok(events)
            })
            .await?;
        info!(
            %process_id,
            %response_type,
            automated,
            next_stage = %stored.current_stage,
            "decision applied"
        );
        Ok(())
    }
}
