//! Test fixtures for creating managers and run parameters.

use cp_core::capability::ScriptedCapability;
use cp_core::config::{EngineConfig, RetryConfig};
use cp_core::engine::auto_decision::AutoModeSettings;
use cp_core::persistence::{MemoryGateway, PersistenceGateway};
use cp_core::telemetry::MemorySink;
use cp_core::{ExecutionManager, StartRequest};
use cp_protocol::{GenerationParams, ProcessState, Stage};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for any wait in the integration tests.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn params() -> GenerationParams {
    GenerationParams {
        keywords: vec!["札幌".to_string(), "注文住宅".to_string()],
        target_audience: Some("families building their first home".to_string()),
        target_length: Some(4000),
        persona_count: 2,
        theme_count: 2,
    }
}

/// Defaults without retry delays.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig::none(),
        ..Default::default()
    }
}

pub fn manual_request() -> StartRequest {
    StartRequest {
        owner_id: "user-1".to_string(),
        params: params(),
        auto: None,
    }
}

pub fn auto_request(settings: AutoModeSettings) -> StartRequest {
    StartRequest {
        owner_id: "user-1".to_string(),
        params: params(),
        auto: Some(settings),
    }
}

/// A manager over in-memory storage, with handles to its collaborators.
pub struct Harness {
    pub manager: ExecutionManager,
    pub capability: ScriptedCapability,
    pub gateway: Arc<MemoryGateway>,
    pub sink: Arc<MemorySink>,
}

pub fn harness(capability: ScriptedCapability) -> Harness {
    harness_with_config(test_config(), capability)
}

pub fn harness_with_config(config: EngineConfig, capability: ScriptedCapability) -> Harness {
    let gateway = Arc::new(MemoryGateway::new());
    let sink = Arc::new(MemorySink::new());
    let manager = ExecutionManager::new(
        config,
        Arc::new(capability.clone()),
        gateway.clone(),
        sink.clone(),
    );
    Harness {
        manager,
        capability,
        gateway,
        sink,
    }
}

/// A manager over the given storage.
pub fn manager_over(gateway: Arc<dyn PersistenceGateway>, capability: ScriptedCapability) -> ExecutionManager {
    ExecutionManager::new(
        test_config(),
        Arc::new(capability),
        gateway,
        Arc::new(MemorySink::new()),
    )
}

/// Wait until the process is no longer running.
pub async fn settle(manager: &ExecutionManager, process_id: Uuid) -> ProcessState {
    tokio::time::timeout(WAIT, manager.wait_until_settled(process_id))
        .await
        .expect("process did not settle in time")
        .expect("failed to read process state")
}

/// Wait until the process state satisfies `predicate`.
pub async fn wait_until<P>(manager: &ExecutionManager, process_id: Uuid, predicate: P) -> ProcessState
where
    P: FnMut(&ProcessState) -> bool,
{
    tokio::time::timeout(WAIT, manager.wait_for(process_id, predicate))
        .await
        .expect("condition not reached in time")
        .expect("failed to read process state")
}

/// Wait until the process has no live run task.
pub async fn wait_until_idle(manager: &ExecutionManager, process_id: Uuid) {
    tokio::time::timeout(WAIT, async {
        while manager.is_live(process_id) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("run task did not end in time");
}

/// Wait until the process is waiting for input at `stage`.
pub async fn wait_for_stage(manager: &ExecutionManager, process_id: Uuid, stage: Stage) -> ProcessState {
    wait_until(manager, process_id, |state| {
        state.current_step == stage && state.is_waiting_for_input
    })
    .await
}
