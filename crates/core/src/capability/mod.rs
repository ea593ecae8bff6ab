//! Capability provider contract.
//!
//! A capability is the external generation call behind an autonomous stage.
//! It receives a structured input built from the context and returns a
//! structured output plus usage telemetry. What the provider does with the
//! input (prompting, model choice) is its own business.

pub mod input;
pub mod scripted;

use async_trait::async_trait;
use cp_protocol::Stage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use scripted::ScriptedCapability;

/// One call to the capability provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub stage: Stage,
    /// Short task name, e.g. `"research_query"`.
    pub task: String,
    pub input: serde_json::Value,
}

/// Token and cost accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub output: serde_json::Value,
    #[serde(default)]
    pub usage: Usage,
}

/// Errors a capability provider can return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Capability call timed out: {0}")]
    Timeout(String),

    #[error("Capability rate limited: {0}")]
    RateLimited(String),

    /// Output could not be used, but asking again may help.
    #[error("Malformed capability response: {0}")]
    Malformed(String),

    #[error("Capability failed: {0}")]
    Fatal(String),
}

impl CapabilityError {
    /// Whether the call may be retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CapabilityError::Fatal(_))
    }
}

/// The generation call behind autonomous stages.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, request: &CapabilityRequest)
        -> Result<CapabilityResponse, CapabilityError>;
}
