//! Common test utilities and helpers for integration tests.
//!
//! This module provides shared functionality across the integration tests:
//! - Fixtures (run parameters, configured managers)
//! - Custom assertions over events and step history
//! - Scripted capabilities for specific scenarios
//! - A gateway that fails writes on request

pub mod assertions;
pub mod failing_gateway;
pub mod fixtures;
pub mod mock_capabilities;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use failing_gateway::*;
#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use mock_capabilities::*;
