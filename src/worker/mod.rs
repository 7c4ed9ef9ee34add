//! Worker capability model (§3, §9 "Polymorphic workers").
//!
//! A worker is the gateway's in-process representative of a tool server.
//! Every worker can `execute` a synthesized request and `close`; only
//! persistent (stdio) workers additionally expose the richer
//! `ExtendedWorker` surface (`start`, `call_tool`, `get_tools`,
//! `refresh_tools`, `is_running`). The Engine branches on capability
//! presence via [`Worker::as_extended`] rather than matching a concrete
//! variant tag, per the Design Note's recommendation.

pub mod stdio;
pub mod wasm;

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ScooterError;
use crate::registry::ToolDef;

/// Lifecycle state of a worker, encoded as an atomic u8 so readers never
/// need to take a lock just to check availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

pub const STATE_STARTING: u8 = 0;
pub const STATE_HEALTHY: u8 = 1;
pub const STATE_UNHEALTHY: u8 = 2;
pub const STATE_STOPPED: u8 = 3;

pub fn state_from_atomic(a: &AtomicU8) -> WorkerState {
    match a.load(Ordering::Acquire) {
        STATE_HEALTHY => WorkerState::Healthy,
        STATE_UNHEALTHY => WorkerState::Unhealthy,
        STATE_STOPPED => WorkerState::Stopped,
        _ => WorkerState::Starting,
    }
}

pub fn store_state(a: &AtomicU8, state: WorkerState) {
    let v = match state {
        WorkerState::Starting => STATE_STARTING,
        WorkerState::Healthy => STATE_HEALTHY,
        WorkerState::Unhealthy => STATE_UNHEALTHY,
        WorkerState::Stopped => STATE_STOPPED,
    };
    a.store(v, Ordering::Release);
}

/// Capability every worker has: run a request, tear down.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Run a synthesized JSON-RPC envelope through the worker (used by the
    /// Engine when no persistent `call_tool` path is available — e.g. a
    /// single-shot WASM worker).
    async fn execute(&self, request: Value) -> Result<Value, ScooterError>;

    async fn close(&self) -> Result<(), ScooterError>;

    fn state(&self) -> WorkerState;

    /// Returns `Some(self)` when this worker additionally implements
    /// [`ExtendedWorker`]. Only `StdioWorker` does.
    fn as_extended(&self) -> Option<&dyn ExtendedWorker> {
        None
    }
}

/// The richer surface persistent workers expose (§3: "Stdio workers
/// additionally expose Start, CallTool, GetTools, RefreshTools, IsRunning").
#[async_trait]
pub trait ExtendedWorker: Worker {
    async fn start(
        &self,
        env: std::collections::HashMap<String, String>,
    ) -> Result<(), ScooterError>;

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ScooterError>;

    async fn get_tools(&self) -> Vec<ToolDef>;

    async fn refresh_tools(&self) -> Result<Vec<ToolDef>, ScooterError>;

    fn is_running(&self) -> bool;
}
