//! The WASM Worker (§3): a single-shot variant of [`Worker`].
//!
//! Unlike [`super::stdio::StdioWorker`] it has no persistent process to
//! manage, so it implements only the base `Worker` capability — no
//! `Start`/`CallTool`/`GetTools`/`RefreshTools`/`IsRunning` (§3: "Stdio
//! workers additionally expose..." implies WASM workers do not). Actual
//! module execution is delegated to a [`WasmRuntime`] implementation; WASM
//! execution itself is an out-of-scope external collaborator (§1), so none
//! is bundled here.
//!
//! Design Note ("potential WASM concurrency bug", §9): dispatch into a
//! given WASM instance must be serialized, since nothing in §3/§4 suggests
//! the runtime collaborator is expected to be reentrant. Each worker holds
//! its own `tokio::sync::Mutex` for that purpose, mirroring the Stdio
//! Worker's single-mutex discipline rather than introducing a second
//! concurrency model.

use std::sync::atomic::AtomicU8;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ScooterError;
use crate::worker::{STATE_HEALTHY, Worker, WorkerState, state_from_atomic, store_state};

/// The out-of-scope collaborator that actually executes a WASM module.
/// Implementations own module loading, linear memory, and host imports;
/// this crate only needs something that turns a request `Value` into a
/// response `Value`.
#[async_trait]
pub trait WasmRuntime: Send + Sync {
    async fn invoke(&self, request: Value) -> Result<Value, ScooterError>;
}

/// A runtime that has not been wired up; returns `Internal` for every call
/// so a misconfigured WASM entry fails loudly rather than silently.
#[derive(Debug, Default)]
pub struct UnconfiguredRuntime;

#[async_trait]
impl WasmRuntime for UnconfiguredRuntime {
    async fn invoke(&self, _request: Value) -> Result<Value, ScooterError> {
        Err(ScooterError::Internal(
            "no WASM runtime is configured for this worker".to_string(),
        ))
    }
}

pub struct WasmWorker {
    name: String,
    state: AtomicU8,
    runtime: Box<dyn WasmRuntime>,
    /// Serializes dispatch into the runtime (Design Note, §9).
    dispatch: Mutex<()>,
}

impl WasmWorker {
    pub fn new(name: String, runtime: Box<dyn WasmRuntime>) -> Self {
        Self {
            name,
            state: AtomicU8::new(STATE_HEALTHY),
            runtime,
            dispatch: Mutex::new(()),
        }
    }

    pub fn unconfigured(name: String) -> Self {
        Self::new(name, Box::new(UnconfiguredRuntime))
    }
}

#[async_trait]
impl Worker for WasmWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: Value) -> Result<Value, ScooterError> {
        let _guard = self.dispatch.lock().await;
        self.runtime.invoke(request).await
    }

    async fn close(&self) -> Result<(), ScooterError> {
        store_state(&self.state, WorkerState::Stopped);
        Ok(())
    }

    fn state(&self) -> WorkerState {
        state_from_atomic(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoRuntime;

    #[async_trait]
    impl WasmRuntime for EchoRuntime {
        async fn invoke(&self, request: Value) -> Result<Value, ScooterError> {
            Ok(request)
        }
    }

    #[tokio::test]
    async fn execute_delegates_to_runtime() {
        let worker = WasmWorker::new("calc".to_string(), Box::new(EchoRuntime));
        let result = worker.execute(json!({"op": "add"})).await.unwrap();
        assert_eq!(result, json!({"op": "add"}));
        assert_eq!(worker.state(), WorkerState::Healthy);
    }

    #[tokio::test]
    async fn unconfigured_runtime_errors_loudly() {
        let worker = WasmWorker::unconfigured("calc".to_string());
        let err = worker.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ScooterError::Internal(_)));
    }

    #[tokio::test]
    async fn close_marks_stopped() {
        let worker = WasmWorker::new("calc".to_string(), Box::new(EchoRuntime));
        worker.close().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn dispatch_is_serialized() {
        // Two concurrent calls should both succeed; the mutex only bounds
        // concurrency, it doesn't reject overlap.
        let worker = std::sync::Arc::new(WasmWorker::new("calc".to_string(), Box::new(EchoRuntime)));
        let a = worker.clone();
        let b = worker.clone();
        let (r1, r2) = tokio::join!(
            a.execute(json!({"n": 1})),
            b.execute(json!({"n": 2})),
        );
        assert!(r1.is_ok() && r2.is_ok());
    }
}
