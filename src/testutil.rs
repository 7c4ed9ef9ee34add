//! Test utilities — a controllable mock worker implementing `Worker`/
//! `ExtendedWorker` directly, no child process or network connection
//! involved. Adapted from the same "mock at the trait boundary" approach
//! used for exercising concurrency and call routing without real I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ScooterError;
use crate::registry::ToolDef;
use crate::worker::{ExtendedWorker, STATE_HEALTHY, Worker, WorkerState, state_from_atomic, store_state};

/// A controllable mock worker for testing the engine and gateway without
/// spawning a real subprocess.
///
/// ## Tools registered:
/// - `echo_tool`: returns its arguments unchanged (response verification)
/// - `slow_tool`: sleeps `call_delay`, returns (concurrency testing)
/// - `error_tool`: always returns an error
/// - `counter_tool`: returns the current concurrent call count
pub struct MockWorker {
    name: String,
    state: AtomicU8,
    concurrent_calls: AtomicUsize,
    max_seen_concurrent: AtomicUsize,
    call_delay: Duration,
    inject_error: AtomicBool,
    call_log: Mutex<Vec<(String, Option<Value>)>>,
    tools: Vec<ToolDef>,
}

impl MockWorker {
    pub fn new(name: &str, call_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: AtomicU8::new(STATE_HEALTHY),
            concurrent_calls: AtomicUsize::new(0),
            max_seen_concurrent: AtomicUsize::new(0),
            call_delay,
            inject_error: AtomicBool::new(false),
            call_log: Mutex::new(Vec::new()),
            tools: vec![
                ToolDef {
                    name: "echo_tool".to_string(),
                    description: "Returns arguments unchanged".to_string(),
                    input_schema: serde_json::json!({"type": "object", "properties": {}}),
                },
                ToolDef {
                    name: "slow_tool".to_string(),
                    description: "Sleeps call_delay then returns".to_string(),
                    input_schema: serde_json::json!({"type": "object", "properties": {}}),
                },
                ToolDef {
                    name: "error_tool".to_string(),
                    description: "Always returns an error".to_string(),
                    input_schema: serde_json::json!({"type": "object", "properties": {}}),
                },
                ToolDef {
                    name: "counter_tool".to_string(),
                    description: "Returns current concurrent call count".to_string(),
                    input_schema: serde_json::json!({"type": "object", "properties": {}}),
                },
            ],
        })
    }

    pub fn set_inject_error(&self, inject: bool) {
        self.inject_error.store(inject, Ordering::SeqCst);
    }

    pub fn max_seen_concurrent(&self) -> usize {
        self.max_seen_concurrent.load(Ordering::SeqCst)
    }

    pub async fn call_log(&self) -> Vec<(String, Option<Value>)> {
        self.call_log.lock().await.clone()
    }
}

/// Decrements the in-flight counter on drop, so cancellation (e.g. via
/// `tokio::select!` or `abort()`) never leaves it stuck high.
struct ConcurrencyGuard<'a>(&'a AtomicUsize);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Worker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: Value) -> Result<Value, ScooterError> {
        let tool_name = request
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = request.get("arguments").cloned();
        self.call_tool(&tool_name, arguments).await
    }

    async fn close(&self) -> Result<(), ScooterError> {
        store_state(&self.state, WorkerState::Stopped);
        Ok(())
    }

    fn state(&self) -> WorkerState {
        state_from_atomic(&self.state)
    }

    fn as_extended(&self) -> Option<&dyn ExtendedWorker> {
        Some(self)
    }
}

#[async_trait]
impl ExtendedWorker for MockWorker {
    async fn start(&self, _env: std::collections::HashMap<String, String>) -> Result<(), ScooterError> {
        store_state(&self.state, WorkerState::Healthy);
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ScooterError> {
        let current = self.concurrent_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen_concurrent.fetch_max(current, Ordering::SeqCst);
        let _guard = ConcurrencyGuard(&self.concurrent_calls);

        self.call_log
            .lock()
            .await
            .push((tool_name.to_string(), arguments.clone()));

        if self.inject_error.load(Ordering::SeqCst) || tool_name == "error_tool" {
            return Err(ScooterError::DownstreamError {
                server: self.name.clone(),
                code: -32000,
                message: format!("injected error for tool '{tool_name}'"),
            });
        }

        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }

        Ok(match tool_name {
            "echo_tool" => arguments.unwrap_or(Value::Null),
            "slow_tool" => serde_json::json!({
                "status": "completed",
                "delay_ms": self.call_delay.as_millis() as u64,
            }),
            "counter_tool" => serde_json::json!({"concurrent": current}),
            _ => serde_json::json!({"tool": tool_name, "status": "ok"}),
        })
    }

    async fn get_tools(&self) -> Vec<ToolDef> {
        self.tools.clone()
    }

    async fn refresh_tools(&self) -> Result<Vec<ToolDef>, ScooterError> {
        Ok(self.tools.clone())
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), WorkerState::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_arguments_unchanged() {
        let mock = MockWorker::new("test", Duration::ZERO);
        let args = serde_json::json!({"message": "hello", "count": 42});
        let result = mock.call_tool("echo_tool", Some(args.clone())).await.unwrap();
        assert_eq!(result, args);
    }

    #[tokio::test]
    async fn slow_tool_actually_waits() {
        let mock = MockWorker::new("test", Duration::from_millis(100));
        let start = std::time::Instant::now();
        let result = mock.call_tool("slow_tool", None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert_eq!(result["status"], "completed");
    }

    #[tokio::test]
    async fn error_tool_and_injected_errors_surface_as_downstream_error() {
        let mock = MockWorker::new("test", Duration::ZERO);
        let err = mock.call_tool("error_tool", None).await.unwrap_err();
        assert!(matches!(err, ScooterError::DownstreamError { .. }));

        mock.set_inject_error(true);
        let err = mock.call_tool("echo_tool", None).await.unwrap_err();
        assert!(matches!(err, ScooterError::DownstreamError { .. }));
    }

    #[tokio::test]
    async fn concurrent_calls_are_tracked_accurately() {
        let mock = MockWorker::new("test", Duration::from_millis(200));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let m = Arc::clone(&mock);
            handles.push(tokio::spawn(async move {
                m.call_tool("slow_tool", None).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(mock.max_seen_concurrent(), 5);
    }
}
