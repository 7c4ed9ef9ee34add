//! The Stdio Worker (§4.3) — the hard subsystem.
//!
//! Owns one long-lived child process speaking MCP over newline-delimited
//! JSON-RPC on its stdin/stdout. Everything here is hand-rolled: the
//! teacher delegates this whole concern to `rmcp::ServiceExt::serve()`,
//! which doesn't expose the 3-way bring-up race, the critical-stderr-line
//! classifier, or the monotonic-request-id-under-lock discipline §4.3
//! mandates. Process spawn/kill-group mechanics (process group via
//! `cmd.process_group(0)`, `libc::kill(-(pid), SIGTERM)`) are carried over
//! from the teacher's `backend/stdio.rs::kill_child`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::AtomicU8;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::error::ScooterError;
use crate::registry::ToolDef;
use crate::worker::{ExtendedWorker, STATE_HEALTHY, STATE_STARTING, STATE_STOPPED, Worker, WorkerState, state_from_atomic, store_state};

/// Bring-up and per-request hard timeout (§4.3, §5): 60s.
const BRING_UP_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Graceful-close wait before SIGKILL (§4.3 Close).
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// `tools/list` bring-up retry budget (§4.3 Handshake step 3).
const TOOLS_LIST_RETRIES: usize = 3;
const TOOLS_LIST_BACKOFF: Duration = Duration::from_millis(500);
/// How many non-JSON stdout lines we'll skip before giving up (§4.3 subtle
/// points: "implementers may attempt to skip lines that do not parse as
/// JSON, but must bound this").
const MAX_NON_JSON_SKIP: usize = 10;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// A line on stderr is "critical" if it looks like a fatal startup error,
/// excluding noisy-but-harmless npm warnings (§4.3 step 2).
fn is_critical_stderr_line(line: &str) -> bool {
    if line.starts_with("npm WARN") {
        return false;
    }
    line.contains("Error:") || line.contains("Exception") || line.contains("environment variable is required")
}

struct Inner {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<tokio::process::ChildStdout>>,
    next_id: i64,
    tools: Vec<ToolDef>,
    initialized: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            child: None,
            stdin: None,
            stdout: None,
            next_id: 1,
            tools: Vec::new(),
            initialized: false,
        }
    }
}

/// Persistent subprocess worker. Construction only captures the launch
/// spec; `start()` performs the full bring-up and is idempotent.
pub struct StdioWorker {
    name: String,
    command: String,
    args: Vec<String>,
    state: AtomicU8,
    /// Serializes stdin writes, state transitions, and request/response
    /// pairs — the single coarse lock §4.3/§5 mandate.
    inner: Mutex<Inner>,
}

impl StdioWorker {
    pub fn new(name: String, command: String, args: Vec<String>) -> Self {
        Self {
            name,
            command,
            args,
            state: AtomicU8::new(STATE_STARTING),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn build_command(&self, env: &HashMap<String, String>) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// SIGTERM the process group then hard-kill, used when bring-up fails
    /// and we must tear down a half-started child (teacher's `kill_child`).
    async fn kill_child(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Safety: libc::kill is safe to call with any PID value.
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    /// Send one request, assigning the next monotonic id under the lock,
    /// and read back one JSON-RPC reply line. Writes and the matching read
    /// happen under the same guard, so concurrent callers cannot interleave
    /// stdin bytes or steal each other's reply (§4.3, §5).
    async fn send_and_read(&self, method: &str, params: Value) -> Result<Value, ScooterError> {
        let mut guard = self.inner.lock().await;
        let id = guard.next_id;
        guard.next_id += 1;
        let envelope = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.write_locked(&mut guard, &envelope).await?;
        self.read_reply_locked(&mut guard).await
    }

    /// Send a notification (no id, no reply expected).
    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ScooterError> {
        let mut guard = self.inner.lock().await;
        let envelope = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.write_locked(&mut guard, &envelope).await
    }

    async fn write_locked(&self, guard: &mut Inner, envelope: &Value) -> Result<(), ScooterError> {
        let stdin = guard.stdin.as_mut().ok_or_else(|| ScooterError::Internal(
            format!("worker '{}' has no stdin (not started)", self.name),
        ))?;
        let mut line = serde_json::to_string(envelope)
            .map_err(|e| ScooterError::Internal(e.to_string()))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ScooterError::DownstreamProtocol {
                server: self.name.clone(),
                reason: format!("write to stdin failed: {e}"),
            })?;
        stdin
            .flush()
            .await
            .map_err(|e| ScooterError::DownstreamProtocol {
                server: self.name.clone(),
                reason: format!("flush stdin failed: {e}"),
            })?;
        Ok(())
    }

    async fn read_reply_locked(&self, guard: &mut Inner) -> Result<Value, ScooterError> {
        let stdout = guard.stdout.as_mut().ok_or_else(|| ScooterError::Internal(
            format!("worker '{}' has no stdout (not started)", self.name),
        ))?;
        for _ in 0..=MAX_NON_JSON_SKIP {
            let mut buf = String::new();
            let n = stdout
                .read_line(&mut buf)
                .await
                .map_err(|e| ScooterError::DownstreamProtocol {
                    server: self.name.clone(),
                    reason: format!("read from stdout failed: {e}"),
                })?;
            if n == 0 {
                return Err(ScooterError::DownstreamProtocol {
                    server: self.name.clone(),
                    reason: "stdout closed (EOF)".to_string(),
                });
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => return Ok(v),
                Err(_) => continue, // skip a bounded number of non-JSON lines
            }
        }
        Err(ScooterError::DownstreamProtocol {
            server: self.name.clone(),
            reason: format!("more than {MAX_NON_JSON_SKIP} non-JSON lines on stdout"),
        })
    }

    async fn do_handshake(&self) -> Result<Vec<ToolDef>, ScooterError> {
        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {"name": "mcp-scooter", "version": "0.1.0"},
            "capabilities": {},
        });
        let reply = self.send_and_read("initialize", init_params).await?;
        if let Some(err) = reply.get("error") {
            return Err(ScooterError::DownstreamProtocol {
                server: self.name.clone(),
                reason: format!("initialize failed: {err}"),
            });
        }

        self.send_notification("notifications/initialized", json!({})).await?;

        let mut tools = Vec::new();
        for attempt in 0..TOOLS_LIST_RETRIES {
            match self.try_tools_list().await {
                Ok(t) => {
                    tools = t;
                    break;
                }
                Err(e) if attempt + 1 < TOOLS_LIST_RETRIES => {
                    warn!(worker = %self.name, attempt, error = %e, "tools/list failed, retrying");
                    tokio::time::sleep(TOOLS_LIST_BACKOFF).await;
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "tools/list failed at bring-up, continuing with empty tool list");
                }
            }
        }
        Ok(tools)
    }

    async fn try_tools_list(&self) -> Result<Vec<ToolDef>, ScooterError> {
        let reply = self.send_and_read("tools/list", json!({})).await?;
        if let Some(err) = reply.get("error") {
            return Err(ScooterError::DownstreamProtocol {
                server: self.name.clone(),
                reason: format!("tools/list failed: {err}"),
            });
        }
        let tools = reply
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| {
                Some(ToolDef {
                    name: t.get("name")?.as_str()?.to_string(),
                    description: t
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_string(),
                    input_schema: t.get("inputSchema").cloned().unwrap_or(json!({"type": "object"})),
                })
            })
            .collect())
    }
}

#[async_trait]
impl Worker for StdioWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: Value) -> Result<Value, ScooterError> {
        // Persistent workers are always dispatched via `call_tool`; `execute`
        // exists so the common `Worker` capability is uniform across worker
        // kinds, but the Engine prefers `call_tool` whenever `as_extended`
        // is available (§4.2 CallTool).
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("tools/call")
            .to_string();
        let params = request.get("params").cloned().unwrap_or(json!({}));
        self.send_and_read(&method, params).await
    }

    async fn close(&self) -> Result<(), ScooterError> {
        let mut guard = self.inner.lock().await;
        guard.initialized = false;
        guard.stdin = None; // dropping the writer sends EOF to the child
        store_state(&self.state, WorkerState::Stopped);

        if let Some(mut child) = guard.child.take() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGINT,
                );
            }
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
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
impl ExtendedWorker for StdioWorker {
    async fn start(&self, env: HashMap<String, String>) -> Result<(), ScooterError> {
        {
            let guard = self.inner.lock().await;
            if guard.initialized {
                return Ok(()); // idempotent
            }
        }

        store_state(&self.state, WorkerState::Starting);

        let mut cmd = self.build_command(&env);
        let mut child = cmd.spawn().map_err(|e| ScooterError::DownstreamStartFailed {
            server: self.name.clone(),
            reason: format!("spawn failed: {e}"),
        })?;

        let pid = child.id();
        debug!(worker = %self.name, pid = ?pid, "spawned worker process");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Stderr watcher: classify critical lines, publish the first one on
        // a single-slot channel. Never blocks the process (§4.3 subtle
        // points).
        let (err_tx, err_rx) = oneshot::channel::<String>();
        let worker_name = self.name.clone();
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut sent = Some(err_tx);
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            info!(worker = %worker_name, stderr = %line, "worker stderr");
                            if is_critical_stderr_line(&line) {
                                if let Some(tx) = sent.take() {
                                    let _ = tx.send(line);
                                }
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            });
        }

        {
            let mut guard = self.inner.lock().await;
            guard.child = Some(child);
            guard.stdin = stdin;
            guard.stdout = stdout.map(BufReader::new);
            guard.next_id = 1;
        } // lock released before the handshake race (§4.3 step 4)

        tokio::select! {
            handshake = self.do_handshake() => {
                match handshake {
                    Ok(tools) => {
                        let mut guard = self.inner.lock().await;
                        guard.initialized = true;
                        guard.tools = tools;
                        store_state(&self.state, WorkerState::Healthy);
                        Ok(())
                    }
                    Err(e) => {
                        let mut guard = self.inner.lock().await;
                        if let Some(mut child) = guard.child.take() {
                            self.kill_child(&mut child).await;
                        }
                        store_state(&self.state, WorkerState::Stopped);
                        Err(ScooterError::DownstreamStartFailed {
                            server: self.name.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            line = err_rx => {
                let mut guard = self.inner.lock().await;
                if let Some(mut child) = guard.child.take() {
                    self.kill_child(&mut child).await;
                }
                store_state(&self.state, WorkerState::Stopped);
                Err(ScooterError::DownstreamStartFailed {
                    server: self.name.clone(),
                    reason: line.unwrap_or_else(|_| "stderr watcher closed".to_string()),
                })
            }
            _ = tokio::time::sleep(BRING_UP_TIMEOUT) => {
                let mut guard = self.inner.lock().await;
                if let Some(mut child) = guard.child.take() {
                    self.kill_child(&mut child).await;
                }
                store_state(&self.state, WorkerState::Stopped);
                Err(ScooterError::DownstreamTimeout {
                    server: self.name.clone(),
                    elapsed: BRING_UP_TIMEOUT,
                })
            }
        }
    }

    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value, ScooterError> {
        let params = json!({"name": tool_name, "arguments": arguments.unwrap_or(json!({}))});
        let reply = tokio::time::timeout(REQUEST_TIMEOUT, self.send_and_read("tools/call", params))
            .await
            .map_err(|_| ScooterError::DownstreamTimeout {
                server: self.name.clone(),
                elapsed: REQUEST_TIMEOUT,
            })??;

        if let Some(err) = reply.get("error") {
            return Err(ScooterError::DownstreamError {
                server: self.name.clone(),
                code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(-32603),
                message: err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("downstream error")
                    .to_string(),
            });
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn get_tools(&self) -> Vec<ToolDef> {
        self.inner.lock().await.tools.clone()
    }

    async fn refresh_tools(&self) -> Result<Vec<ToolDef>, ScooterError> {
        let tools = self.try_tools_list().await?;
        let mut guard = self.inner.lock().await;
        guard.tools = tools.clone();
        Ok(tools)
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), WorkerState::Healthy | WorkerState::Starting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_server_script() -> &'static str {
        // Minimal stdio MCP-ish server for tests: replies to initialize and
        // tools/list, echoes tools/call arguments back as the result.
        r#"
import sys, json

def write(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    method = req.get("method")
    if method == "initialize":
        write({"jsonrpc": "2.0", "id": req["id"], "result": {"protocolVersion": "2024-11-05"}})
    elif method == "notifications/initialized":
        continue
    elif method == "tools/list":
        write({"jsonrpc": "2.0", "id": req["id"], "result": {"tools": [{"name": "echo", "description": "echoes args", "inputSchema": {"type": "object"}}]}})
    elif method == "tools/call":
        write({"jsonrpc": "2.0", "id": req["id"], "result": req["params"].get("arguments", {})})
"#
    }

    fn has_python3() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[tokio::test]
    async fn bring_up_and_call_tool_round_trip() {
        if !has_python3() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let worker = StdioWorker::new(
            "echo".to_string(),
            "python3".to_string(),
            vec!["-c".to_string(), echo_server_script().to_string()],
        );
        worker.start(HashMap::new()).await.expect("start should succeed");
        assert!(worker.is_running());

        let tools = worker.get_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = worker
            .call_tool("echo", Some(json!({"hello": "world"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"hello": "world"}));

        worker.close().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        if !has_python3() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let worker = StdioWorker::new(
            "echo".to_string(),
            "python3".to_string(),
            vec!["-c".to_string(), echo_server_script().to_string()],
        );
        worker.start(HashMap::new()).await.unwrap();
        worker.start(HashMap::new()).await.unwrap(); // no-op, does not error
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_download_start_failed() {
        let worker = StdioWorker::new(
            "nonexistent".to_string(),
            "/no/such/binary-xyz".to_string(),
            vec![],
        );
        let err = worker.start(HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ScooterError::DownstreamStartFailed { .. }));
    }

    #[test]
    fn critical_stderr_classification() {
        assert!(is_critical_stderr_line("Error: missing API key"));
        assert!(is_critical_stderr_line("Uncaught Exception: boom"));
        assert!(is_critical_stderr_line(
            "FOO_API_KEY environment variable is required"
        ));
        assert!(!is_critical_stderr_line("npm WARN deprecated foo@1.0.0"));
        assert!(!is_critical_stderr_line("starting server on port 3000"));
    }
}
