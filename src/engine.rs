//! The Discovery Engine (§4.2): one per profile. Owns the registry, the
//! set of active workers, the tool→server routing table, and the per-call
//! policy state (env, disabled built-ins) the gateway pushes in before
//! every dispatch.
//!
//! Concurrency follows §5 literally: a single `tokio::sync::RwLock` over
//! all of the engine's maps, reads on the read side, mutations on the
//! write side, downstream I/O never held under the lock.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::builtins;
use crate::builtins::code_interpreter::{ScriptSandbox, ToolHost};
use crate::error::ScooterError;
use crate::registry::{EntrySource, FindResult, Registry, RegistryEntry, RuntimeSpec, ToolDef};
use crate::secrets::{self, SecretProvider};
use crate::worker::stdio::StdioWorker;
use crate::worker::wasm::WasmWorker;
use crate::worker::Worker;

/// Default auto-cleanup idle threshold (§3 Settings).
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(600);
/// Auto-cleanup monitor tick interval (§5).
const CLEANUP_TICK: Duration = Duration::from_secs(60);

fn underscore_form(name: &str) -> String {
    name.replace('-', "_")
}

fn dash_form(name: &str) -> String {
    name.replace('_', "-")
}

/// Notified after the engine unloads servers on its own initiative
/// (auto-cleanup) or after an explicit activate/remove, so the owner can
/// emit `notifications/tools/list_changed`. Invoked outside the engine
/// lock (§4.2, §9 "Cyclic dependency engine↔gateway") — the gateway
/// registers itself as the callback; the engine never calls back into the
/// gateway while holding its own lock.
#[async_trait]
pub trait CleanupCallback: Send + Sync {
    async fn on_servers_unloaded(&self, profile_id: &str, servers: Vec<String>);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddStatus {
    Activated,
    AlreadyActive,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub status: AddStatus,
    pub available_tools: Vec<String>,
}

struct EngineState {
    registry: Registry,
    active_servers: HashMap<String, Arc<dyn Worker>>,
    /// Order servers were activated in, for deterministic `tools/list`
    /// ordering (§4.1).
    activation_order: Vec<String>,
    tool_to_server: HashMap<String, String>,
    last_used: HashMap<String, Instant>,
    disabled_tools: HashSet<String>,
    env: HashMap<String, String>,
}

impl EngineState {
    fn new() -> Self {
        let mut registry = Registry::new();
        for entry in builtins::builtin_entries() {
            registry.insert(entry);
        }
        Self {
            registry,
            active_servers: HashMap::new(),
            activation_order: Vec::new(),
            tool_to_server: HashMap::new(),
            last_used: HashMap::new(),
            disabled_tools: HashSet::new(),
            env: HashMap::new(),
        }
    }

    /// Index a server's live tool names into the routing table, both as
    /// given and underscore-normalized (§4.2 "Name normalization"). Last
    /// activation wins on collision (§9 Open Question resolution).
    fn index_tools(&mut self, server: &str, tool_names: &[String]) {
        for name in tool_names {
            for form in [name.clone(), underscore_form(name)] {
                if let Some(prev) = self.tool_to_server.get(&form) {
                    if prev != server {
                        warn!(
                            tool = %form,
                            previous_server = %prev,
                            new_server = %server,
                            "tool name collision after normalization, last-activated wins"
                        );
                    }
                }
                self.tool_to_server.insert(form, server.to_string());
            }
        }
    }

    fn unindex_tools(&mut self, server: &str) {
        self.tool_to_server.retain(|_, s| s != server);
    }

    fn resolve_tool(&self, tool_name: &str) -> Option<String> {
        if let Some(s) = self.tool_to_server.get(tool_name) {
            return Some(s.clone());
        }
        if let Some(s) = self.tool_to_server.get(&dash_form(tool_name)) {
            return Some(s.clone());
        }
        if let Some(s) = self.tool_to_server.get(&underscore_form(tool_name)) {
            return Some(s.clone());
        }
        // Fall back to scanning the registry's declared tools (§4.2 step 2).
        for entry in self.registry.non_builtins() {
            for tool in &entry.tools {
                if tool.name == tool_name
                    || underscore_form(&tool.name) == underscore_form(tool_name)
                {
                    return Some(entry.name.clone());
                }
            }
        }
        None
    }
}

/// One Discovery Engine per profile (§4.2).
pub struct Engine {
    profile_id: String,
    idle_threshold: Duration,
    state: RwLock<EngineState>,
    cleanup_callback: RwLock<Option<Arc<dyn CleanupCallback>>>,
    secret_provider: Arc<dyn SecretProvider>,
}

impl Engine {
    pub fn new(profile_id: String, idle_threshold: Duration, secret_provider: Arc<dyn SecretProvider>) -> Arc<Self> {
        Arc::new(Self {
            profile_id,
            idle_threshold,
            state: RwLock::new(EngineState::new()),
            cleanup_callback: RwLock::new(None),
            secret_provider,
        })
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub async fn set_cleanup_callback(&self, callback: Arc<dyn CleanupCallback>) {
        *self.cleanup_callback.write().await = Some(callback);
    }

    /// Push the profile's current env and disabled-built-ins set into the
    /// engine ahead of a dispatch (§4.1 step 5: "read-copy updates").
    pub async fn sync_profile_context(&self, env: HashMap<String, String>, disabled_tools: HashSet<String>) {
        let mut state = self.state.write().await;
        state.env = env;
        state.disabled_tools = disabled_tools;
    }

    /// Registry load/reload (§4.2 "Registry loading"). Seeds built-ins,
    /// scans official then custom, and refreshes live tool lists for every
    /// currently active persistent worker (tolerating per-worker failure).
    pub async fn reload_registry(&self, registry_dir: &Path) -> anyhow::Result<usize> {
        let mut state = self.state.write().await;
        let mut fresh = Registry::new();
        for entry in builtins::builtin_entries() {
            fresh.insert(entry);
        }
        let loaded = fresh.load_from_disk(registry_dir).await?;
        state.registry = fresh;

        let active_names: Vec<String> = state.activation_order.clone();
        drop(state);

        for name in active_names {
            let worker = {
                let state = self.state.read().await;
                state.active_servers.get(&name).cloned()
            };
            let Some(worker) = worker else { continue };
            let Some(extended) = worker.as_extended() else {
                continue;
            };
            match extended.refresh_tools().await {
                Ok(tools) => {
                    let mut state = self.state.write().await;
                    state.unindex_tools(&name);
                    let names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
                    state.index_tools(&name, &names);
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "tools refresh failed during reload, keeping cached tool set");
                }
            }
        }

        Ok(loaded)
    }

    pub async fn find(&self, query: Option<&str>) -> Vec<FindResult> {
        self.state.read().await.registry.find(query)
    }

    pub async fn is_active(&self, server: &str) -> bool {
        self.state.read().await.active_servers.contains_key(server)
    }

    pub async fn resolve_server_for_tool(&self, tool_name: &str) -> Option<String> {
        self.state.read().await.resolve_tool(tool_name)
    }


    pub async fn is_disabled(&self, name: &str) -> bool {
        self.state.read().await.disabled_tools.contains(name)
    }

    pub async fn list_active(&self) -> Vec<(String, Vec<String>)> {
        let state = self.state.read().await;
        state
            .activation_order
            .iter()
            .map(|name| {
                let tools = state
                    .tool_to_server
                    .iter()
                    .filter(|(_, s)| *s == name)
                    .map(|(t, _)| t.clone())
                    .collect();
                (name.clone(), tools)
            })
            .collect()
    }

    /// `tools/list` (§4.1): built-ins in declaration order, then servers in
    /// activation order.
    pub async fn list_tools(&self) -> Vec<ToolDef> {
        let state = self.state.read().await;
        let mut tools: Vec<ToolDef> = builtins::builtin_entries()
            .into_iter()
            .filter(|e| !state.disabled_tools.contains(&e.name))
            .flat_map(|e| e.tools)
            .collect();

        for server in &state.activation_order {
            if let Some(worker) = state.active_servers.get(server) {
                if let Some(extended) = worker.as_extended() {
                    tools.extend(extended.get_tools().await);
                    continue;
                }
            }
            if let Some(entry) = state.registry.get(server) {
                tools.extend(entry.tools.clone());
            }
        }
        tools
    }

    /// Activation (§4.2 "Add"). Idempotent: already-active is success.
    pub async fn add(&self, server_name: &str) -> Result<AddOutcome, ScooterError> {
        {
            let mut state = self.state.write().await;
            if state.active_servers.contains_key(server_name) {
                state.last_used.insert(server_name.to_string(), Instant::now());
                let tools = state
                    .tool_to_server
                    .iter()
                    .filter(|(_, s)| s.as_str() == server_name)
                    .map(|(t, _)| t.clone())
                    .collect();
                return Ok(AddOutcome {
                    status: AddStatus::AlreadyActive,
                    available_tools: tools,
                });
            }
        }

        let entry = {
            let state = self.state.read().await;
            state
                .registry
                .get(server_name)
                .cloned()
                .ok_or_else(|| ScooterError::NotFound(format!("server '{server_name}' not found")))?
        };

        let env = {
            let state = self.state.read().await;
            secrets::layer_credentials(
                &state.env,
                entry.authorization.as_ref(),
                server_name,
                self.secret_provider.as_ref(),
            )
        };

        let (worker, tool_names): (Arc<dyn Worker>, Vec<String>) = match &entry.runtime {
            RuntimeSpec::Stdio { command, args } => {
                let worker = Arc::new(StdioWorker::new(
                    server_name.to_string(),
                    command.clone(),
                    args.clone(),
                ));
                let extended = worker.as_extended().expect("StdioWorker implements ExtendedWorker");
                extended.start(env).await?;
                let live = extended.get_tools().await;
                let names = if live.is_empty() {
                    entry.tools.iter().map(|t| t.name.clone()).collect()
                } else {
                    live.iter().map(|t| t.name.clone()).collect()
                };
                (worker as Arc<dyn Worker>, names)
            }
            RuntimeSpec::Http { .. } | RuntimeSpec::Sse { .. } | RuntimeSpec::StreamableHttp { .. } => {
                // Non-stdio transports fall back to a WASM worker per §4.2's
                // literal "default path for demo purposes"; WASM execution
                // is an out-of-scope collaborator (§1), so this indexes the
                // registry-declared tools without actually loading a module.
                let worker = Arc::new(WasmWorker::unconfigured(server_name.to_string()));
                let names = entry.tools.iter().map(|t| t.name.clone()).collect();
                (worker as Arc<dyn Worker>, names)
            }
        };

        {
            let mut state = self.state.write().await;
            state.index_tools(server_name, &tool_names);
            state.active_servers.insert(server_name.to_string(), worker);
            state.activation_order.push(server_name.to_string());
            state.last_used.insert(server_name.to_string(), Instant::now());
        }

        info!(server = %server_name, tools = tool_names.len(), "activated server");
        Ok(AddOutcome {
            status: AddStatus::Activated,
            available_tools: tool_names,
        })
    }

    /// Deactivation (§4.2 "Remove"). Idempotent on already-closed.
    pub async fn remove(&self, server_name: &str) -> Result<Vec<String>, ScooterError> {
        let (worker, removed_tools) = {
            let mut state = self.state.write().await;
            let removed_tools: Vec<String> = state
                .tool_to_server
                .iter()
                .filter(|(_, s)| s.as_str() == server_name)
                .map(|(t, _)| t.clone())
                .collect();
            state.unindex_tools(server_name);
            state.activation_order.retain(|n| n != server_name);
            state.last_used.remove(server_name);
            let worker = state.active_servers.remove(server_name);
            (worker, removed_tools)
        };

        if let Some(worker) = worker {
            worker.close().await?;
        }
        Ok(removed_tools)
    }

    /// Engine-level CallTool (§4.2). Assumes routing/activation/allow-list
    /// decisions already made by the caller (the gateway, §4.1 steps 1-4);
    /// built-ins are still tried first so their names stay uninterceptable
    /// by downstream servers.
    pub async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value, ScooterError> {
        if builtins::is_builtin_name(tool_name) {
            if self.is_disabled(tool_name).await {
                return Err(ScooterError::Disabled(tool_name.to_string()));
            }
            return self.dispatch_builtin(tool_name, arguments.unwrap_or(json!({}))).await;
        }

        let server = {
            let state = self.state.read().await;
            state
                .resolve_tool(tool_name)
                .ok_or_else(|| ScooterError::NotFound(format!(
                    "tool '{tool_name}' not found. Use scooter_find to discover servers."
                )))?
        };

        let worker = {
            let mut state = self.state.write().await;
            state.last_used.insert(server.clone(), Instant::now());
            state
                .active_servers
                .get(&server)
                .cloned()
                .ok_or_else(|| ScooterError::NotFound(format!("server '{server}' is not active")))?
        };

        if let Some(extended) = worker.as_extended() {
            extended.call_tool(tool_name, arguments).await
        } else {
            let request = json!({"method": "tools/call", "params": {"name": tool_name, "arguments": arguments.unwrap_or(json!({}))}});
            worker.execute(request).await
        }
    }

    async fn dispatch_builtin(&self, name: &str, args: Value) -> Result<Value, ScooterError> {
        match name {
            "scooter_find" => {
                let query = args.get("query").and_then(|q| q.as_str());
                let results = self.find(query).await;
                Ok(serde_json::to_value(results).map_err(|e| ScooterError::Internal(e.to_string()))?)
            }
            "scooter_activate" | "scooter_add" => {
                let tool_name = args
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ScooterError::Internal("tool_name is required".to_string()))?;
                let outcome = self.add(tool_name).await?;
                Ok(serde_json::to_value(outcome).map_err(|e| ScooterError::Internal(e.to_string()))?)
            }
            "scooter_list_active" => {
                let active = self.list_active().await;
                let value = json!({
                    "count": active.len(),
                    "servers": active.into_iter().map(|(name, tools)| json!({"name": name, "tools": tools})).collect::<Vec<_>>(),
                });
                Ok(value)
            }
            "scooter_remove" => {
                let tool_name = args
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ScooterError::Internal("tool_name is required".to_string()))?;
                let removed = self.remove(tool_name).await?;
                Ok(json!({"removed_tools": removed}))
            }
            "scooter_filesystem" => builtins::filesystem::handle(args).await,
            "scooter_fetch" => builtins::fetch::handle(args).await,
            "scooter_code_interpreter" => {
                let script = args
                    .get("script")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ScooterError::Internal("script is required".to_string()))?;
                let arguments = args.get("arguments").cloned().unwrap_or(json!(null));
                builtins::code_interpreter::UnconfiguredSandbox
                    .run(script, arguments, self)
                    .await
            }
            other => Err(ScooterError::NotFound(format!("unknown built-in '{other}'"))),
        }
    }

    /// Closes every active worker. Called when a profile is removed; the
    /// engine itself is dropped right after, so there's no routing-table
    /// bookkeeping to do here, just draining live subprocesses.
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<dyn Worker>> = {
            let mut state = self.state.write().await;
            let workers = state.active_servers.drain().map(|(_, w)| w).collect();
            state.activation_order.clear();
            state.tool_to_server.clear();
            state.last_used.clear();
            workers
        };
        for worker in workers {
            if let Err(e) = worker.close().await {
                warn!(error = %e, "error closing worker during profile shutdown");
            }
        }
    }

    /// Spawns the auto-cleanup monitor (§4.2, §5): ticks every minute,
    /// unloads servers idle past the threshold under the write lock, then
    /// invokes the cleanup callback once per unloaded server *outside* the
    /// lock.
    pub fn spawn_cleanup_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_TICK);
            loop {
                ticker.tick().await;
                engine.run_cleanup_pass().await;
            }
        })
    }

    async fn run_cleanup_pass(&self) {
        let idle: Vec<String> = {
            let state = self.state.read().await;
            let now = Instant::now();
            state
                .last_used
                .iter()
                .filter(|(_, last)| now.duration_since(**last) > self.idle_threshold)
                .map(|(name, _)| name.clone())
                .collect()
        };
        if idle.is_empty() {
            return;
        }

        let mut unloaded = Vec::new();
        for name in idle {
            let worker = {
                let mut state = self.state.write().await;
                state.unindex_tools(&name);
                state.activation_order.retain(|n| n != &name);
                state.last_used.remove(&name);
                state.active_servers.remove(&name)
            };
            if let Some(worker) = worker {
                if let Err(e) = worker.close().await {
                    warn!(server = %name, error = %e, "error closing idle worker");
                }
                unloaded.push(name);
            }
        }

        if unloaded.is_empty() {
            return;
        }
        info!(servers = ?unloaded, "auto-unloaded idle servers");
        let callback = self.cleanup_callback.read().await.clone();
        if let Some(callback) = callback {
            callback.on_servers_unloaded(&self.profile_id, unloaded).await;
        }
    }
}

#[async_trait]
impl ToolHost for Engine {
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value, ScooterError> {
        Engine::call_tool(self, name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::EnvFallbackProvider;

    fn provider() -> Arc<dyn SecretProvider> {
        Arc::new(EnvFallbackProvider)
    }

    fn test_entry(name: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            title: name.to_string(),
            description: format!("{name} server"),
            category: "test".to_string(),
            source: EntrySource::Custom,
            authorization: None,
            runtime: RuntimeSpec::Http {
                url: "http://localhost:1/not-used".to_string(),
            },
            tools: vec![ToolDef {
                name: format!("{name}_tool"),
                description: "a tool".to_string(),
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    #[tokio::test]
    async fn builtins_are_always_listed_and_active_tools_require_activation() {
        let engine = Engine::new("work".to_string(), DEFAULT_IDLE_THRESHOLD, provider());
        {
            let mut state = engine.state.write().await;
            state.registry.insert(test_entry("brave-search"));
        }
        let tools = engine.list_tools().await;
        assert!(tools.iter().any(|t| t.name == "scooter_find"));
        assert!(!tools.iter().any(|t| t.name == "brave-search_tool"));
    }

    #[tokio::test]
    async fn activate_then_list_tools_exposes_server_tools() {
        let engine = Engine::new("work".to_string(), DEFAULT_IDLE_THRESHOLD, provider());
        {
            let mut state = engine.state.write().await;
            state.registry.insert(test_entry("brave-search"));
        }
        let outcome = engine.add("brave-search").await.unwrap();
        assert!(matches!(outcome.status, AddStatus::Activated));
        let tools = engine.list_tools().await;
        assert!(tools.iter().any(|t| t.name == "brave-search_tool"));
    }

    #[tokio::test]
    async fn re_activating_is_idempotent() {
        let engine = Engine::new("work".to_string(), DEFAULT_IDLE_THRESHOLD, provider());
        {
            let mut state = engine.state.write().await;
            state.registry.insert(test_entry("brave-search"));
        }
        engine.add("brave-search").await.unwrap();
        let second = engine.add("brave-search").await.unwrap();
        assert!(matches!(second.status, AddStatus::AlreadyActive));
    }

    #[tokio::test]
    async fn remove_strips_mappings_and_is_idempotent() {
        let engine = Engine::new("work".to_string(), DEFAULT_IDLE_THRESHOLD, provider());
        {
            let mut state = engine.state.write().await;
            state.registry.insert(test_entry("brave-search"));
        }
        engine.add("brave-search").await.unwrap();
        engine.remove("brave-search").await.unwrap();
        assert!(!engine.is_active("brave-search").await);
        assert!(engine.resolve_server_for_tool("brave-search_tool").await.is_none());
        // idempotent:
        engine.remove("brave-search").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_server_on_add_is_not_found() {
        let engine = Engine::new("work".to_string(), DEFAULT_IDLE_THRESHOLD, provider());
        let err = engine.add("does-not-exist").await.unwrap_err();
        assert!(matches!(err, ScooterError::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_callers_get_correctly_matched_responses() {
        let engine = Engine::new("work".to_string(), DEFAULT_IDLE_THRESHOLD, provider());
        let mock = crate::testutil::MockWorker::new("mock-server", Duration::from_millis(50));
        {
            let mut state = engine.state.write().await;
            state.index_tools("mock-server", &["echo_tool".to_string()]);
            state
                .active_servers
                .insert("mock-server".to_string(), mock.clone() as Arc<dyn crate::worker::Worker>);
            state.activation_order.push("mock-server".to_string());
        }

        let engine_a = Arc::clone(&engine);
        let engine_b = Arc::clone(&engine);
        let call_a =
            tokio::spawn(async move { engine_a.call_tool("echo_tool", Some(json!({"id": "caller-a"}))).await });
        let call_b =
            tokio::spawn(async move { engine_b.call_tool("echo_tool", Some(json!({"id": "caller-b"}))).await });

        let result_a = call_a.await.unwrap().unwrap();
        let result_b = call_b.await.unwrap().unwrap();

        assert_eq!(result_a["id"], "caller-a");
        assert_eq!(result_b["id"], "caller-b");
        assert_eq!(mock.max_seen_concurrent(), 2);
    }

    #[tokio::test]
    async fn disabled_builtin_is_rejected() {
        let engine = Engine::new("work".to_string(), DEFAULT_IDLE_THRESHOLD, provider());
        let mut disabled = HashSet::new();
        disabled.insert("scooter_find".to_string());
        engine.sync_profile_context(HashMap::new(), disabled).await;
        let err = engine.call_tool("scooter_find", None).await.unwrap_err();
        assert!(matches!(err, ScooterError::Disabled(_)));
    }
}
