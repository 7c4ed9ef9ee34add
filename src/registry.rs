//! The per-profile tool registry: on-disk entries, built-ins, and the
//! name→entry lookups the Discovery Engine needs for activation and `find`.
//!
//! Grounded on the teacher's `registry.rs` (DashMap-backed tool index), but
//! the storage here is a plain map guarded by the Engine's single lock
//! (§5), and lookup is a literal case-insensitive substring match rather
//! than the teacher's BM25 ranking — `find`'s semantics are fixed by §4.4,
//! not left to a ranking heuristic.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Official,
    Custom,
    Builtin,
}

/// Transport a registry entry's worker speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum RuntimeSpec {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        url: String,
    },
    Sse {
        url: String,
    },
    StreamableHttp {
        url: String,
    },
}

/// Declares which env vars (and/or an OAuth token var) a worker needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationSpec {
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub oauth_token_env: Option<String>,
}

/// A single callable exposed by a server or a built-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// A registry entry: a tool server's declaration plus the tools it exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default = "default_source")]
    pub source: EntrySource,
    #[serde(default)]
    pub authorization: Option<AuthorizationSpec>,
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

fn default_source() -> EntrySource {
    EntrySource::Custom
}

/// A registry entry reduced to the shape `find` returns (§4.4).
#[derive(Debug, Clone, Serialize)]
pub struct FindResult {
    pub name: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tools: Vec<String>,
    pub source: EntrySource,
}

impl From<&RegistryEntry> for FindResult {
    fn from(e: &RegistryEntry) -> Self {
        FindResult {
            name: e.name.clone(),
            title: e.title.clone(),
            description: e.description.clone(),
            category: e.category.clone(),
            tools: e.tools.iter().map(|t| t.name.clone()).collect(),
            source: e.source,
        }
    }
}

/// The registry of known servers for one profile's Discovery Engine.
///
/// Not internally synchronized — callers hold the Engine's `RwLock` for the
/// duration of any mutation, matching the single-lock concurrency model in
/// §5.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
    /// Insertion order, used so `tools/list`'s "built-ins in declaration
    /// order" guarantee has something deterministic to walk for non-builtins
    /// too (activation order is tracked separately by the Engine).
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry by name (re-registering replaces, §3).
    pub fn insert(&mut self, entry: RegistryEntry) {
        if !self.entries.contains_key(&entry.name) {
            self.order.push(entry.name.clone());
        }
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<RegistryEntry> {
        self.order.retain(|n| n != name);
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in registration order, excluding built-ins (§4.4: `find`
    /// only returns non-builtin entries).
    pub fn non_builtins(&self) -> Vec<&RegistryEntry> {
        self.order
            .iter()
            .filter_map(|n| self.entries.get(n))
            .filter(|e| e.source != EntrySource::Builtin)
            .collect()
    }

    /// `find` with an optional query: case-insensitive substring match
    /// against name/description; empty or absent query returns all (§4.4).
    pub fn find(&self, query: Option<&str>) -> Vec<FindResult> {
        let needle = query.map(|q| q.to_lowercase()).filter(|q| !q.is_empty());
        self.non_builtins()
            .into_iter()
            .filter(|e| match &needle {
                None => true,
                Some(q) => {
                    e.name.to_lowercase().contains(q) || e.description.to_lowercase().contains(q)
                }
            })
            .map(FindResult::from)
            .collect()
    }

    /// Load `<dir>/official/*.json` then `<dir>/custom/*.json`. Custom wins
    /// on name collision (§4.2).
    pub async fn load_from_disk(&mut self, registry_dir: &Path) -> anyhow::Result<usize> {
        let mut loaded = 0;
        for subdir in ["official", "custom"] {
            let dir = registry_dir.join(subdir);
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(_) => continue, // directory absent is fine — nothing to load
            };
            while let Some(file) = read_dir.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let data = match tokio::fs::read_to_string(&path).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to read registry entry");
                        continue;
                    }
                };
                let mut raw: serde_json::Value = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "invalid registry entry, skipping");
                        continue;
                    }
                };
                // A blank `source` defaults to the subdirectory it was found in
                // (§4.2); an explicit value (even one that disagrees with the
                // subdirectory) is left alone.
                let source_is_blank = match raw.get("source") {
                    None => true,
                    Some(serde_json::Value::String(s)) => s.is_empty(),
                    Some(_) => false,
                };
                if source_is_blank {
                    if let Some(obj) = raw.as_object_mut() {
                        obj.insert("source".to_string(), serde_json::Value::String(subdir.to_string()));
                    }
                }
                let entry: RegistryEntry = match serde_json::from_value(raw) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "invalid registry entry, skipping");
                        continue;
                    }
                };
                self.insert(entry);
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}
