//! Built-in tools (§4.4): a small enumerated set implemented inside the
//! engine because they need engine state. Every name here is reachable
//! under a `scooter_` prefix on the wire, matching the worked scenarios in
//! §8. `activate` (`scooter_activate`) is the primary name; `scooter_add`
//! is kept as an alias for one release per the Design Note on "already
//! active" duplication — both route to [`crate::engine::Engine::add`].

pub mod code_interpreter;
pub mod fetch;
pub mod filesystem;

use serde_json::json;

use crate::registry::{EntrySource, RegistryEntry, RuntimeSpec, ToolDef};

/// Declaration order used for `tools/list`'s deterministic built-in
/// ordering (§4.1).
const BUILTIN_NAMES: &[&str] = &[
    "scooter_find",
    "scooter_activate",
    "scooter_add",
    "scooter_list_active",
    "scooter_remove",
    "scooter_filesystem",
    "scooter_fetch",
    "scooter_code_interpreter",
];

pub fn is_builtin_name(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

fn tool(name: &str, description: &str, input_schema: serde_json::Value) -> ToolDef {
    ToolDef {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// One registry entry per built-in, carrying its own `ToolDef` so the
/// registry's existing listing/find machinery can treat built-ins
/// uniformly — `find` itself excludes them by `source` (§4.4).
pub fn builtin_entries() -> Vec<RegistryEntry> {
    let specs: &[(&str, &str, serde_json::Value)] = &[
        (
            "scooter_find",
            "Search the tool server registry by name or description",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        ),
        (
            "scooter_activate",
            "Activate a registered tool server, exposing its tools",
            json!({"type": "object", "required": ["tool_name"], "properties": {"tool_name": {"type": "string"}}}),
        ),
        (
            "scooter_add",
            "Alias for scooter_activate",
            json!({"type": "object", "required": ["tool_name"], "properties": {"tool_name": {"type": "string"}}}),
        ),
        (
            "scooter_list_active",
            "List currently active tool servers and their tools",
            json!({"type": "object", "properties": {}}),
        ),
        (
            "scooter_remove",
            "Deactivate an active tool server",
            json!({"type": "object", "required": ["tool_name"], "properties": {"tool_name": {"type": "string"}}}),
        ),
        (
            "scooter_filesystem",
            "Read, write, list, delete, or check a path within the user's home directory",
            json!({
                "type": "object",
                "required": ["operation", "path"],
                "properties": {
                    "operation": {"type": "string", "enum": ["read", "write", "list", "delete", "exists"]},
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                }
            }),
        ),
        (
            "scooter_fetch",
            "Issue an HTTP request and return the response",
            json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": {"type": "string"},
                    "method": {"type": "string"},
                    "headers": {"type": "object"},
                    "body": {"type": "string"},
                }
            }),
        ),
        (
            "scooter_code_interpreter",
            "Run a script in a sandboxed interpreter, with access to callTool for chained tool invocation",
            json!({
                "type": "object",
                "required": ["script"],
                "properties": {
                    "script": {"type": "string"},
                    "arguments": {"type": "object"},
                }
            }),
        ),
    ];

    specs
        .iter()
        .map(|(name, description, schema)| RegistryEntry {
            name: name.to_string(),
            title: name.to_string(),
            description: description.to_string(),
            category: "builtin".to_string(),
            source: EntrySource::Builtin,
            authorization: None,
            runtime: RuntimeSpec::Stdio {
                command: String::new(),
                args: Vec::new(),
            },
            tools: vec![tool(name, description, schema.clone())],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_entries_cover_every_declared_name() {
        let entries = builtin_entries();
        assert_eq!(entries.len(), BUILTIN_NAMES.len());
        for name in BUILTIN_NAMES {
            assert!(entries.iter().any(|e| e.name == *name));
        }
    }

    #[test]
    fn is_builtin_name_rejects_unknown() {
        assert!(!is_builtin_name("brave_web_search"));
        assert!(is_builtin_name("scooter_find"));
    }
}
