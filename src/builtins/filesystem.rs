//! `scooter_filesystem` (§4.4): read/write/list/delete/exists scoped to
//! the user's home directory (§8 scenario 6).

use serde_json::{Value, json};

use crate::error::ScooterError;

/// Read is capped at this many bytes — the "host's default file size"
/// §4.4 leaves unspecified, fixed here to match `scooter_fetch`'s own cap.
const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

fn home_dir() -> Result<std::path::PathBuf, ScooterError> {
    dirs::home_dir().ok_or_else(|| ScooterError::Internal("cannot determine user home directory".to_string()))
}

/// Resolves `path` to an absolute path and rejects anything outside the
/// user's home directory (§4.4, §8 scenario 6's exact error wording).
fn resolve_in_home(path: &str) -> Result<std::path::PathBuf, ScooterError> {
    let home = home_dir()?;
    let requested = std::path::Path::new(path);
    let absolute = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        home.join(requested)
    };

    // Resolve lexically (the target may not exist yet, e.g. a write), then
    // check containment against the resolved home so `..` can't escape it.
    let normalized = normalize_lexically(&absolute);
    let normalized_home = normalize_lexically(&home);
    if !normalized.starts_with(&normalized_home) {
        return Err(ScooterError::Internal(format!(
            "access denied: path must be within user home directory ({})",
            home.display()
        )));
    }
    Ok(normalized)
}

fn normalize_lexically(path: &std::path::Path) -> std::path::PathBuf {
    use std::path::Component;
    let mut out = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub async fn handle(args: Value) -> Result<Value, ScooterError> {
    let operation = args
        .get("operation")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScooterError::Internal("operation is required".to_string()))?;
    let path = args
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScooterError::Internal("path is required".to_string()))?;
    let resolved = resolve_in_home(path)?;

    match operation {
        "read" => {
            let metadata = tokio::fs::metadata(&resolved)
                .await
                .map_err(|e| ScooterError::Internal(format!("cannot read '{path}': {e}")))?;
            if metadata.len() > MAX_READ_BYTES {
                return Err(ScooterError::Internal(format!(
                    "'{path}' is {} bytes, exceeding the {MAX_READ_BYTES} byte read cap",
                    metadata.len()
                )));
            }
            let content = tokio::fs::read_to_string(&resolved)
                .await
                .map_err(|e| ScooterError::Internal(format!("cannot read '{path}': {e}")))?;
            Ok(json!({"content": content, "path": resolved.display().to_string(), "size": metadata.len()}))
        }
        "write" => {
            let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(parent) = resolved.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ScooterError::Internal(format!("cannot create parent directories: {e}")))?;
            }
            tokio::fs::write(&resolved, content)
                .await
                .map_err(|e| ScooterError::Internal(format!("cannot write '{path}': {e}")))?;
            Ok(json!({"path": resolved.display().to_string(), "bytes_written": content.len()}))
        }
        "list" => {
            let mut entries = Vec::new();
            let mut read_dir = tokio::fs::read_dir(&resolved)
                .await
                .map_err(|e| ScooterError::Internal(format!("cannot list '{path}': {e}")))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| ScooterError::Internal(e.to_string()))?
            {
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| ScooterError::Internal(e.to_string()))?;
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs());
                entries.push(json!({
                    "name": entry.file_name().to_string_lossy(),
                    "isDir": metadata.is_dir(),
                    "size": metadata.len(),
                    "mtime": mtime,
                }));
            }
            Ok(json!({"path": resolved.display().to_string(), "entries": entries}))
        }
        "delete" => {
            let metadata = tokio::fs::metadata(&resolved)
                .await
                .map_err(|e| ScooterError::Internal(format!("cannot delete '{path}': {e}")))?;
            if metadata.is_dir() {
                tokio::fs::remove_dir(&resolved).await
            } else {
                tokio::fs::remove_file(&resolved).await
            }
            .map_err(|e| ScooterError::Internal(format!("cannot delete '{path}': {e}")))?;
            Ok(json!({"path": resolved.display().to_string(), "deleted": true}))
        }
        "exists" => {
            let exists = tokio::fs::metadata(&resolved).await.is_ok();
            Ok(json!({"path": resolved.display().to_string(), "exists": exists}))
        }
        other => Err(ScooterError::Internal(format!("unknown filesystem operation '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let home = dirs::home_dir().unwrap();
        let rel = format!(".scooter-test-{}", std::process::id());
        let path = home.join(&rel);

        let write_result = handle(json!({
            "operation": "write",
            "path": path.to_string_lossy(),
            "content": "hello"
        }))
        .await
        .unwrap();
        assert_eq!(write_result["bytes_written"], 5);

        let read_result = handle(json!({
            "operation": "read",
            "path": path.to_string_lossy(),
        }))
        .await
        .unwrap();
        assert_eq!(read_result["content"], "hello");

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn path_outside_home_is_rejected() {
        let err = handle(json!({"operation": "read", "path": "/etc/passwd"}))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("access denied"), "{message}");
    }

    #[tokio::test]
    async fn exists_reports_false_for_missing_path() {
        let result = handle(json!({
            "operation": "exists",
            "path": ".scooter-definitely-does-not-exist",
        }))
        .await
        .unwrap();
        assert_eq!(result["exists"], false);
    }
}
