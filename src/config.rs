//! On-disk configuration (§3 Profile/Settings, §6 on-disk layout):
//! `profiles.yaml`, `settings.yaml`, with `${VAR}` environment
//! interpolation and optional hot-reload via a file watcher.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once. Must be called
/// early in `main()`, before spawning concurrent tasks.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: called once, before any task spawns.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// A named isolation unit: its own allow-list, env, and (owned elsewhere)
/// Discovery Engine (§3 Profile).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,

    #[serde(default)]
    pub remote_server_url: Option<String>,

    #[serde(default)]
    pub remote_auth_mode: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Server names this profile may activate.
    #[serde(default)]
    pub allow_tools: Vec<String>,

    /// Built-in names suppressed for this profile.
    #[serde(default)]
    pub disabled_system_tools: Vec<String>,
}

/// `profiles.yaml`: an ordered sequence of profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profiles {
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// `settings.yaml` (§3 Settings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_control_port")]
    pub control_port: u16,

    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    /// Empty/absent disables gateway auth entirely.
    #[serde(default)]
    pub gateway_api_key: Option<String>,

    #[serde(default)]
    pub last_used_profile_id: Option<String>,

    #[serde(default = "default_idle_threshold", with = "humantime_duration")]
    pub auto_cleanup_idle_threshold: Duration,

    #[serde(default)]
    pub ai_routing_provider: Option<String>,

    #[serde(default)]
    pub ai_routing_model: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            control_port: default_control_port(),
            gateway_port: default_gateway_port(),
            gateway_api_key: None,
            last_used_profile_id: None,
            auto_cleanup_idle_threshold: default_idle_threshold(),
            ai_routing_provider: None,
            ai_routing_model: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_control_port() -> u16 {
    7825
}
fn default_gateway_port() -> u16 {
    7826
}
fn default_idle_threshold() -> Duration {
    Duration::from_secs(600)
}

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('h') {
            return n
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        if let Some(n) = s.strip_suffix('m') {
            return n
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        if let Some(n) = s.strip_suffix('s') {
            return n
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("invalid duration '{s}': expected e.g. '30s', '10m', '1h'"))
    }
}

/// Read + `${VAR}`-expand a YAML file, then deserialize.
fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let expanded = shellexpand::env(&raw)
        .map_err(|e| anyhow::anyhow!("env var interpolation failed in {}: {e}", path.display()))?;
    serde_yaml_ng::from_str(&expanded)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

pub fn load_profiles(path: &Path) -> Result<Vec<Profile>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let profiles: Profiles = load_yaml(path)?;
    Ok(profiles.profiles)
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    load_yaml(path)
}

pub fn save_profiles(path: &Path, profiles: &[Profile]) -> Result<()> {
    let wrapper = Profiles {
        profiles: profiles.to_vec(),
    };
    let yaml = serde_yaml_ng::to_string(&wrapper).context("failed to serialize profiles")?;
    std::fs::write(path, yaml).with_context(|| format!("failed to write {}", path.display()))
}

/// Resolve the application config directory: `SCOOTER_CONFIG_DIR` if set,
/// else a platform default under the user's home (§6).
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("SCOOTER_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(".mcp-scooter"))
        .context("cannot determine user home directory")
}

/// Watches `profiles.yaml` for changes and notifies `on_change` with the
/// freshly parsed profile list. Debounces rapid-fire filesystem events.
/// Runs until `shutdown` is notified.
pub async fn watch_profiles<F>(
    path: PathBuf,
    mut on_change: F,
    shutdown: std::sync::Arc<tokio::sync::Notify>,
) where
    F: FnMut(Vec<Profile>) + Send + 'static,
{
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create profiles.yaml watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        error!(path = %path.display(), error = %e, "failed to watch profiles.yaml");
        return;
    }

    let debounce = Duration::from_millis(500);
    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}
                match load_profiles(&path) {
                    Ok(profiles) => {
                        info!(count = profiles.len(), "profiles.yaml reloaded");
                        on_change(profiles);
                    }
                    Err(e) => error!(error = %e, "failed to parse reloaded profiles.yaml, keeping current"),
                }
            }
            _ = shutdown.notified() => {
                info!("profiles watcher shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_profile() {
        let yaml = r#"
profiles:
  - id: work
    allow_tools: ["brave-search"]
"#;
        let profiles: Profiles = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(profiles.profiles.len(), 1);
        assert_eq!(profiles.profiles[0].id, "work");
        assert_eq!(profiles.profiles[0].allow_tools, vec!["brave-search"]);
    }

    #[test]
    fn settings_defaults() {
        let settings: Settings = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.control_port, 7825);
        assert_eq!(settings.auto_cleanup_idle_threshold, Duration::from_secs(600));
        assert!(settings.gateway_api_key.is_none());
    }

    #[test]
    fn settings_parses_minute_duration() {
        let settings: Settings =
            serde_yaml_ng::from_str("auto_cleanup_idle_threshold: 5m\n").unwrap();
        assert_eq!(settings.auto_cleanup_idle_threshold, Duration::from_secs(300));
    }

    #[test]
    fn load_profiles_missing_file_returns_empty() {
        let path = std::path::Path::new("/tmp/mcp-scooter-definitely-missing-profiles.yaml");
        let profiles = load_profiles(path).unwrap();
        assert!(profiles.is_empty());
    }
}
