//! Owns the set of live Discovery Engines, one per configured profile
//! (§3). Reconciles the engine set against whatever `profiles.yaml`
//! currently says, on startup and on every hot-reload.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Profile;
use crate::engine::{CleanupCallback, Engine};
use crate::secrets::SecretProvider;

pub struct ProfileManager {
    registry_dir: PathBuf,
    idle_threshold: Duration,
    secret_provider: Arc<dyn SecretProvider>,
    engines: RwLock<HashMap<String, Arc<Engine>>>,
    profiles: RwLock<HashMap<String, Profile>>,
    cleanup_callback: RwLock<Option<Arc<dyn CleanupCallback>>>,
}

impl ProfileManager {
    pub fn new(
        registry_dir: PathBuf,
        idle_threshold: Duration,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry_dir,
            idle_threshold,
            secret_provider,
            engines: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            cleanup_callback: RwLock::new(None),
        })
    }

    /// Registers the callback every engine (present and future) notifies
    /// when it auto-unloads idle servers. Breaks the engine↔gateway cycle
    /// (§9) — the gateway is the callback, but never sits behind an
    /// engine's own lock.
    pub async fn set_cleanup_callback(&self, callback: Arc<dyn CleanupCallback>) {
        *self.cleanup_callback.write().await = Some(callback.clone());
        let engines = self.engines.read().await;
        for engine in engines.values() {
            engine.set_cleanup_callback(callback.clone()).await;
        }
    }

    pub async fn get(&self, profile_id: &str) -> Option<Arc<Engine>> {
        self.engines.read().await.get(profile_id).cloned()
    }

    pub async fn profile(&self, profile_id: &str) -> Option<Profile> {
        self.profiles.read().await.get(profile_id).cloned()
    }

    pub async fn profile_ids(&self) -> Vec<String> {
        self.engines.read().await.keys().cloned().collect()
    }

    /// Reconciles the live engine set against a freshly loaded profile
    /// list: creates engines for new profiles, tears down engines for
    /// profiles that disappeared, and refreshes per-profile env/disabled
    /// built-ins for profiles that still exist. Called once at startup
    /// with the initial load, and again on every `profiles.yaml` reload.
    pub async fn sync_profiles(&self, profiles: Vec<Profile>) {
        let incoming: HashMap<String, Profile> =
            profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        let incoming_ids: HashSet<&String> = incoming.keys().collect();

        let stale: Vec<String> = {
            let engines = self.engines.read().await;
            engines
                .keys()
                .filter(|id| !incoming_ids.contains(id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.remove_profile(&id).await;
        }

        for (id, profile) in &incoming {
            if self.engines.read().await.contains_key(id) {
                self.sync_profile_context(profile).await;
                continue;
            }
            if let Err(e) = self.create_profile(profile.clone()).await {
                warn!(profile = %id, error = %e, "failed to bring up engine for profile");
            }
        }

        *self.profiles.write().await = incoming;
    }

    async fn create_profile(&self, profile: Profile) -> anyhow::Result<()> {
        let engine = Engine::new(
            profile.id.clone(),
            self.idle_threshold,
            self.secret_provider.clone(),
        );
        if let Err(e) = engine.reload_registry(&self.registry_dir).await {
            warn!(profile = %profile.id, error = %e, "registry load failed, profile starts with an empty registry");
        }
        engine
            .sync_profile_context(profile.env.clone(), disabled_set(&profile))
            .await;
        if let Some(callback) = self.cleanup_callback.read().await.clone() {
            engine.set_cleanup_callback(callback).await;
        }
        engine.spawn_cleanup_monitor();

        self.engines
            .write()
            .await
            .insert(profile.id.clone(), engine);
        info!(profile = %profile.id, "profile engine created");
        Ok(())
    }

    async fn sync_profile_context(&self, profile: &Profile) {
        if let Some(engine) = self.get(&profile.id).await {
            engine
                .sync_profile_context(profile.env.clone(), disabled_set(profile))
                .await;
        }
    }

    async fn remove_profile(&self, profile_id: &str) {
        let engine = self.engines.write().await.remove(profile_id);
        if let Some(engine) = engine {
            engine.shutdown().await;
            info!(profile = %profile_id, "profile engine torn down");
        }
        self.profiles.write().await.remove(profile_id);
    }

    /// Re-scans the registry directory for every live profile's engine.
    /// Used when the registry files themselves change, independent of
    /// `profiles.yaml`.
    pub async fn reload_all_registries(&self) {
        let engines: Vec<Arc<Engine>> = self.engines.read().await.values().cloned().collect();
        for engine in engines {
            if let Err(e) = engine.reload_registry(&self.registry_dir).await {
                warn!(profile = %engine.profile_id(), error = %e, "registry reload failed");
            }
        }
    }
}

fn disabled_set(profile: &Profile) -> HashSet<String> {
    profile.disabled_system_tools.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::EnvFallbackProvider;

    fn manager() -> Arc<ProfileManager> {
        ProfileManager::new(
            PathBuf::from("/tmp/mcp-scooter-test-registry-does-not-exist"),
            Duration::from_secs(600),
            Arc::new(EnvFallbackProvider),
        )
    }

    fn profile(id: &str) -> Profile {
        Profile {
            id: id.to_string(),
            remote_server_url: None,
            remote_auth_mode: None,
            env: HashMap::new(),
            allow_tools: Vec::new(),
            disabled_system_tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn sync_profiles_creates_and_tears_down_engines() {
        let manager = manager();
        manager
            .sync_profiles(vec![profile("work"), profile("personal")])
            .await;
        assert!(manager.get("work").await.is_some());
        assert!(manager.get("personal").await.is_some());

        manager.sync_profiles(vec![profile("work")]).await;
        assert!(manager.get("work").await.is_some());
        assert!(manager.get("personal").await.is_none());
    }

    #[tokio::test]
    async fn sync_profiles_is_idempotent_for_unchanged_profile() {
        let manager = manager();
        manager.sync_profiles(vec![profile("work")]).await;
        let first = manager.get("work").await.unwrap();
        manager.sync_profiles(vec![profile("work")]).await;
        let second = manager.get("work").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn profile_env_updates_propagate_to_existing_engine() {
        let manager = manager();
        manager.sync_profiles(vec![profile("work")]).await;

        let mut updated = profile("work");
        updated.disabled_system_tools.push("scooter_find".to_string());
        manager.sync_profiles(vec![updated]).await;

        let engine = manager.get("work").await.unwrap();
        assert!(engine.is_disabled("scooter_find").await);
    }
}
