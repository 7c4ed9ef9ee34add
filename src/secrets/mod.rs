//! Credential layering for worker activation (§3, §4.2 step 3, §8 scenario
//! 4): profile environment, overlaid by secrets resolved from an external
//! keychain for the env vars a registry entry's `authorization` spec
//! declares. Keychain values win on conflict; neither layer is ever
//! persisted to disk by this crate.

pub mod resolver;

pub use resolver::{EnvFallbackProvider, SecretProvider};

use std::collections::HashMap;

use crate::registry::AuthorizationSpec;

/// Builds the effective environment for starting a worker: profile env
/// overlaid by keychain-resolved secrets for the declared required vars
/// and/or OAuth token var. Missing secrets are skipped (the worker may
/// still start and fail on its own if it truly needed the var — the core
/// does not treat an unresolved secret as fatal on its own).
pub fn layer_credentials(
    profile_env: &HashMap<String, String>,
    authorization: Option<&AuthorizationSpec>,
    server_name: &str,
    provider: &dyn SecretProvider,
) -> HashMap<String, String> {
    let mut env = profile_env.clone();
    let Some(auth) = authorization else {
        return env;
    };

    for var in &auth.required_env {
        if let Ok(value) = provider.resolve(&format!("{server_name}/{var}")) {
            env.insert(var.clone(), value);
        }
    }
    if let Some(var) = &auth.oauth_token_env {
        if let Ok(value) = provider.resolve(&format!("{server_name}/{var}")) {
            env.insert(var.clone(), value);
        }
    }
    env
}
