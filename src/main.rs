mod builtins;
mod cli;
mod config;
mod engine;
mod error;
mod gateway;
mod logging;
mod profile_manager;
mod registry;
mod secrets;
#[cfg(test)]
mod testutil;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::{info, warn};

use cli::Cli;
use config::Profile;
use gateway::{GatewayState, ListChangedNotifier};
use profile_manager::ProfileManager;
use secrets::EnvFallbackProvider;

const SHUTDOWN_DRAIN: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.resolved_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create config dir {}", config_dir.display()))?;
    }

    config::load_dotenv();

    let settings = config::load_settings(&config_dir.join("settings.yaml"))?;
    logging::init(&settings.log_level, Arc::new(logging::StderrSink));

    info!(config_dir = %config_dir.display(), "mcp-scooter starting");

    let mut profiles = config::load_profiles(&config_dir.join("profiles.yaml"))?;
    if profiles.is_empty() {
        info!("no profiles configured, seeding the 'work' profile");
        profiles.push(Profile {
            id: gateway::ROOT_SHORTCUT_PROFILE.to_string(),
            remote_server_url: None,
            remote_auth_mode: None,
            env: Default::default(),
            allow_tools: Vec::new(),
            disabled_system_tools: Vec::new(),
        });
    }

    let registry_dir = config_dir.join("registry");
    let profile_manager = ProfileManager::new(
        registry_dir,
        settings.auto_cleanup_idle_threshold,
        Arc::new(EnvFallbackProvider),
    );
    profile_manager.sync_profiles(profiles).await;

    let sessions = Arc::new(gateway::sse::SessionRegistry::new());
    profile_manager
        .set_cleanup_callback(Arc::new(ListChangedNotifier {
            sessions: Arc::clone(&sessions),
        }))
        .await;

    let settings_store = Arc::new(ArcSwap::from_pointee(settings.clone()));
    let shutdown = Arc::new(tokio::sync::Notify::new());

    {
        let config_dir = config_dir.clone();
        let profile_manager = Arc::clone(&profile_manager);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            config::watch_profiles(
                config_dir.join("profiles.yaml"),
                move |profiles| {
                    let profile_manager = Arc::clone(&profile_manager);
                    tokio::spawn(async move {
                        profile_manager.sync_profiles(profiles).await;
                    });
                },
                shutdown,
            )
            .await;
        });
    }

    let state = GatewayState {
        profile_manager: Arc::clone(&profile_manager),
        sessions,
        settings: Arc::clone(&settings_store),
    };

    let addr: SocketAddr = ([127, 0, 0, 1], settings.gateway_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway port {addr}"))?;
    info!(%addr, "gateway listening");

    let app = gateway::router(state);
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = serve => {
                if let Err(e) = result {
                    warn!(error = %e, "gateway server exited with error");
                }
            }
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = serve.await {
            warn!(error = %e, "gateway server exited with error");
        }
    }

    info!("shutting down, draining in-flight requests");
    shutdown.notify_waiters();
    tokio::time::sleep(SHUTDOWN_DRAIN).await;

    for profile_id in profile_manager.profile_ids().await {
        if let Some(engine) = profile_manager.get(&profile_id).await {
            engine.shutdown().await;
        }
    }

    info!("shutdown complete");
    Ok(())
}
