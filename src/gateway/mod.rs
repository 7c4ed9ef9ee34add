//! The Gateway (§4.1): the HTTP+SSE surface clients speak MCP over. Wraps
//! a Discovery Engine per profile with the JSON-RPC dispatch, routing,
//! and activation-on-demand logic that turns a bare `tools/call` into the
//! right downstream dispatch.

pub mod auth;
pub mod rpc;
pub mod sse;

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::Router;
use axum::routing::{get, post};
use serde_json::json;

use crate::config::Settings;
use crate::engine::CleanupCallback;
use crate::profile_manager::ProfileManager;

#[derive(Clone)]
pub struct GatewayState {
    pub profile_manager: Arc<ProfileManager>,
    pub sessions: Arc<sse::SessionRegistry>,
    pub settings: Arc<ArcSwap<Settings>>,
}

/// The root-path shortcuts (`GET/POST /sse`, `POST /message`) always
/// target the profile literally named `work`, for backward compatibility
/// (§6) — not whatever `Settings::last_used_profile_id` happens to hold.
pub const ROOT_SHORTCUT_PROFILE: &str = "work";

/// Builds the router. Must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the loopback
/// check in `auth` can see the peer address.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/sse",
            get(sse::default_profile_sse_handler).post(rpc::default_profile_session_message_handler),
        )
        .route("/message", post(rpc::default_profile_plain_message_handler))
        .route(
            "/profiles/{profile_id}/sse",
            get(sse::sse_handler).post(rpc::session_message_handler),
        )
        .route("/profiles/{profile_id}/message", post(rpc::plain_message_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// The engine→gateway side of the cycle broken by `CleanupCallback` (§9):
/// when an engine auto-unloads idle servers on its own initiative, it
/// notifies this so every open SSE session on that profile hears
/// `notifications/tools/list_changed`.
pub struct ListChangedNotifier {
    pub sessions: Arc<sse::SessionRegistry>,
}

#[async_trait]
impl CleanupCallback for ListChangedNotifier {
    async fn on_servers_unloaded(&self, profile_id: &str, _servers: Vec<String>) {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed",
        });
        if let Ok(payload) = serde_json::to_string(&notification) {
            self.sessions.broadcast_to_profile(profile_id, payload).await;
        }
    }
}
