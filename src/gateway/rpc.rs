//! JSON-RPC dispatch (§4.1, §6). Two distinct POST surfaces:
//! `/profiles/{id}/sse?sessionId=<hex>` is the live-session submit path —
//! 202 and the reply pushed onto that session's SSE channel once ready,
//! or (missing/unknown session) 200 with the reply in the body; plain
//! `/profiles/{id}/message` never looks at a session at all and always
//! answers synchronously in its own response body.

use std::net::SocketAddr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::builtins;
use crate::config::Profile;
use crate::engine::{AddStatus, Engine};
use crate::error::{ScooterError, rpc_code};

use super::{GatewayState, auth};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Serialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

fn ok_response(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn err_response(id: Value, code: i64, message: String) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcErrorObject { code, message }),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

/// `POST /profiles/{id}/sse?sessionId=<hex>` — the live-session submit path.
pub async fn session_message_handler(
    State(state): State<GatewayState>,
    Path(profile_id): Path<String>,
    Query(query): Query<MessageQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_session_message(state, profile_id, query, peer, headers, body).await
}

/// `POST /sse?sessionId=<hex>` — same, targeting the `work` profile shortcut.
pub async fn default_profile_session_message_handler(
    State(state): State<GatewayState>,
    Query(query): Query<MessageQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_session_message(
        state,
        super::ROOT_SHORTCUT_PROFILE.to_string(),
        query,
        peer,
        headers,
        body,
    )
    .await
}

/// `POST /profiles/{id}/message` — request/response only, reply always in
/// the HTTP body, no session involved.
pub async fn plain_message_handler(
    State(state): State<GatewayState>,
    Path(profile_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_plain_message(state, profile_id, peer, headers, body).await
}

/// `POST /message` — same, targeting the `work` profile shortcut.
pub async fn default_profile_plain_message_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_plain_message(state, super::ROOT_SHORTCUT_PROFILE.to_string(), peer, headers, body).await
}

/// Shared preamble: auth, parse, profile existence. Returns the parsed
/// request (and whether the caller is internal) or a short-circuit response.
async fn admit(
    state: &GatewayState,
    profile_id: &str,
    peer: SocketAddr,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(RpcRequest, bool), Response> {
    if let Err(e) = auth::check(state, headers, Some(peer)) {
        return Err(StatusCode::from_u16(e.http_status())
            .unwrap_or(StatusCode::UNAUTHORIZED)
            .into_response());
    }

    // A malformed body never reaches a profile/method at all; the failure
    // mode is a synchronous JSON-RPC parse error, id null, socket left open.
    let request: RpcRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(_) => {
            let response = err_response(Value::Null, rpc_code::PARSE_ERROR, "Parse error".to_string());
            return Err(Json(response).into_response());
        }
    };

    if state.profile_manager.get(profile_id).await.is_none() {
        return Err(StatusCode::NOT_FOUND.into_response());
    }

    let is_internal = auth::is_internal(headers, Some(peer));
    Ok((request, is_internal))
}

async fn accept_session_message(
    state: GatewayState,
    profile_id: String,
    query: MessageQuery,
    peer: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (request, is_internal) = match admit(&state, &profile_id, peer, &headers, &body).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(id) = request.id.clone() else {
        // A notification (e.g. notifications/initialized): never replied to.
        tokio::spawn(async move {
            let _ = dispatch(&state, &profile_id, is_internal, &request.method, request.params).await;
        });
        return StatusCode::ACCEPTED.into_response();
    };

    match query.session_id {
        Some(session_id) => {
            // Fire-and-forget: acknowledge receipt now, deliver over the
            // session's SSE stream once dispatch completes.
            tokio::spawn(async move {
                deliver_over_session(state, profile_id, session_id, is_internal, id, request).await;
            });
            StatusCode::ACCEPTED.into_response()
        }
        None => {
            // No live session to push through: block and answer in the body.
            let response = match dispatch(&state, &profile_id, is_internal, &request.method, request.params).await
            {
                Ok(result) => ok_response(id, result),
                Err(e) => err_response(id, e.rpc_code(), e.to_string()),
            };
            Json(response).into_response()
        }
    }
}

async fn accept_plain_message(
    state: GatewayState,
    profile_id: String,
    peer: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (request, is_internal) = match admit(&state, &profile_id, peer, &headers, &body).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(id) = request.id.clone() else {
        tokio::spawn(async move {
            let _ = dispatch(&state, &profile_id, is_internal, &request.method, request.params).await;
        });
        return StatusCode::ACCEPTED.into_response();
    };

    let response = match dispatch(&state, &profile_id, is_internal, &request.method, request.params).await {
        Ok(result) => ok_response(id, result),
        Err(e) => err_response(id, e.rpc_code(), e.to_string()),
    };
    Json(response).into_response()
}

async fn deliver_over_session(
    state: GatewayState,
    profile_id: String,
    session_id: String,
    is_internal: bool,
    id: Value,
    request: RpcRequest,
) {
    let response = match dispatch(&state, &profile_id, is_internal, &request.method, request.params).await {
        Ok(result) => ok_response(id, result),
        Err(e) => err_response(id, e.rpc_code(), e.to_string()),
    };

    let Ok(payload) = serde_json::to_string(&response) else {
        warn!("failed to serialize JSON-RPC response");
        return;
    };
    if !state.sessions.send_to_session(&session_id, payload).await {
        warn!(%session_id, "session gone before response could be delivered");
    }
}

async fn dispatch(
    state: &GatewayState,
    profile_id: &str,
    is_internal: bool,
    method: &str,
    params: Value,
) -> Result<Value, ScooterError> {
    if method == "initialize" {
        return Ok(initialize_result());
    }

    let engine = state
        .profile_manager
        .get(profile_id)
        .await
        .ok_or_else(|| ScooterError::NotFound(format!("profile '{profile_id}' not found")))?;
    let profile = state
        .profile_manager
        .profile(profile_id)
        .await
        .unwrap_or_else(|| default_profile(profile_id));

    match method {
        "tools/list" | "list_tools" => {
            let tools = engine.list_tools().await;
            Ok(json!({"tools": tools}))
        }
        "tools/call" | "call_tool" => {
            let tool_name = params
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ScooterError::Internal("params.name is required".to_string()))?
                .to_string();
            let arguments = params.get("arguments").cloned();

            let (result, activation_changed) =
                route_tool_call(&engine, &profile, &tool_name, arguments, is_internal).await?;
            if activation_changed {
                notify_list_changed(state, profile_id).await;
            }
            Ok(wrap_as_content(result))
        }
        other => Err(ScooterError::NotFound(format!("method not found: {other}"))),
    }
}

/// The 6-step `tools/call` routing algorithm (§4.1). "Internal" is a
/// property of the *request* (the loopback-only bypass header, §4.1
/// Authentication), not of the resolved server: it's what lets an
/// internal caller auto-activate any server on demand and skip the
/// profile's allow-list, while an external client must `scooter_activate`
/// first and stay within `allow_tools`.
async fn route_tool_call(
    engine: &Engine,
    profile: &Profile,
    tool_name: &str,
    arguments: Option<Value>,
    is_internal: bool,
) -> Result<(Value, bool), ScooterError> {
    if builtins::is_builtin_name(tool_name) {
        let result = engine.call_tool(tool_name, arguments).await?;
        let activation_changed = matches!(
            tool_name,
            "scooter_activate" | "scooter_add" | "scooter_remove"
        );
        return Ok((result, activation_changed));
    }

    let server = engine.resolve_server_for_tool(tool_name).await.ok_or_else(|| {
        ScooterError::NotFound(format!(
            "tool '{tool_name}' not found. Use scooter_find to discover available servers."
        ))
    })?;

    if !is_internal && !profile.allow_tools.iter().any(|s| s == &server) {
        return Err(ScooterError::NotAllowed {
            tool: tool_name.to_string(),
            server,
        });
    }

    let mut activation_changed = false;
    if !engine.is_active(&server).await {
        if is_internal {
            let outcome = engine.add(&server).await?;
            activation_changed = matches!(outcome.status, AddStatus::Activated);
        } else {
            return Err(ScooterError::NotFound(format!(
                "server '{server}' is not active. Use scooter_activate or scooter_add to activate it first."
            )));
        }
    }

    engine
        .sync_profile_context(profile.env.clone(), profile.disabled_system_tools.iter().cloned().collect())
        .await;
    let result = engine.call_tool(tool_name, arguments).await?;
    Ok((result, activation_changed))
}

async fn notify_list_changed(state: &GatewayState, profile_id: &str) {
    let notification = json!({
        "jsonrpc": "2.0",
        "method": "notifications/tools/list_changed",
    });
    if let Ok(payload) = serde_json::to_string(&notification) {
        state.sessions.broadcast_to_profile(profile_id, payload).await;
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": {"name": "mcp-scooter", "version": "0.1.0"},
        "capabilities": {"tools": {"listChanged": true}},
    })
}

fn default_profile(profile_id: &str) -> Profile {
    Profile {
        id: profile_id.to_string(),
        remote_server_url: None,
        remote_auth_mode: None,
        env: Default::default(),
        allow_tools: Vec::new(),
        disabled_system_tools: Vec::new(),
    }
}

/// MCP tool results carry a `content` array; wrap a bare value that isn't
/// already shaped that way (§6).
fn wrap_as_content(value: Value) -> Value {
    if value.get("content").and_then(|c| c.as_array()).is_some() {
        return value;
    }
    let text = match &value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    json!({"content": [{"type": "text", "text": text}]})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_bare_value_in_content_array() {
        let wrapped = wrap_as_content(json!({"foo": "bar"}));
        assert!(wrapped["content"].as_array().is_some());
    }

    #[test]
    fn leaves_already_shaped_content_untouched() {
        let shaped = json!({"content": [{"type": "text", "text": "hi"}]});
        let wrapped = wrap_as_content(shaped.clone());
        assert_eq!(wrapped, shaped);
    }
}
