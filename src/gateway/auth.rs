//! Gateway authentication (§6): `Authorization: Bearer <key>` or
//! `X-Scooter-Api-Key: <key>` against `settings.gateway_api_key`. A missing
//! key disables auth entirely (local single-user default). A loopback
//! caller presenting `X-Scooter-Internal: 1` bypasses the key check — this
//! is how the binary's own CLI front-end talks to the gateway without
//! provisioning itself an API key.

use std::net::SocketAddr;

use axum::http::HeaderMap;

use crate::error::ScooterError;

use super::GatewayState;

pub fn check(state: &GatewayState, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<(), ScooterError> {
    let settings = state.settings.load();
    let Some(expected_key) = settings.gateway_api_key.as_ref().filter(|k| !k.is_empty()) else {
        return Ok(());
    };

    let claims_internal = headers
        .get("x-scooter-internal")
        .and_then(|v| v.to_str().ok())
        == Some("1");
    if claims_internal && peer.map(|a| a.ip().is_loopback()).unwrap_or(false) {
        return Ok(());
    }

    if let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        && token == expected_key
    {
        return Ok(());
    }

    if let Some(key) = headers.get("x-scooter-api-key").and_then(|v| v.to_str().ok())
        && key == expected_key
    {
        return Ok(());
    }

    Err(ScooterError::Auth)
}

/// Whether this request carries the distinguished internal bypass (§4.1):
/// honored independent of whether API-key auth is even configured, since
/// the desktop UI's tool probes rely on it for routing privileges
/// (auto-activation, allow-list bypass) as well as for skipping the key
/// check. Only honored from loopback.
pub fn is_internal(headers: &HeaderMap, peer: Option<SocketAddr>) -> bool {
    let claims_internal = headers
        .get("x-scooter-internal")
        .and_then(|v| v.to_str().ok())
        == Some("1");
    claims_internal && peer.map(|a| a.ip().is_loopback()).unwrap_or(false)
}
