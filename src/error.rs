//! The error taxonomy the core must distinguish and propagate (see §7).
//!
//! Each variant knows how to render itself as a JSON-RPC error object or an
//! HTTP status, so the Gateway doesn't need a second mapping table.

use std::time::Duration;
use thiserror::Error;

/// JSON-RPC 2.0 reserved error codes used by the wire protocol (§6).
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Error)]
pub enum ScooterError {
    #[error("parse error")]
    Parse,

    #[error("missing or invalid API key")]
    Auth,

    #[error("{0}")]
    NotFound(String),

    #[error("Tool '{tool}' is not allowed for this profile. Add '{server}' to AllowTools.")]
    NotAllowed { tool: String, server: String },

    #[error("built-in '{0}' is disabled for this profile")]
    Disabled(String),

    #[error("failed to start downstream server '{server}': {reason}")]
    DownstreamStartFailed { server: String, reason: String },

    #[error("downstream server '{server}' did not reply within {elapsed:?}")]
    DownstreamTimeout { server: String, elapsed: Duration },

    #[error("downstream server '{server}' sent malformed output: {reason}")]
    DownstreamProtocol { server: String, reason: String },

    #[error("downstream server '{server}' returned an error: {message}")]
    DownstreamError {
        server: String,
        code: i64,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScooterError {
    /// The JSON-RPC error code this error surfaces as, per §7's table.
    pub fn rpc_code(&self) -> i64 {
        use rpc_code::*;
        match self {
            ScooterError::Parse => PARSE_ERROR,
            ScooterError::Auth => INTERNAL_ERROR, // auth is surfaced as HTTP 401, not JSON-RPC
            ScooterError::NotFound(_) => METHOD_NOT_FOUND,
            ScooterError::NotAllowed { .. } => METHOD_NOT_FOUND,
            ScooterError::Disabled(_) => INTERNAL_ERROR,
            ScooterError::DownstreamStartFailed { .. } => INTERNAL_ERROR,
            ScooterError::DownstreamTimeout { .. } => INTERNAL_ERROR,
            ScooterError::DownstreamProtocol { .. } => INTERNAL_ERROR,
            ScooterError::DownstreamError { code, .. } => *code,
            ScooterError::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// The HTTP status this error surfaces as when it short-circuits a whole
    /// request rather than becoming a JSON-RPC error payload.
    pub fn http_status(&self) -> u16 {
        match self {
            ScooterError::Auth => 401,
            ScooterError::NotFound(_) => 404,
            _ => 200, // everything else rides inside a 200 JSON-RPC error envelope
        }
    }
}

impl From<ScooterError> for anyhow::Error {
    fn from(e: ScooterError) -> Self {
        anyhow::anyhow!(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_method_not_found() {
        let e = ScooterError::NotFound("server not found".into());
        assert_eq!(e.rpc_code(), rpc_code::METHOD_NOT_FOUND);
    }

    #[test]
    fn downstream_error_preserves_code() {
        let e = ScooterError::DownstreamError {
            server: "brave-search".into(),
            code: -32000,
            message: "boom".into(),
        };
        assert_eq!(e.rpc_code(), -32000);
    }

    #[test]
    fn auth_maps_to_401() {
        assert_eq!(ScooterError::Auth.http_status(), 401);
    }
}
