//! `scooter_code_interpreter` (§4.4, optional): runs a script in a
//! sandboxed JS engine where a `callTool(name, args)` helper routes back
//! through the engine's `CallTool`, enabling chained tool invocation
//! without context-window inflation. The JS sandbox itself is an
//! out-of-scope external collaborator (§1) — this module only defines the
//! seam a real sandbox would plug into.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ScooterError;

/// What a script's `callTool(name, args)` helper needs: a way back into
/// the owning engine's tool dispatch.
#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value, ScooterError>;
}

/// A sandboxed script runtime. No implementation ships in this crate; the
/// embedded JS sandbox is an out-of-scope external collaborator.
#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    async fn run(&self, script: &str, arguments: Value, host: &dyn ToolHost) -> Result<Value, ScooterError>;
}

#[derive(Debug, Default)]
pub struct UnconfiguredSandbox;

#[async_trait]
impl ScriptSandbox for UnconfiguredSandbox {
    async fn run(&self, _script: &str, _arguments: Value, _host: &dyn ToolHost) -> Result<Value, ScooterError> {
        Err(ScooterError::Internal(
            "no script sandbox is configured for code_interpreter".to_string(),
        ))
    }
}

pub async fn handle(args: Value, host: &dyn ToolHost) -> Result<Value, ScooterError> {
    let script = args
        .get("script")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScooterError::Internal("script is required".to_string()))?;
    let arguments = args.get("arguments").cloned().unwrap_or(Value::Null);
    UnconfiguredSandbox.run(script, arguments, host).await
}
