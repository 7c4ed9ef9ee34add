//! `scooter_fetch` (§4.4): issue an HTTP request on the gateway's behalf,
//! capped at 30s and 10MiB of response body.

use serde_json::{Value, json};

use crate::error::ScooterError;

const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_USER_AGENT: &str = "mcp-scooter/0.1.0";

pub async fn handle(args: Value) -> Result<Value, ScooterError> {
    let url = args
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScooterError::Internal("url is required".to_string()))?;
    let method = args
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("GET")
        .to_uppercase();

    let client = reqwest::Client::builder()
        .timeout(TIMEOUT)
        .build()
        .map_err(|e| ScooterError::Internal(e.to_string()))?;

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| ScooterError::Internal(format!("invalid method: {e}")))?;
    let mut request = client.request(method, url);

    let mut has_user_agent = false;
    if let Some(headers) = args.get("headers").and_then(|h| h.as_object()) {
        for (key, value) in headers {
            if key.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            if let Some(value) = value.as_str() {
                request = request.header(key, value);
            }
        }
    }
    if !has_user_agent {
        request = request.header("User-Agent", DEFAULT_USER_AGENT);
    }
    if let Some(body) = args.get("body").and_then(|v| v.as_str()) {
        request = request.body(body.to_string());
    }

    let response = request
        .send()
        .await
        .map_err(|e| ScooterError::Internal(format!("fetch failed: {e}")))?;

    let status = response.status().as_u16();
    let status_text = response
        .status()
        .canonical_reason()
        .unwrap_or("")
        .to_string();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let headers: serde_json::Map<String, Value> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or(""))))
        .collect();

    let bytes = read_capped(response).await?;
    let size = bytes.len();
    let body = String::from_utf8_lossy(&bytes).to_string();

    Ok(json!({
        "status": status,
        "statusText": status_text,
        "headers": headers,
        "body": body,
        "contentType": content_type,
        "size": size,
    }))
}

async fn read_capped(mut response: reqwest::Response) -> Result<Vec<u8>, ScooterError> {
    let mut buf = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ScooterError::Internal(format!("error reading response body: {e}")))?
    {
        buf.extend_from_slice(&chunk);
        if buf.len() > MAX_BODY_BYTES {
            buf.truncate(MAX_BODY_BYTES);
            break;
        }
    }
    Ok(buf)
}
