//! Deterministic request fingerprints for cache identity.
//!
//! A fingerprint is a SHA-256 over a canonical JSON envelope of
//! `{body, endpoint, host, model, provider}`. Object keys are recursively
//! sorted and rendered with compact separators, so the hash is stable
//! across processes and platforms and independent of header order, URL
//! scheme or query strings.

use crate::error::{BatchlingError, Result};
use crate::providers::QueueKey;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the fingerprint for an intercepted request.
///
/// # Errors
/// Returns `InvalidRequest` when the body is absent or is not valid JSON;
/// bodies are required for strict cache identity.
pub fn request_fingerprint(queue_key: &QueueKey, host: &str, body: Option<&[u8]>) -> Result<String> {
    let body = body.ok_or_else(|| {
        BatchlingError::InvalidRequest(
            "batch request JSON body is required for cache fingerprinting".to_string(),
        )
    })?;
    let payload: Value = serde_json::from_slice(body)?;

    let envelope = serde_json::json!({
        "provider": queue_key.provider,
        "endpoint": queue_key.endpoint,
        "model": queue_key.model,
        "host": host.to_ascii_lowercase(),
        "body": payload,
    });

    let mut canonical = String::new();
    write_canonical(&envelope, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Render a JSON value in canonical form: recursively sorted object keys,
/// compact separators, standard serde_json number formatting.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
