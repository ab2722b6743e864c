//! Provider adapter for Google's Gemini batch API.
//!
//! The model lives in the request path rather than the body, submission is
//! inline against `models/{model}:batchGenerateContent`, the job is a
//! long-running operation polled by name, and results come back inlined in
//! the finished operation rather than as a downloadable file.

use super::{endpoint_matches, Provider, ProviderRequest, QueueKey, RequestSpec};
use crate::error::{BatchlingError, Result};
use crate::http::HttpResponse;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;

pub struct GeminiProvider;

impl GeminiProvider {
    /// Model id from a `/v1beta/models/{model}:generateContent` path.
    fn model_from_path(path: &str) -> Option<String> {
        let segment = path.rsplit('/').next()?;
        let model = segment.split(':').next()?;
        if model.is_empty() {
            return None;
        }
        Some(model.to_string())
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn hostname(&self) -> &'static str {
        "generativelanguage.googleapis.com"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1beta/models/{model}:generateContent"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &[
            "JOB_STATE_SUCCEEDED",
            "JOB_STATE_FAILED",
            "JOB_STATE_CANCELLED",
            "JOB_STATE_EXPIRED",
        ]
    }

    fn is_file_based(&self) -> bool {
        false
    }

    fn extract_model(&self, endpoint: &str, _body: Option<&[u8]>) -> Result<String> {
        if !endpoint_matches(self.batchable_endpoints()[0], endpoint) {
            return Err(BatchlingError::InvalidRequest(format!(
                "cannot extract model from path '{endpoint}'"
            )));
        }
        Self::model_from_path(endpoint).ok_or_else(|| {
            BatchlingError::InvalidRequest(format!("cannot extract model from path '{endpoint}'"))
        })
    }

    fn api_headers(&self, headers: &HeaderMap) -> Result<HeaderMap> {
        let mut api_headers = HeaderMap::new();
        for (name, value) in headers {
            if name.as_str() == "x-goog-api-key" {
                api_headers.insert(name.clone(), value.clone());
            }
        }
        if api_headers.is_empty() {
            let env = self.api_key_env();
            let key = std::env::var(&env).map_err(|_| {
                BatchlingError::Auth(format!("no credential on request and {env} is not set"))
            })?;
            let value = HeaderValue::from_str(&key)
                .map_err(|_| BatchlingError::Auth(format!("{env} contains an invalid value")))?;
            api_headers.insert(HeaderName::from_static("x-goog-api-key"), value);
        }
        Ok(api_headers)
    }

    fn jsonl_lines(&self, requests: &[ProviderRequest]) -> Result<Vec<Value>> {
        requests
            .iter()
            .map(|request| {
                Ok(serde_json::json!({
                    "request": request.json_body()?,
                    "metadata": {"key": request.custom_id},
                }))
            })
            .collect()
    }

    fn batch_submit_path(&self, queue_key: &QueueKey) -> String {
        format!("/v1beta/models/{}:batchGenerateContent", queue_key.model)
    }

    fn inline_payload(&self, lines: Vec<Value>, _queue_key: &QueueKey) -> Value {
        serde_json::json!({
            "batch": {
                "display_name": "batchling runtime batch",
                "input_config": {"requests": {"requests": lines}},
            }
        })
    }

    /// Batch creation returns a long-running operation; its `name` is the
    /// identifier everything else polls.
    fn batch_id_from_response(&self, payload: &Value) -> Result<String> {
        payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BatchlingError::Provider {
                status: None,
                message: "batch creation response is missing 'name'".to_string(),
            })
    }

    fn poll_spec(&self, api_headers: &HeaderMap, batch_id: &str) -> RequestSpec {
        RequestSpec::get(format!("/v1beta/{batch_id}"), api_headers.clone())
    }

    fn parse_poll(&self, payload: &Value) -> super::PollSnapshot {
        let status = payload
            .get("metadata")
            .and_then(|m| m.get("state"))
            .or_else(|| payload.get("state"))
            .and_then(Value::as_str)
            .unwrap_or("JOB_STATE_PENDING")
            .to_string();
        super::PollSnapshot {
            status,
            output_file_id: String::new(),
            error_file_id: String::new(),
        }
    }

    /// Results are inlined in the finished operation, so the results call
    /// is the poll call.
    fn results_spec(
        &self,
        api_headers: &HeaderMap,
        _file_id: Option<&str>,
        batch_id: &str,
    ) -> Result<RequestSpec> {
        Ok(self.poll_spec(api_headers, batch_id))
    }

    fn decode_results(&self, batch_id: &str, content: &str) -> HashMap<String, HttpResponse> {
        let mut decoded = HashMap::new();
        let payload: Value = match serde_json::from_str(content) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    provider = self.name(),
                    batch_id = batch_id,
                    error = %error,
                    "Undecodable batch operation payload"
                );
                return decoded;
            }
        };
        let inlined = payload
            .get("response")
            .and_then(|r| r.get("inlinedResponses"))
            .map(|r| match r {
                Value::Array(_) => r.clone(),
                _ => r.get("inlinedResponses").cloned().unwrap_or(Value::Null),
            })
            .unwrap_or(Value::Null);
        let Some(items) = inlined.as_array() else {
            tracing::debug!(
                provider = self.name(),
                batch_id = batch_id,
                "Batch operation carried no inlined responses"
            );
            return decoded;
        };
        for item in items {
            let Some(custom_id) = item
                .get("metadata")
                .and_then(|m| m.get("key"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            decoded.insert(custom_id.to_string(), self.decode_line(item));
        }
        decoded
    }

    fn decode_line(&self, result_item: &Value) -> HttpResponse {
        if let Some(response) = result_item.get("response").filter(|v| !v.is_null()) {
            HttpResponse::json(200, response)
        } else {
            let error = result_item
                .get("error")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"message": "missing response"}));
            let status = error.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
            HttpResponse::json(status, &serde_json::json!({"error": error}))
        }
    }
}
