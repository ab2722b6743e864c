//! Provider adapter for xAI's Batch API.
//!
//! Container-style inline submission: create a batch container, then add
//! request entries to it. Status is derived from pending/completed counters
//! rather than a status string, and results come back as one JSON document
//! keyed by `batch_request_id`.

use super::{
    execute_spec, normalize_base_url, with_internal_header, BatchSubmission, PollSnapshot,
    Provider, ProviderRequest, QueueKey, RequestSpec,
};
use crate::error::{BatchlingError, Result};
use crate::http::{HttpClient, HttpResponse};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;

pub struct XaiProvider;

#[async_trait]
impl Provider for XaiProvider {
    fn name(&self) -> &'static str {
        "xai"
    }

    fn hostname(&self) -> &'static str {
        "api.x.ai"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1/chat/completions"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["ended"]
    }

    fn is_file_based(&self) -> bool {
        false
    }

    fn custom_id_field(&self) -> &'static str {
        "batch_request_id"
    }

    fn jsonl_lines(&self, requests: &[ProviderRequest]) -> Result<Vec<Value>> {
        requests
            .iter()
            .map(|request| {
                Ok(serde_json::json!({
                    "batch_request_id": request.custom_id,
                    "batch_request": {"chat_get_completion": request.json_body()?},
                }))
            })
            .collect()
    }

    /// Counters, not a status string: any pending requests mean the batch is
    /// still cooking.
    fn parse_poll(&self, payload: &Value) -> PollSnapshot {
        let state = payload.get("state").cloned().unwrap_or(Value::Null);
        let num_pending = state
            .get("num_pending")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let num_completed = state
            .get("num_completed")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let status = if num_pending > 0 {
            if num_completed > 0 { "running" } else { "pending" }
        } else {
            "ended"
        };
        PollSnapshot {
            status: status.to_string(),
            output_file_id: String::new(),
            error_file_id: String::new(),
        }
    }

    fn results_spec(
        &self,
        api_headers: &HeaderMap,
        _file_id: Option<&str>,
        batch_id: &str,
    ) -> Result<RequestSpec> {
        Ok(RequestSpec::get(
            format!("/v1/batches/{batch_id}/results"),
            api_headers.clone(),
        ))
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
                    "Undecodable batch results payload"
                );
                return decoded;
            }
        };
        for result in payload
            .get("results")
            .and_then(Value::as_array)
            .map(|v| v.as_slice())
            .unwrap_or_default()
        {
            let Some(custom_id) = result
                .get(self.custom_id_field())
                .and_then(Value::as_str)
            else {
                tracing::debug!(
                    provider = self.name(),
                    batch_id = batch_id,
                    "Batch result missing batch_request_id"
                );
                continue;
            };
            let item = result.get("batch_result").cloned().unwrap_or(Value::Null);
            decoded.insert(custom_id.to_string(), self.decode_line(&item));
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
                .unwrap_or_else(|| serde_json::json!({"error": "missing response"}));
            HttpResponse::json(500, &error)
        }
    }

    /// Two-step container submission instead of the default inline POST.
    async fn submit(
        &self,
        requests: &[ProviderRequest],
        _queue_key: &QueueKey,
        transport: &dyn HttpClient,
    ) -> Result<BatchSubmission> {
        let first = requests.first().ok_or_else(|| {
            BatchlingError::InvalidRequest("cannot submit an empty request batch".to_string())
        })?;
        let base_url = normalize_base_url(&first.host)?;
        let api_headers = with_internal_header(self.api_headers(&first.headers)?);
        let lines = self.jsonl_lines(requests)?;

        let create_spec = RequestSpec::post_json(
            self.batch_endpoint(),
            api_headers.clone(),
            &serde_json::json!({"name": "batchling runtime batch"}),
        );
        let response = execute_spec(transport, &base_url, &create_spec).await?;
        let batch_id = response
            .json_body()?
            .get("batch_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BatchlingError::Provider {
                status: None,
                message: "batch container response is missing 'batch_id'".to_string(),
            })?;

        let add_spec = RequestSpec::post_json(
            format!("{}/{batch_id}/requests", self.batch_endpoint()),
            api_headers.clone(),
            &serde_json::json!({"batch_requests": lines}),
        );
        execute_spec(transport, &base_url, &add_spec).await?;
        tracing::debug!(
            provider = self.name(),
            batch_id = %batch_id,
            request_count = requests.len(),
            "Added requests to batch container"
        );

        Ok(BatchSubmission {
            base_url,
            api_headers,
            batch_id,
        })
    }
}
