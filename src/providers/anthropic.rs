//! Provider adapter for Anthropic's Message Batches API.
//!
//! Inline submission: requests are POSTed directly to
//! `/v1/messages/batches` as `{custom_id, params}` entries. Results are a
//! JSONL stream at `/v1/messages/batches/{id}/results` whose lines wrap the
//! outcome in a typed `result` envelope instead of an HTTP response shape.

use super::{Provider, ProviderRequest, RequestSpec};
use crate::error::{BatchlingError, Result};
use crate::http::HttpResponse;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider;

impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn hostname(&self) -> &'static str {
        "api.anthropic.com"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1/messages"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["ended"]
    }

    fn is_file_based(&self) -> bool {
        false
    }

    fn status_field(&self) -> &'static str {
        "processing_status"
    }

    fn batch_endpoint(&self) -> &'static str {
        "/v1/messages/batches"
    }

    fn api_headers(&self, headers: &HeaderMap) -> Result<HeaderMap> {
        let mut api_headers = HeaderMap::new();
        for (name, value) in headers {
            let lower = name.as_str();
            if lower == "x-api-key" || lower == "authorization" || lower.starts_with("anthropic-") {
                api_headers.insert(name.clone(), value.clone());
            }
        }
        if !api_headers.contains_key("x-api-key") && !api_headers.contains_key("authorization") {
            let env = self.api_key_env();
            let key = std::env::var(&env).map_err(|_| {
                BatchlingError::Auth(format!("no credential on request and {env} is not set"))
            })?;
            let value = HeaderValue::from_str(&key)
                .map_err(|_| BatchlingError::Auth(format!("{env} contains an invalid value")))?;
            api_headers.insert(HeaderName::from_static("x-api-key"), value);
        }
        if !api_headers.contains_key("anthropic-version") {
            api_headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        Ok(api_headers)
    }

    fn jsonl_lines(&self, requests: &[ProviderRequest]) -> Result<Vec<Value>> {
        requests
            .iter()
            .map(|request| {
                Ok(serde_json::json!({
                    "custom_id": request.custom_id,
                    "params": request.json_body()?,
                }))
            })
            .collect()
    }

    fn results_spec(
        &self,
        api_headers: &HeaderMap,
        _file_id: Option<&str>,
        batch_id: &str,
    ) -> Result<RequestSpec> {
        Ok(RequestSpec::get(
            format!("/v1/messages/batches/{batch_id}/results"),
            api_headers.clone(),
        ))
    }

    /// Anthropic wraps each outcome in `{"result": {"type": ...}}` rather
    /// than a synthetic HTTP response; map the types back onto statuses.
    fn decode_line(&self, result_item: &Value) -> HttpResponse {
        let result = result_item.get("result").cloned().unwrap_or(Value::Null);
        match result.get("type").and_then(Value::as_str) {
            Some("succeeded") => {
                let message = result.get("message").cloned().unwrap_or(Value::Null);
                HttpResponse::json(200, &message)
            }
            Some("errored") => {
                let error = result.get("error").cloned().unwrap_or(Value::Null);
                let status = match error
                    .get("error")
                    .and_then(|e| e.get("type"))
                    .and_then(Value::as_str)
                {
                    Some("invalid_request_error") => 400,
                    Some("authentication_error") => 401,
                    Some("permission_error") => 403,
                    Some("not_found_error") => 404,
                    Some("rate_limit_error") => 429,
                    Some("overloaded_error") => 529,
                    _ => 500,
                };
                HttpResponse::json(status, &error)
            }
            Some(other) => HttpResponse::json(
                500,
                &serde_json::json!({
                    "type": "error",
                    "error": {"type": other, "message": format!("request {other} in batch")},
                }),
            ),
            None => HttpResponse::json(
                500,
                &serde_json::json!({
                    "type": "error",
                    "error": {"type": "api_error", "message": "missing batch result"},
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_line_shape() {
        let provider = AnthropicProvider;
        let request = ProviderRequest {
            custom_id: "cid-1".to_string(),
            method: "POST".to_string(),
            host: "api.anthropic.com".to_string(),
            endpoint: "/v1/messages".to_string(),
            headers: HeaderMap::new(),
            body: Some(bytes::Bytes::from_static(
                br#"{"model":"claude-sonnet-4-5","messages":[],"max_tokens":16}"#,
            )),
        };
        let lines = provider.jsonl_lines(std::slice::from_ref(&request)).unwrap();
        assert_eq!(lines[0]["custom_id"], "cid-1");
        assert_eq!(lines[0]["params"]["model"], "claude-sonnet-4-5");
        assert!(lines[0].get("url").is_none());
    }

    #[test]
    fn test_api_headers_add_version() {
        let provider = AnthropicProvider;
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_static("sk-ant-test"),
        );
        let api_headers = provider.api_headers(&headers).unwrap();
        assert_eq!(api_headers.get("x-api-key").unwrap(), "sk-ant-test");
        assert_eq!(
            api_headers.get("anthropic-version").unwrap(),
            ANTHROPIC_VERSION
        );
    }

    #[test]
    fn test_decode_succeeded_and_errored_lines() {
        let provider = AnthropicProvider;
        let succeeded = serde_json::json!({
            "custom_id": "cid-1",
            "result": {"type": "succeeded", "message": {"id": "msg_1", "role": "assistant"}},
        });
        let response = provider.decode_line(&succeeded);
        assert_eq!(response.status, 200);
        assert_eq!(response.json_body().unwrap()["id"], "msg_1");

        let errored = serde_json::json!({
            "custom_id": "cid-2",
            "result": {
                "type": "errored",
                "error": {"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}},
            },
        });
        let response = provider.decode_line(&errored);
        assert_eq!(response.status, 429);

        let expired = serde_json::json!({
            "custom_id": "cid-3",
            "result": {"type": "expired"},
        });
        assert_eq!(provider.decode_line(&expired).status, 500);
    }

    #[test]
    fn test_results_path_ignores_file_id() {
        let provider = AnthropicProvider;
        let spec = provider
            .results_spec(&HeaderMap::new(), None, "msgbatch_1")
            .unwrap();
        assert_eq!(spec.path, "/v1/messages/batches/msgbatch_1/results");
    }
}
