//! Provider adapter registry.
//!
//! Each adapter maps a provider's synchronous HTTP API onto its asynchronous
//! batch API: which URLs it owns, which endpoints are batchable, how a batch
//! is submitted and polled, and how result lines turn back into ordinary
//! HTTP responses. The trait carries default implementations for the common
//! OpenAI-style file-based flow; adapters override only where their provider
//! deviates.

use crate::error::{BatchlingError, Result};
use crate::hook::INTERNAL_HEADER;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

pub mod anthropic;
pub mod cerebras;
pub mod doubleword;
pub mod gemini;
pub mod groq;
pub mod mistral;
pub mod openai;
pub mod together;
pub mod xai;

pub use anthropic::AnthropicProvider;
pub use cerebras::CerebrasProvider;
pub use doubleword::DoublewordProvider;
pub use gemini::GeminiProvider;
pub use groq::GroqProvider;
pub use mistral::MistralProvider;
pub use openai::OpenAiProvider;
pub use together::TogetherProvider;
pub use xai::XaiProvider;

/// Queue partition key: provider batch APIs refuse mixed models or endpoints
/// in a single batch, so pending requests are grouped by this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    /// Provider adapter name
    pub provider: String,
    /// Endpoint path (e.g. "/v1/chat/completions")
    pub endpoint: String,
    /// Model name extracted from the request
    pub model: String,
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.endpoint, self.model)
    }
}

/// One pending request as seen by a provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Engine-assigned identifier, unique within the batch
    pub custom_id: String,
    /// HTTP method of the intercepted request
    pub method: String,
    /// Lowercased host of the intercepted request
    pub host: String,
    /// Path of the intercepted request
    pub endpoint: String,
    /// Headers of the intercepted request (auth is carried over from here)
    pub headers: HeaderMap,
    /// Raw JSON body of the intercepted request
    pub body: Option<Bytes>,
}

impl ProviderRequest {
    /// Request body parsed as JSON.
    pub fn json_body(&self) -> Result<Value> {
        let body = self.body.as_ref().ok_or_else(|| {
            BatchlingError::InvalidRequest("batch request is missing a JSON body".to_string())
        })?;
        Ok(serde_json::from_slice(body)?)
    }
}

/// Metadata returned after a provider submits a batch job.
#[derive(Debug, Clone)]
pub struct BatchSubmission {
    /// Provider base URL used for polling
    pub base_url: String,
    /// Provider API headers used for polling and result download
    pub api_headers: HeaderMap,
    /// Provider batch identifier
    pub batch_id: String,
}

/// Provider-described HTTP call executed by the engine transport.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestSpec {
    /// A GET spec with the given headers.
    pub fn get(path: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            headers,
            body: None,
        }
    }

    /// A POST spec with a JSON payload.
    pub fn post_json(path: impl Into<String>, mut headers: HeaderMap, payload: &Value) -> Self {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            method: "POST".to_string(),
            path: path.into(),
            headers,
            body: Some(Bytes::from(payload.to_string())),
        }
    }
}

/// Normalized provider poll snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSnapshot {
    /// Provider status value
    pub status: String,
    /// Output file identifier when available
    pub output_file_id: String,
    /// Error file identifier when available
    pub error_file_id: String,
}

/// Resumed-polling context derived from an intercepted cache-hit request.
#[derive(Debug, Clone)]
pub struct ResumeContext {
    pub base_url: String,
    pub api_headers: HeaderMap,
}

/// Standard interface for mapping HTTP requests to/from provider batch APIs.
///
/// The default methods implement the OpenAI-style flow (JSONL file upload,
/// batch job creation, file download for results); inline providers override
/// `submit`-adjacent pieces and the decoders.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Adapter name, also the prefix of the `<PROVIDER>_API_KEY` variable.
    fn name(&self) -> &'static str;

    /// The single hostname this adapter owns.
    fn hostname(&self) -> &'static str;

    /// Batchable endpoint patterns. Segments may contain a `{model}`
    /// placeholder which matches one non-empty path segment chunk.
    fn batchable_endpoints(&self) -> &'static [&'static str];

    /// Statuses that stop polling and trigger result retrieval.
    fn terminal_states(&self) -> &'static [&'static str];

    /// Whether submission uploads a JSONL file (vs. an inline POST).
    fn is_file_based(&self) -> bool {
        true
    }

    fn batch_method(&self) -> &'static str {
        "POST"
    }

    fn status_field(&self) -> &'static str {
        "status"
    }

    fn custom_id_field(&self) -> &'static str {
        "custom_id"
    }

    fn output_file_field(&self) -> &'static str {
        "output_file_id"
    }

    fn error_file_field(&self) -> &'static str {
        "error_file_id"
    }

    fn file_upload_endpoint(&self) -> &'static str {
        "/v1/files"
    }

    fn batch_endpoint(&self) -> &'static str {
        "/v1/batches"
    }

    fn file_content_path(&self, file_id: &str) -> String {
        format!("/v1/files/{file_id}/content")
    }

    /// Environment variable consulted when the intercepted request carries
    /// no credential of its own.
    fn api_key_env(&self) -> String {
        format!("{}_API_KEY", self.name().to_ascii_uppercase())
    }

    /// Check whether a hostname belongs to this provider.
    fn matches_url(&self, hostname: &str) -> bool {
        !hostname.is_empty() && hostname.eq_ignore_ascii_case(self.hostname())
    }

    /// Check whether an HTTP request should be routed into batching.
    /// Conservative: unknown paths never match.
    fn is_batchable(&self, method: &str, hostname: &str, path: &str) -> bool {
        self.matches_url(hostname)
            && method.eq_ignore_ascii_case(self.batch_method())
            && self.matches_batchable_endpoint(path)
    }

    /// Check whether a request path matches a configured batchable endpoint.
    fn matches_batchable_endpoint(&self, path: &str) -> bool {
        self.batchable_endpoints()
            .iter()
            .any(|pattern| endpoint_matches(pattern, path))
    }

    /// Extract the model name used for queue partitioning.
    ///
    /// The default reads the body's `model` field; model-in-path providers
    /// override this to parse the endpoint instead.
    fn extract_model(&self, endpoint: &str, body: Option<&[u8]>) -> Result<String> {
        let _ = endpoint;
        let body = body.ok_or_else(|| {
            BatchlingError::InvalidRequest(
                "batch request JSON body is required for strict homogeneous batching".to_string(),
            )
        })?;
        let payload: Value = serde_json::from_slice(body)?;
        match payload.get("model").and_then(Value::as_str) {
            Some(model) if !model.trim().is_empty() => Ok(model.to_string()),
            _ => Err(BatchlingError::InvalidRequest(
                "batch request JSON must include non-empty string 'model'".to_string(),
            )),
        }
    }

    /// Build provider API headers from the intercepted request's headers,
    /// falling back to the provider's API-key environment variable.
    fn api_headers(&self, headers: &HeaderMap) -> Result<HeaderMap> {
        let mut api_headers = carry_auth_headers(self.name(), headers);
        if !has_credential(&api_headers) {
            let env = self.api_key_env();
            let key = std::env::var(&env).map_err(|_| {
                BatchlingError::Auth(format!(
                    "no credential on request and {env} is not set"
                ))
            })?;
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| BatchlingError::Auth(format!("{env} contains an invalid value")))?;
            api_headers.insert(AUTHORIZATION, value);
        }
        Ok(api_headers)
    }

    /// Build the provider batch-input artifact lines, one per request.
    fn jsonl_lines(&self, requests: &[ProviderRequest]) -> Result<Vec<Value>> {
        requests
            .iter()
            .map(|request| {
                Ok(serde_json::json!({
                    "custom_id": request.custom_id,
                    "method": request.method,
                    "url": request.endpoint,
                    "body": request.json_body()?,
                }))
            })
            .collect()
    }

    /// Payload for creating a file-based batch job.
    fn batch_payload(&self, file_id: &str, queue_key: &QueueKey) -> Value {
        serde_json::json!({
            "input_file_id": file_id,
            "endpoint": queue_key.endpoint,
            "completion_window": "24h",
            "metadata": {"description": "batchling runtime batch"},
        })
    }

    /// Payload for creating an inline batch job.
    fn inline_payload(&self, lines: Vec<Value>, queue_key: &QueueKey) -> Value {
        let _ = queue_key;
        serde_json::json!({ "requests": lines })
    }

    /// Path used to create the batch job.
    fn batch_submit_path(&self, queue_key: &QueueKey) -> String {
        let _ = queue_key;
        self.batch_endpoint().to_string()
    }

    /// Pull the batch id out of the creation response.
    fn batch_id_from_response(&self, payload: &Value) -> Result<String> {
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BatchlingError::Provider {
                status: None,
                message: "batch creation response is missing 'id'".to_string(),
            })
    }

    /// Poll request metadata for a batch.
    fn poll_spec(&self, api_headers: &HeaderMap, batch_id: &str) -> RequestSpec {
        RequestSpec::get(
            format!("{}/{batch_id}", self.batch_endpoint()),
            api_headers.clone(),
        )
    }

    /// Normalize a poll payload into a provider-independent snapshot.
    fn parse_poll(&self, payload: &Value) -> PollSnapshot {
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        PollSnapshot {
            status: payload
                .get(self.status_field())
                .and_then(Value::as_str)
                .unwrap_or("created")
                .to_string(),
            output_file_id: field(self.output_file_field()),
            error_file_id: field(self.error_file_field()),
        }
    }

    /// Results download request metadata.
    ///
    /// # Errors
    /// File-based providers fail when the terminal poll carried neither an
    /// output nor an error file.
    fn results_spec(
        &self,
        api_headers: &HeaderMap,
        file_id: Option<&str>,
        batch_id: &str,
    ) -> Result<RequestSpec> {
        let _ = batch_id;
        let file_id = file_id.filter(|id| !id.is_empty()).ok_or_else(|| {
            BatchlingError::Provider {
                status: None,
                message: "batch completed without output or error file".to_string(),
            }
        })?;
        Ok(RequestSpec::get(
            self.file_content_path(file_id),
            api_headers.clone(),
        ))
    }

    /// Decode raw result content into responses keyed by custom id.
    ///
    /// The default treats the content as JSONL. Lines that fail to parse or
    /// lack a custom id are logged and skipped; the engine resolves their
    /// requests as incomplete.
    fn decode_results(&self, batch_id: &str, content: &str) -> HashMap<String, HttpResponse> {
        let mut decoded = HashMap::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let result_item: Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(
                        provider = self.name(),
                        batch_id = batch_id,
                        error = %error,
                        "Skipping undecodable batch result line"
                    );
                    continue;
                }
            };
            let Some(custom_id) = result_item
                .get(self.custom_id_field())
                .and_then(Value::as_str)
            else {
                tracing::debug!(
                    provider = self.name(),
                    batch_id = batch_id,
                    "Batch result missing custom_id"
                );
                continue;
            };
            decoded.insert(custom_id.to_string(), self.decode_line(&result_item));
        }
        decoded
    }

    /// Convert one result line into a synthetic HTTP response mirroring the
    /// provider's synchronous endpoint. Provider-side per-request failures
    /// become responses carrying the provider's error envelope.
    fn decode_line(&self, result_item: &Value) -> HttpResponse {
        let response = result_item.get("response").filter(|v| !v.is_null());
        if let Some(response) = response {
            let status = response
                .get("status_code")
                .and_then(Value::as_u64)
                .unwrap_or(200) as u16;
            let body = response.get("body").cloned().unwrap_or(Value::Null);
            let mut http_response = HttpResponse::json(status, &body);
            if let Some(headers) = response.get("headers").and_then(Value::as_object) {
                extend_headers(&mut http_response.headers, headers);
            }
            http_response
        } else {
            let error = result_item
                .get("error")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"error": "missing response"}));
            let status = error
                .get("status_code")
                .and_then(Value::as_u64)
                .unwrap_or(500) as u16;
            HttpResponse::json(status, &error)
        }
    }

    /// Build the resumed-polling context for cache-hit routing.
    fn resume_context(&self, host: &str, headers: &HeaderMap) -> Result<ResumeContext> {
        Ok(ResumeContext {
            base_url: normalize_base_url(host)?,
            api_headers: with_internal_header(self.api_headers(headers)?),
        })
    }

    /// Upload the JSONL batch-input file. File-based providers only.
    async fn upload_batch_file(
        &self,
        base_url: &str,
        api_headers: &HeaderMap,
        lines: &[Value],
        transport: &dyn HttpClient,
    ) -> Result<String> {
        let content = lines
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        let (body, content_type) = jsonl_multipart("batch.jsonl", content.as_bytes(), "batch");
        let mut headers = api_headers.clone();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .map_err(|e| anyhow::anyhow!("invalid multipart content type: {e}"))?,
        );
        tracing::debug!(
            provider = self.name(),
            line_count = lines.len(),
            bytes = content.len(),
            "Uploading batch file"
        );
        let spec = RequestSpec {
            method: "POST".to_string(),
            path: self.file_upload_endpoint().to_string(),
            headers,
            body: Some(body),
        };
        let response = execute_spec(transport, base_url, &spec).await?;
        let payload = response.json_body()?;
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BatchlingError::Provider {
                status: None,
                message: "file upload response is missing 'id'".to_string(),
            })
    }

    /// Create a batch job referencing an uploaded file.
    async fn create_file_based_job(
        &self,
        base_url: &str,
        api_headers: &HeaderMap,
        file_id: &str,
        queue_key: &QueueKey,
        transport: &dyn HttpClient,
    ) -> Result<String> {
        let payload = self.batch_payload(file_id, queue_key);
        let spec = RequestSpec::post_json(
            self.batch_submit_path(queue_key),
            api_headers.clone(),
            &payload,
        );
        let response = execute_spec(transport, base_url, &spec).await?;
        self.batch_id_from_response(&response.json_body()?)
    }

    /// Create a batch job with the request lines inlined in the POST body.
    async fn create_inline_job(
        &self,
        base_url: &str,
        api_headers: &HeaderMap,
        lines: Vec<Value>,
        queue_key: &QueueKey,
        transport: &dyn HttpClient,
    ) -> Result<String> {
        let payload = self.inline_payload(lines, queue_key);
        let spec = RequestSpec::post_json(
            self.batch_submit_path(queue_key),
            api_headers.clone(),
            &payload,
        );
        let response = execute_spec(transport, base_url, &spec).await?;
        self.batch_id_from_response(&response.json_body()?)
    }

    /// Perform the provider-specific submission for a drained queue.
    async fn submit(
        &self,
        requests: &[ProviderRequest],
        queue_key: &QueueKey,
        transport: &dyn HttpClient,
    ) -> Result<BatchSubmission> {
        let first = requests.first().ok_or_else(|| {
            BatchlingError::InvalidRequest("cannot submit an empty request batch".to_string())
        })?;
        let base_url = normalize_base_url(&first.host)?;
        let api_headers = with_internal_header(self.api_headers(&first.headers)?);
        let lines = self.jsonl_lines(requests)?;
        tracing::debug!(
            provider = self.name(),
            base_url = %base_url,
            endpoint = %queue_key.endpoint,
            request_count = lines.len(),
            "Resolved batch submission target"
        );

        let batch_id = if self.is_file_based() {
            let file_id = self
                .upload_batch_file(&base_url, &api_headers, &lines, transport)
                .await?;
            tracing::info!(
                provider = self.name(),
                file_id = %file_id,
                request_count = lines.len(),
                "Uploaded batch file"
            );
            self.create_file_based_job(&base_url, &api_headers, &file_id, queue_key, transport)
                .await?
        } else {
            self.create_inline_job(&base_url, &api_headers, lines, queue_key, transport)
                .await?
        };

        Ok(BatchSubmission {
            base_url,
            api_headers,
            batch_id,
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

static PROVIDERS: OnceLock<Vec<Arc<dyn Provider>>> = OnceLock::new();

/// The built-in adapter set.
pub fn builtin_providers() -> &'static [Arc<dyn Provider>] {
    PROVIDERS
        .get_or_init(|| {
            vec![
                Arc::new(OpenAiProvider),
                Arc::new(DoublewordProvider),
                Arc::new(GroqProvider),
                Arc::new(MistralProvider),
                Arc::new(AnthropicProvider),
                Arc::new(GeminiProvider),
                Arc::new(XaiProvider),
                Arc::new(TogetherProvider),
                Arc::new(CerebrasProvider),
            ]
        })
        .as_slice()
}

/// Find the adapter owning a hostname, regardless of endpoint.
pub fn provider_for_url(hostname: &str) -> Option<Arc<dyn Provider>> {
    builtin_providers()
        .iter()
        .find(|provider| provider.matches_url(hostname))
        .cloned()
}

/// Find the adapter for which `(method, hostname, path)` is batchable.
///
/// A request that matches a provider's host but not a batchable endpoint is
/// non-batchable and passes through untouched.
pub fn provider_for_batch_request(
    method: &str,
    hostname: &str,
    path: &str,
) -> Option<Arc<dyn Provider>> {
    builtin_providers()
        .iter()
        .find(|provider| provider.is_batchable(method, hostname, path))
        .cloned()
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Match a path against an endpoint pattern. Pattern segments may contain a
/// `{placeholder}` which matches a non-empty chunk within one segment
/// (`/v1beta/models/{model}:generateContent` matches
/// `/v1beta/models/gemini-2.0-flash:generateContent`).
pub(crate) fn endpoint_matches(pattern: &str, path: &str) -> bool {
    if !pattern.contains('{') {
        return pattern == path;
    }
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(path_segments.iter())
        .all(|(pattern_segment, path_segment)| {
            segment_matches(pattern_segment, path_segment)
        })
}

fn segment_matches(pattern_segment: &str, path_segment: &str) -> bool {
    let Some(open) = pattern_segment.find('{') else {
        return pattern_segment == path_segment;
    };
    let Some(close) = pattern_segment[open..].find('}').map(|i| i + open) else {
        return false;
    };
    let prefix = &pattern_segment[..open];
    let suffix = &pattern_segment[close + 1..];
    path_segment.len() > prefix.len() + suffix.len()
        && path_segment.starts_with(prefix)
        && path_segment.ends_with(suffix)
}

/// Normalize a host or URL into an absolute HTTPS base URL without a
/// trailing slash.
pub(crate) fn normalize_base_url(url: &str) -> Result<String> {
    let stripped = url.trim().trim_end_matches('/');
    if stripped.is_empty() {
        return Err(BatchlingError::InvalidRequest(
            "provider base URL cannot be empty".to_string(),
        ));
    }
    if stripped.contains("://") {
        Ok(stripped.to_string())
    } else {
        Ok(format!("https://{stripped}"))
    }
}

/// Add the internal bypass marker to provider API headers so engine traffic
/// is never re-intercepted by the hook.
pub(crate) fn with_internal_header(mut headers: HeaderMap) -> HeaderMap {
    headers.insert(
        HeaderName::from_static(INTERNAL_HEADER),
        HeaderValue::from_static("1"),
    );
    headers
}

fn has_credential(headers: &HeaderMap) -> bool {
    headers.contains_key(AUTHORIZATION)
        || headers.contains_key("x-api-key")
        || headers.contains_key("x-goog-api-key")
}

/// Carry recognized auth headers from an intercepted request over to
/// provider API calls: `authorization`, `x-api-key`, `x-goog-api-key`, and
/// any `<provider>-` prefixed header.
fn carry_auth_headers(provider_name: &str, headers: &HeaderMap) -> HeaderMap {
    let prefix = format!("{provider_name}-");
    let mut api_headers = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if lower == "authorization"
            || lower == "x-api-key"
            || lower == "x-goog-api-key"
            || lower.starts_with(&prefix)
        {
            api_headers.insert(name.clone(), value.clone());
        }
    }
    api_headers
}

fn extend_headers(headers: &mut HeaderMap, map: &serde_json::Map<String, Value>) {
    for (key, value) in map {
        if let (Ok(name), Some(text)) = (HeaderName::try_from(key.as_str()), value.as_str())
            && let Ok(header_value) = HeaderValue::from_str(text)
        {
            headers.insert(name, header_value);
        }
    }
}

/// Encode a single-file multipart form with a `purpose` field, returning the
/// body and the content-type header value.
pub(crate) fn jsonl_multipart(filename: &str, content: &[u8], purpose: &str) -> (Bytes, String) {
    let boundary = format!("batchling-{}", uuid::Uuid::new_v4().simple());
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/jsonl\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        "Content-Disposition: form-data; name=\"purpose\"\r\n\r\n".as_bytes(),
    );
    body.extend_from_slice(purpose.as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (
        Bytes::from(body),
        format!("multipart/form-data; boundary={boundary}"),
    )
}

/// Execute a provider request spec through the engine transport, mapping
/// non-2xx responses into provider errors.
pub(crate) async fn execute_spec(
    transport: &dyn HttpClient,
    base_url: &str,
    spec: &RequestSpec,
) -> Result<HttpResponse> {
    let mut request = HttpRequest::new(spec.method.clone(), format!("{base_url}{}", spec.path));
    request.headers = spec.headers.clone();
    request.body = spec.body.clone();
    let response = transport.execute(&request).await?;
    if !response.is_success() {
        let mut message = response.text();
        if message.len() > 512 {
            let mut end = 512;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        return Err(BatchlingError::Provider {
            status: Some(response.status),
            message,
        });
    }
    Ok(response)
}
