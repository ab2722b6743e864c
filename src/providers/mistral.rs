//! Provider adapter for Mistral's Batch API.
//!
//! File-based like OpenAI, but the job endpoint lives at `/v1/batch/jobs`,
//! the create payload names `input_files` and requires the model, and the
//! poll statuses are upper-cased.

use super::{Provider, QueueKey};
use serde_json::Value;

pub struct MistralProvider;

impl Provider for MistralProvider {
    fn name(&self) -> &'static str {
        "mistral"
    }

    fn hostname(&self) -> &'static str {
        "api.mistral.ai"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1/chat/completions", "/v1/embeddings"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["SUCCESS", "FAILED", "TIMEOUT_EXCEEDED", "CANCELLED"]
    }

    fn batch_endpoint(&self) -> &'static str {
        "/v1/batch/jobs"
    }

    fn output_file_field(&self) -> &'static str {
        "output_file"
    }

    fn error_file_field(&self) -> &'static str {
        "error_file"
    }

    fn batch_payload(&self, file_id: &str, queue_key: &QueueKey) -> Value {
        serde_json::json!({
            "input_files": [file_id],
            "endpoint": queue_key.endpoint,
            "model": queue_key.model,
            "metadata": {"description": "batchling runtime batch"},
        })
    }
}
