//! Provider adapter for OpenAI's HTTP and Batch APIs.
//!
//! This is the reference file-based flow the trait defaults implement:
//! upload a JSONL file to `/v1/files`, create a job at `/v1/batches`, poll
//! it, download `/v1/files/{id}/content`.

use super::Provider;

pub struct OpenAiProvider;

impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn hostname(&self) -> &'static str {
        "api.openai.com"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &[
            "/v1/responses",
            "/v1/chat/completions",
            "/v1/embeddings",
            "/v1/completions",
            "/v1/moderations",
        ]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["completed", "failed", "cancelled", "expired"]
    }
}
