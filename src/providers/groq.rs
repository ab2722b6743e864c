//! Provider adapter for Groq's OpenAI-compatible Batch API.
//!
//! Same flow as OpenAI behind an `/openai/v1` path prefix.

use super::Provider;

pub struct GroqProvider;

impl Provider for GroqProvider {
    fn name(&self) -> &'static str {
        "groq"
    }

    fn hostname(&self) -> &'static str {
        "api.groq.com"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/openai/v1/chat/completions"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["completed", "failed", "cancelled", "expired"]
    }

    fn file_upload_endpoint(&self) -> &'static str {
        "/openai/v1/files"
    }

    fn batch_endpoint(&self) -> &'static str {
        "/openai/v1/batches"
    }

    fn file_content_path(&self, file_id: &str) -> String {
        format!("/openai/v1/files/{file_id}/content")
    }
}
