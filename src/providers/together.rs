//! Provider adapter for Together's Batch API.
//!
//! OpenAI-style file flow with upper-cased job statuses, like Mistral's.

use super::Provider;

pub struct TogetherProvider;

impl Provider for TogetherProvider {
    fn name(&self) -> &'static str {
        "together"
    }

    fn hostname(&self) -> &'static str {
        "api.together.xyz"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1/chat/completions"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["COMPLETED", "FAILED", "EXPIRED", "CANCELLED"]
    }

    fn status_field(&self) -> &'static str {
        "status"
    }

    fn output_file_field(&self) -> &'static str {
        "output_file_id"
    }

    fn error_file_field(&self) -> &'static str {
        "error_file_id"
    }
}
