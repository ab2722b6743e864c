//! Provider adapter for Doubleword's OpenAI-compatible Batch API.

use super::Provider;

pub struct DoublewordProvider;

impl Provider for DoublewordProvider {
    fn name(&self) -> &'static str {
        "doubleword"
    }

    fn hostname(&self) -> &'static str {
        "api.doubleword.ai"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1/chat/completions", "/v1/completions", "/v1/embeddings"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["completed", "failed", "cancelled", "expired"]
    }
}
