//! Provider adapter for Cerebras' OpenAI-compatible Batch API.

use super::Provider;

pub struct CerebrasProvider;

impl Provider for CerebrasProvider {
    fn name(&self) -> &'static str {
        "cerebras"
    }

    fn hostname(&self) -> &'static str {
        "api.cerebras.ai"
    }

    fn batchable_endpoints(&self) -> &'static [&'static str] {
        &["/v1/chat/completions"]
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["completed", "failed"]
    }
}
