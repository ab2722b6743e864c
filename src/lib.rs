//! Transparent batching middleware for generative-AI HTTP APIs.
//!
//! Application code keeps issuing ordinary per-request calls (chat
//! completions, embeddings, message generation); inside a [`batchify`]
//! scope, requests that match a known provider's batchable endpoint are
//! grouped by `(provider, endpoint, model)`, submitted through the
//! provider's asynchronous batch API, polled until completion, and
//! resolved back to each caller as a response indistinguishable from the
//! synchronous endpoint's. The payoff is batch-API pricing in exchange for
//! deferred completion.
//!
//! A persistent request cache makes reruns cheap: a request whose batch
//! was already submitted in an earlier run re-attaches to that batch's
//! poll instead of submitting again.

pub mod cache;
pub mod context;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod hook;
pub mod http;
pub mod providers;

// Re-export commonly used types
pub use cache::{CacheEntry, RequestCacheStore};
pub use context::{batchify, BatchingContext};
pub use engine::{Batcher, BatcherConfig};
pub use error::{BatchlingError, Result};
pub use hook::{
    install_hooks, shared_client, BatchingClient, CACHE_HIT_HEADER, DRY_RUN_HEADER,
    INTERNAL_HEADER,
};
pub use http::{HttpClient, HttpRequest, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use providers::{
    provider_for_batch_request, provider_for_url, BatchSubmission, PollSnapshot, Provider,
    ProviderRequest, QueueKey, RequestSpec, ResumeContext,
};
