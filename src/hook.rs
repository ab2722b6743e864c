//! HTTP interception hook.
//!
//! Rust has no monkey-patching, so the "replaced request primitive" is a
//! construction-time wrapper: [`BatchingClient`] implements [`HttpClient`]
//! over an inner client and decides per request whether to delegate or to
//! route into the active engine. A process-wide instance is installed once
//! by [`install_hooks`] and handed out by [`shared_client`]; the engine's
//! own provider traffic flows through the same client but carries the
//! internal sentinel header, which is the recursion guard.

use crate::context;
use crate::error::Result;
use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
use crate::providers;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

/// Sentinel header on engine-originated HTTP; requests carrying it bypass
/// interception.
pub const INTERNAL_HEADER: &str = "x-batchling-internal";

/// Header on synthetic dry-run responses.
pub const DRY_RUN_HEADER: &str = "x-batchling-dry-run";

/// Header recording whether a dry-run response came from a cache lookup.
pub const CACHE_HIT_HEADER: &str = "x-batchling-cache-hit";

/// HTTP client wrapper that routes batchable requests into the active
/// engine and delegates everything else to the inner client unchanged.
pub struct BatchingClient<C> {
    inner: C,
}

impl<C: HttpClient> BatchingClient<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for BatchingClient<C> {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        // Engine-originated uploads and polls bypass interception.
        if request.headers.contains_key(INTERNAL_HEADER) {
            return self.inner.execute(request).await;
        }

        let Some(engine) = context::current_engine() else {
            return self.inner.execute(request).await;
        };

        let hostname = request.host();
        let path = request.path();
        let Some(provider) =
            providers::provider_for_batch_request(&request.method, &hostname, &path)
        else {
            tracing::debug!(
                method = %request.method,
                hostname = %hostname,
                path = %path,
                "Request not routed to batcher: no batchable provider match"
            );
            return self.inner.execute(request).await;
        };

        tracing::info!(
            provider = provider.name(),
            method = %request.method,
            url = %request.url,
            "Intercepted batchable request"
        );
        engine.submit(provider, request.clone()).await
    }
}

static SHARED_CLIENT: OnceLock<Arc<BatchingClient<ReqwestHttpClient>>> = OnceLock::new();

/// Install the process-wide intercepting client. Idempotent: the first call
/// wins and every later call is a no-op.
pub fn install_hooks() {
    let _ = SHARED_CLIENT.get_or_init(|| {
        tracing::debug!("Installing batching HTTP hook");
        Arc::new(BatchingClient::new(ReqwestHttpClient::new()))
    });
}

/// The installed process-wide client. Application code issues its provider
/// calls through this client (or any [`BatchingClient`] wrapper); when a
/// batching scope is active those calls are transparently batched.
pub fn shared_client() -> Arc<dyn HttpClient> {
    install_hooks();
    SHARED_CLIENT
        .get()
        .expect("hook installed by install_hooks")
        .clone()
}
