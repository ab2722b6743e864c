//! Core types for the batching engine.

use crate::error::Result;
use crate::http::HttpResponse;
use crate::providers::{Provider, ProviderRequest, QueueKey, ResumeContext};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// One-shot completion handle the intake caller is awaiting.
///
/// Exactly one producer completes it: the poller, the dry-run path, or an
/// error path. A dropped receiver marks the caller as having lost interest.
pub(crate) type CompletionHandle = oneshot::Sender<Result<HttpResponse>>;

/// A request waiting to be batched.
pub(crate) struct PendingRequest {
    /// Engine-assigned identifier, unique within its batch
    pub custom_id: String,
    /// Queue partition this request belongs to
    pub queue_key: QueueKey,
    /// Lowercased host of the intercepted request
    pub host: String,
    /// HTTP method of the intercepted request
    pub method: String,
    /// Headers of the intercepted request
    pub headers: HeaderMap,
    /// Raw JSON body of the intercepted request
    pub body: Option<Bytes>,
    /// Adapter owning this request
    pub provider: Arc<dyn Provider>,
    /// Cache fingerprint
    pub fingerprint: String,
    /// Completion handle the caller is awaiting
    pub reply: CompletionHandle,
}

impl PendingRequest {
    /// The adapter-facing view of this request.
    pub fn provider_request(&self) -> ProviderRequest {
        ProviderRequest {
            custom_id: self.custom_id.clone(),
            method: self.method.clone(),
            host: self.host.clone(),
            endpoint: self.queue_key.endpoint.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Whether the caller has dropped its handle while the request was
    /// still queued.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Complete the caller's handle. A send failure only means the caller
    /// went away, which is not this side's problem.
    pub fn complete(self, result: Result<HttpResponse>) {
        let _ = self.reply.send(result);
    }
}

/// Pending requests for one queue key.
///
/// While non-empty, exactly one window timer is scheduled for it; the
/// handle lives here so draining can cancel it.
#[derive(Default)]
pub(crate) struct Queue {
    pub requests: Vec<PendingRequest>,
    pub window: Option<AbortHandle>,
}

/// A batch that has been submitted and is being polled.
pub(crate) struct ActiveBatch {
    pub batch_id: String,
    /// custom_id -> pending request
    pub requests: HashMap<String, PendingRequest>,
}

/// Key for resumed cache-hit polling: `(provider, host, batch_id)`.
pub(crate) type ResumeKey = (String, String, String);

/// A pending request attached to a resumed provider batch.
pub(crate) struct ResumedPending {
    pub fingerprint: String,
    pub reply: CompletionHandle,
}

/// Resumed cache-hit batch polled by batch id.
///
/// Multiple intercepted requests with the same fingerprint attach to the
/// same entry; only one poller runs per key.
pub(crate) struct ResumedBatch {
    pub provider: Arc<dyn Provider>,
    pub context: ResumeContext,
    /// custom_id -> attached requests
    pub requests: HashMap<String, Vec<ResumedPending>>,
}
