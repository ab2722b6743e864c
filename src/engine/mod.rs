//! Batching engine: per-key queues, window/size triggers, submission,
//! polling, and fan-out of per-request results.
//!
//! The engine collects intercepted requests over a time window or until a
//! size threshold, submits them as provider batches, polls each batch to a
//! terminal state and completes every caller's one-shot handle with its
//! decoded response. Queues are partitioned by `(provider, endpoint, model)`
//! because provider batch APIs refuse mixed models or endpoints in a single
//! batch.

use crate::cache::{CacheEntry, RequestCacheStore, CACHE_RETENTION_DAYS};
use crate::error::{BatchlingError, Result};
use crate::fingerprint;
use crate::hook::{CACHE_HIT_HEADER, DRY_RUN_HEADER};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::providers::{
    self, BatchSubmission, PollSnapshot, Provider, ProviderRequest, QueueKey,
};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod types;

use types::{
    ActiveBatch, PendingRequest, Queue, ResumeKey, ResumedBatch, ResumedPending,
};

/// Configuration for the batching engine.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Submit a batch when this many requests are queued for one key
    pub batch_size: usize,

    /// Submit a queue's batch after this long, even if the size threshold
    /// was not reached
    pub batch_window: Duration,

    /// Gap between poll attempts per batch
    pub poll_interval: Duration,

    /// Skip provider submission and polling; synthesize 200 responses
    pub dry_run: bool,

    /// Enable persistent request-cache lookup and writeback
    pub cache: bool,

    /// Explicit cache database path (defaults to the user cache directory)
    pub cache_path: Option<PathBuf>,

    /// Permit idle-based early exit while only polling work remains
    pub deferred: bool,

    /// Idle threshold before deferred mode triggers the early exit
    pub deferred_idle: Duration,

    /// How long `close` waits for outstanding pollers before abandoning
    /// them. Defaults to the provider completion window.
    pub close_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_window: Duration::from_secs_f64(2.0),
            poll_interval: Duration::from_secs_f64(10.0),
            dry_run: false,
            cache: true,
            cache_path: None,
            deferred: false,
            deferred_idle: Duration::from_secs_f64(60.0),
            close_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The batching engine.
///
/// Holds the per-key pending queues, the active and resumed batch pollers
/// and the request cache. Obtained only through [`crate::batchify`]; the
/// interception hook is its sole caller.
pub struct Batcher {
    config: BatcherConfig,
    transport: Arc<dyn HttpClient>,
    queues: Mutex<HashMap<QueueKey, Queue>>,
    resumed: DashMap<ResumeKey, ResumedBatch>,
    cache_store: Option<RequestCacheStore>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    deferred_exit: CancellationToken,
    last_activity: parking_lot::Mutex<Instant>,
    unresolved_batches: Arc<AtomicUsize>,
}

impl Batcher {
    /// Create an engine. The cache store is opened eagerly; failure to open
    /// it disables caching rather than failing the scope.
    pub async fn new(config: BatcherConfig, transport: Arc<dyn HttpClient>) -> Arc<Self> {
        let cache_store = if config.cache {
            match RequestCacheStore::open(config.cache_path.as_deref()).await {
                Ok(store) => Some(store),
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        "Failed to initialize cache store; disabling cache"
                    );
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(
            batch_size = config.batch_size,
            batch_window = ?config.batch_window,
            poll_interval = ?config.poll_interval,
            dry_run = config.dry_run,
            cache_enabled = cache_store.is_some(),
            deferred = config.deferred,
            "Initialized batcher"
        );

        let engine = Arc::new(Self {
            config,
            transport,
            queues: Mutex::new(HashMap::new()),
            resumed: DashMap::new(),
            cache_store,
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            deferred_exit: CancellationToken::new(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            unresolved_batches: Arc::new(AtomicUsize::new(0)),
        });
        if engine.config.deferred {
            engine.spawn_deferred_watchdog();
        }
        engine
    }

    /// Token fired when the deferred idle threshold is reached.
    /// `None` unless deferred mode is enabled.
    pub fn deferred_signal(&self) -> Option<CancellationToken> {
        self.config.deferred.then(|| self.deferred_exit.clone())
    }

    /// Queue a request for batching and return its resolved response.
    ///
    /// This is the only method the interception hook calls. It resolves
    /// with the provider's per-request response (success or error
    /// envelope), a dry-run synthetic response, or an engine error.
    #[tracing::instrument(skip_all, fields(provider = provider.name(), method = %request.method, url = %request.url))]
    pub async fn submit(
        self: &Arc<Self>,
        provider: Arc<dyn Provider>,
        request: HttpRequest,
    ) -> Result<HttpResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BatchlingError::EngineClosed);
        }
        self.touch_activity();

        let host = request.host();
        let endpoint = request.path();
        let body = request.body.clone();
        let model = provider.extract_model(&endpoint, body.as_deref())?;
        let queue_key = QueueKey {
            provider: provider.name().to_string(),
            endpoint: endpoint.clone(),
            model,
        };
        let request_hash = fingerprint::request_fingerprint(&queue_key, &host, body.as_deref())?;

        if let Some(entry) = self.cache_lookup(&request_hash).await {
            // A hit is only honored when the row still belongs to the
            // adapter that owns this request.
            if entry.provider == provider.name() && entry.host == host {
                tracing::info!(
                    queue_key = %queue_key,
                    batch_id = %entry.batch_id,
                    custom_id = %entry.custom_id,
                    "Cache hit for intercepted request"
                );
                if self.config.dry_run {
                    return Ok(self.dry_run_response(&entry.custom_id, provider.name(), true));
                }
                let (reply, handle) = oneshot::channel();
                match self
                    .attach_resumed(
                        provider.clone(),
                        &host,
                        &request.headers,
                        &entry,
                        request_hash.clone(),
                        reply,
                    )
                    .await
                {
                    Ok(()) => match handle.await {
                        Ok(Ok(response)) => return Ok(response),
                        Ok(Err(error)) => {
                            tracing::info!(
                                batch_id = %entry.batch_id,
                                error = %error,
                                "Cache route failed; falling back to fresh batch submission"
                            );
                            self.invalidate_fingerprints(std::slice::from_ref(&request_hash))
                                .await;
                        }
                        Err(_) => return Err(BatchlingError::EngineClosed),
                    },
                    Err(error) => {
                        tracing::warn!(
                            batch_id = %entry.batch_id,
                            error = %error,
                            "Could not build resume context; submitting fresh"
                        );
                    }
                }
            } else {
                tracing::debug!(
                    queue_key = %queue_key,
                    row_provider = %entry.provider,
                    row_host = %entry.host,
                    "Ignoring stale cache row with provider/host mismatch"
                );
            }
        }

        let (reply, handle) = oneshot::channel();
        let pending = PendingRequest {
            custom_id: Uuid::new_v4().to_string(),
            queue_key,
            host,
            method: request.method.clone(),
            headers: request.headers.clone(),
            body,
            provider,
            fingerprint: request_hash,
            reply,
        };
        self.enqueue(pending).await;

        match handle.await {
            Ok(result) => result,
            // Sender dropped without a result: the engine abandoned this
            // request (close timeout or task teardown).
            Err(_) => Err(BatchlingError::EngineClosed),
        }
    }

    /// Flush all queues, await outstanding pollers up to the configured
    /// timeout, and cancel timers. Intake afterwards fails with
    /// `EngineClosed`.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<(QueueKey, Vec<PendingRequest>)> = {
            let mut queues = self.queues.lock().await;
            let keys: Vec<QueueKey> = queues.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| {
                    let requests = Self::drain_locked(&mut queues, &key);
                    (!requests.is_empty()).then_some((key, requests))
                })
                .collect()
        };
        for (key, requests) in drained {
            tracing::info!(
                queue_key = %key,
                request_count = requests.len(),
                "Submitting final batch on close"
            );
            self.spawn_submission(key, requests).await;
        }

        let mut tasks = self.tasks.lock().await;

        if self.deferred_exit.is_cancelled() {
            // Deferred exit abandons pollers on purpose; the next run
            // resumes them from cache.
            self.shutdown.cancel();
            tasks.shutdown().await;
            tracing::debug!("Batcher closed (deferred)");
            return;
        }

        let waited = tokio::time::timeout(self.config.close_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(error) = result
                    && !error.is_cancelled()
                {
                    tracing::error!(error = %error, "Engine task panicked");
                }
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!(
                close_timeout = ?self.config.close_timeout,
                "Engine close timed out; abandoning outstanding pollers"
            );
        }
        self.shutdown.cancel();
        tasks.shutdown().await;
        tracing::debug!("Batcher closed");
    }

    // ------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------

    async fn enqueue(self: &Arc<Self>, pending: PendingRequest) {
        let key = pending.queue_key.clone();
        tracing::debug!(
            queue_key = %key,
            custom_id = %pending.custom_id,
            "Queued request for batch"
        );
        let drained = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(key.clone()).or_default();
            queue.requests.push(pending);
            let pending_count = queue.requests.len();
            tracing::debug!(queue_key = %key, pending_count, "Pending queue updated");

            if pending_count == 1 {
                tracing::debug!(
                    queue_key = %key,
                    batch_window = ?self.config.batch_window,
                    "Starting batch window timer"
                );
                queue.window = Some(self.spawn_window_timer(key.clone()));
            }

            if pending_count >= self.config.batch_size {
                tracing::debug!(
                    queue_key = %key,
                    batch_size = self.config.batch_size,
                    "Batch size reached"
                );
                Self::drain_locked(&mut queues, &key)
            } else {
                Vec::new()
            }
        };
        if !drained.is_empty() {
            self.spawn_submission(key, drained).await;
        }
    }

    /// Remove a queue from the map and cancel its window timer.
    fn drain_locked(
        queues: &mut HashMap<QueueKey, Queue>,
        key: &QueueKey,
    ) -> Vec<PendingRequest> {
        let Some(queue) = queues.remove(key) else {
            return Vec::new();
        };
        if let Some(window) = queue.window {
            window.abort();
        }
        tracing::debug!(queue_key = %key, drained_count = queue.requests.len(), "Drained queue");
        queue.requests
    }

    fn spawn_window_timer(self: &Arc<Self>, key: QueueKey) -> AbortHandle {
        let engine = self.clone();
        tokio::spawn(async move { engine.window_fire(key).await }).abort_handle()
    }

    /// Trigger submission after the window elapses. The timer never aborts
    /// itself: it takes the queue directly, so only size triggers and close
    /// use the abort handle.
    async fn window_fire(self: Arc<Self>, key: QueueKey) {
        tokio::time::sleep(self.config.batch_window).await;
        let drained = {
            let mut queues = self.queues.lock().await;
            queues.remove(&key).map(|q| q.requests).unwrap_or_default()
        };
        if drained.is_empty() {
            tracing::debug!(queue_key = %key, "Batch window elapsed with empty queue");
            return;
        }
        tracing::debug!(queue_key = %key, "Batch window elapsed, submitting batch");
        self.spawn_submission(key, drained).await;
    }

    async fn spawn_submission(self: &Arc<Self>, key: QueueKey, requests: Vec<PendingRequest>) {
        tracing::info!(
            queue_key = %key,
            request_count = requests.len(),
            "Submitting batch"
        );
        let engine = self.clone();
        self.tasks
            .lock()
            .await
            .spawn(async move { engine.process_batch(key, requests).await });
    }

    // ------------------------------------------------------------------
    // Submission and polling
    // ------------------------------------------------------------------

    async fn process_batch(self: Arc<Self>, key: QueueKey, mut requests: Vec<PendingRequest>) {
        self.touch_activity();
        requests.retain(|request| {
            if request.is_abandoned() {
                tracing::debug!(
                    queue_key = %key,
                    custom_id = %request.custom_id,
                    "Dropping cancelled request before submission"
                );
                false
            } else {
                true
            }
        });
        if requests.is_empty() {
            return;
        }

        if self.config.dry_run {
            let batch_id = format!("dryrun-{}", Uuid::new_v4());
            let request_count = requests.len();
            for request in requests {
                let response = self.dry_run_response(&request.custom_id, &key.provider, false);
                request.complete(Ok(response));
            }
            tracing::info!(
                queue_key = %key,
                batch_id = %batch_id,
                request_count,
                "Dry-run batch resolved"
            );
            return;
        }

        let provider = requests[0].provider.clone();
        let provider_requests: Vec<ProviderRequest> = requests
            .iter()
            .map(PendingRequest::provider_request)
            .collect();

        match provider
            .submit(&provider_requests, &key, self.transport.as_ref())
            .await
        {
            Ok(submission) => {
                tracing::debug!(
                    queue_key = %key,
                    batch_id = %submission.batch_id,
                    base_url = %submission.base_url,
                    "Provider batch submitted"
                );
                self.write_cache_entries(&key, &requests, &submission.batch_id)
                    .await;

                let batch = ActiveBatch {
                    batch_id: submission.batch_id.clone(),
                    requests: requests
                        .into_iter()
                        .map(|request| (request.custom_id.clone(), request))
                        .collect(),
                };
                let counter = self.unresolved_batches.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                let _open = scopeguard::guard(counter, |counter| {
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
                self.poll_active(provider, submission, batch).await;
            }
            Err(error) => {
                tracing::error!(
                    queue_key = %key,
                    error = %error,
                    "Batch submission failed"
                );
                for request in requests {
                    request.complete(Err(error.replicate()));
                }
            }
        }
    }

    async fn poll_once(
        &self,
        provider: &dyn Provider,
        base_url: &str,
        api_headers: &HeaderMap,
        batch_id: &str,
    ) -> Result<PollSnapshot> {
        let spec = provider.poll_spec(api_headers, batch_id);
        let response = providers::execute_spec(self.transport.as_ref(), base_url, &spec).await?;
        Ok(provider.parse_poll(&response.json_body()?))
    }

    async fn poll_active(
        &self,
        provider: Arc<dyn Provider>,
        submission: BatchSubmission,
        mut batch: ActiveBatch,
    ) {
        tracing::info!(
            provider = provider.name(),
            batch_id = %batch.batch_id,
            poll_interval = ?self.config.poll_interval,
            "Polling batch"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(batch_id = %batch.batch_id, "Poller stopped by engine shutdown");
                    return;
                }
            }
            let snapshot = match self
                .poll_once(
                    provider.as_ref(),
                    &submission.base_url,
                    &submission.api_headers,
                    &batch.batch_id,
                )
                .await
            {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    // Transient poll failures never fail the batch; the
                    // provider keeps cooking and expiration is the backstop.
                    tracing::warn!(
                        batch_id = %batch.batch_id,
                        error = %error,
                        "Batch poll failed; will retry"
                    );
                    continue;
                }
            };
            tracing::debug!(
                batch_id = %batch.batch_id,
                status = %snapshot.status,
                has_output_file = !snapshot.output_file_id.is_empty(),
                has_error_file = !snapshot.error_file_id.is_empty(),
                "Batch poll tick"
            );
            if provider
                .terminal_states()
                .iter()
                .any(|state| *state == snapshot.status)
            {
                tracing::info!(
                    batch_id = %batch.batch_id,
                    status = %snapshot.status,
                    "Batch reached terminal state"
                );
                self.touch_activity();
                self.resolve_active(provider.as_ref(), &submission, &mut batch, &snapshot)
                    .await;
                return;
            }
        }
    }

    async fn resolve_active(
        &self,
        provider: &dyn Provider,
        submission: &BatchSubmission,
        batch: &mut ActiveBatch,
        snapshot: &PollSnapshot,
    ) {
        let batch_id = batch.batch_id.clone();
        let file_id = pick_file_id(snapshot);
        let spec = match provider.results_spec(&submission.api_headers, file_id, &batch_id) {
            Ok(spec) => spec,
            Err(error) => {
                tracing::error!(
                    batch_id = %batch_id,
                    error = %error,
                    "Batch resolved without output file"
                );
                for (_, request) in batch.requests.drain() {
                    request.complete(Err(error.replicate()));
                }
                return;
            }
        };
        tracing::info!(
            batch_id = %batch_id,
            results_path = %spec.path,
            "Downloading batch results"
        );
        let content = match providers::execute_spec(
            self.transport.as_ref(),
            &submission.base_url,
            &spec,
        )
        .await
        {
            Ok(response) => response.text(),
            Err(error) => {
                tracing::error!(
                    batch_id = %batch_id,
                    error = %error,
                    "Failed to download batch results"
                );
                for (_, request) in batch.requests.drain() {
                    request.complete(Err(error.replicate()));
                }
                return;
            }
        };

        let mut responses = provider.decode_results(&batch_id, &content);
        let request_count = batch.requests.len();
        let mut resolved_count = 0usize;
        let mut missing_fingerprints = Vec::new();
        for (custom_id, request) in batch.requests.drain() {
            match responses.remove(&custom_id) {
                Some(response) => {
                    resolved_count += 1;
                    request.complete(Ok(response));
                }
                None => {
                    missing_fingerprints.push(request.fingerprint.clone());
                    request.complete(Err(BatchlingError::ProviderIncomplete {
                        batch_id: batch_id.clone(),
                        state: snapshot.status.clone(),
                    }));
                }
            }
        }
        tracing::info!(
            batch_id = %batch_id,
            resolved_count,
            request_count,
            "Mapped batch results to output requests"
        );
        if !missing_fingerprints.is_empty() {
            tracing::error!(
                batch_id = %batch_id,
                missing_count = missing_fingerprints.len(),
                "Missing batch results"
            );
            self.invalidate_fingerprints(&missing_fingerprints).await;
        }
    }

    // ------------------------------------------------------------------
    // Resumed batches (cache fast-path)
    // ------------------------------------------------------------------

    async fn attach_resumed(
        self: &Arc<Self>,
        provider: Arc<dyn Provider>,
        host: &str,
        headers: &HeaderMap,
        entry: &CacheEntry,
        fingerprint: String,
        reply: types::CompletionHandle,
    ) -> Result<()> {
        let key: ResumeKey = (
            provider.name().to_string(),
            host.to_string(),
            entry.batch_id.clone(),
        );
        let pending = ResumedPending { fingerprint, reply };
        let start_poller = match self.resumed.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied
                    .get_mut()
                    .requests
                    .entry(entry.custom_id.clone())
                    .or_default()
                    .push(pending);
                false
            }
            Entry::Vacant(vacant) => {
                let context = provider.resume_context(host, headers)?;
                let mut requests: HashMap<String, Vec<ResumedPending>> = HashMap::new();
                requests.insert(entry.custom_id.clone(), vec![pending]);
                vacant.insert(ResumedBatch {
                    provider,
                    context,
                    requests,
                });
                true
            }
        };
        if start_poller {
            let engine = self.clone();
            self.tasks
                .lock()
                .await
                .spawn(async move { engine.poll_resumed(key).await });
        }
        Ok(())
    }

    async fn poll_resumed(self: Arc<Self>, key: ResumeKey) {
        let counter = self.unresolved_batches.clone();
        counter.fetch_add(1, Ordering::SeqCst);
        let _open = scopeguard::guard(counter, |counter| {
            counter.fetch_sub(1, Ordering::SeqCst);
        });

        let Some((provider, context)) = self
            .resumed
            .get(&key)
            .map(|batch| (batch.provider.clone(), batch.context.clone()))
        else {
            return;
        };
        let batch_id = key.2.clone();
        tracing::info!(
            provider = provider.name(),
            host = %key.1,
            batch_id = %batch_id,
            "Polling resumed cached batch"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown.cancelled() => return,
            }
            match self
                .poll_once(
                    provider.as_ref(),
                    &context.base_url,
                    &context.api_headers,
                    &batch_id,
                )
                .await
            {
                Ok(snapshot) => {
                    tracing::debug!(
                        batch_id = %batch_id,
                        status = %snapshot.status,
                        "Resumed batch poll tick"
                    );
                    if provider
                        .terminal_states()
                        .iter()
                        .any(|state| *state == snapshot.status)
                    {
                        self.touch_activity();
                        self.resolve_resumed(&key, provider.as_ref(), &snapshot).await;
                        return;
                    }
                }
                Err(error) => {
                    // A resumed batch that can't be polled is stale: fail the
                    // attached handles and drop the cache rows so the callers
                    // fall back to a fresh submission.
                    tracing::warn!(
                        batch_id = %batch_id,
                        error = %error,
                        "Resumed batch poll failed"
                    );
                    self.fail_resumed(&key, &error).await;
                    return;
                }
            }
        }
    }

    async fn resolve_resumed(
        &self,
        key: &ResumeKey,
        provider: &dyn Provider,
        snapshot: &PollSnapshot,
    ) {
        let Some((_, batch)) = self.resumed.remove(key) else {
            return;
        };
        let batch_id = &key.2;
        let file_id = pick_file_id(snapshot);
        let spec = match provider.results_spec(&batch.context.api_headers, file_id, batch_id) {
            Ok(spec) => spec,
            Err(error) => {
                let stale = fail_resumed_batch(batch, &error);
                self.invalidate_fingerprints(&stale).await;
                return;
            }
        };
        let content = match providers::execute_spec(
            self.transport.as_ref(),
            &batch.context.base_url,
            &spec,
        )
        .await
        {
            Ok(response) => response.text(),
            Err(error) => {
                let stale = fail_resumed_batch(batch, &error);
                self.invalidate_fingerprints(&stale).await;
                return;
            }
        };

        let responses = provider.decode_results(batch_id, &content);
        let mut missing_fingerprints = Vec::new();
        for (custom_id, pending_requests) in batch.requests {
            match responses.get(&custom_id) {
                Some(response) => {
                    for pending in pending_requests {
                        let _ = pending.reply.send(Ok(response.clone()));
                    }
                }
                None => {
                    for pending in pending_requests {
                        missing_fingerprints.push(pending.fingerprint.clone());
                        let _ = pending.reply.send(Err(BatchlingError::ProviderIncomplete {
                            batch_id: batch_id.clone(),
                            state: snapshot.status.clone(),
                        }));
                    }
                }
            }
        }
        if !missing_fingerprints.is_empty() {
            self.invalidate_fingerprints(&missing_fingerprints).await;
        }
    }

    async fn fail_resumed(&self, key: &ResumeKey, error: &BatchlingError) {
        let Some((_, batch)) = self.resumed.remove(key) else {
            return;
        };
        let stale = fail_resumed_batch(batch, error);
        self.invalidate_fingerprints(&stale).await;
    }

    // ------------------------------------------------------------------
    // Cache plumbing
    // ------------------------------------------------------------------

    async fn cache_lookup(&self, request_hash: &str) -> Option<CacheEntry> {
        let store = self.cache_store.as_ref()?;
        match store.get_by_hash(request_hash).await {
            Ok(hit) => {
                if hit.is_none() {
                    tracing::debug!("Cache miss for intercepted request");
                }
                hit
            }
            Err(error) => {
                tracing::warn!(error = %error, "Cache lookup failed");
                None
            }
        }
    }

    async fn write_cache_entries(
        &self,
        key: &QueueKey,
        requests: &[PendingRequest],
        batch_id: &str,
    ) {
        if self.config.dry_run {
            return;
        }
        let Some(store) = &self.cache_store else {
            return;
        };
        let created_at = Utc::now();
        let entries: Vec<CacheEntry> = requests
            .iter()
            .map(|request| CacheEntry {
                request_hash: request.fingerprint.clone(),
                provider: key.provider.clone(),
                endpoint: key.endpoint.clone(),
                model: key.model.clone(),
                host: request.host.clone(),
                batch_id: batch_id.to_string(),
                custom_id: request.custom_id.clone(),
                created_at,
            })
            .collect();
        match store.upsert_many(&entries).await {
            Ok(upserted) => {
                let cutoff = created_at - ChronoDuration::days(CACHE_RETENTION_DAYS);
                let pruned = match store.delete_older_than(cutoff).await {
                    Ok(count) => count,
                    Err(error) => {
                        tracing::warn!(error = %error, "Cache retention pruning failed");
                        0
                    }
                };
                tracing::debug!(
                    queue_key = %key,
                    batch_id = %batch_id,
                    upserted_rows = upserted,
                    cleaned_rows = pruned,
                    "Persisted submitted batch requests to cache"
                );
            }
            Err(error) => {
                tracing::warn!(
                    batch_id = %batch_id,
                    error = %error,
                    "Failed to persist cache rows"
                );
            }
        }
    }

    async fn invalidate_fingerprints(&self, request_hashes: &[String]) {
        if self.config.dry_run || request_hashes.is_empty() {
            return;
        }
        let Some(store) = &self.cache_store else {
            return;
        };
        match store.delete_by_hashes(request_hashes).await {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted_rows = deleted, "Invalidated stale cache rows");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(error = %error, "Cache invalidation failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Dry run and deferred mode
    // ------------------------------------------------------------------

    fn dry_run_response(
        &self,
        custom_id: &str,
        provider_name: &str,
        cache_hit: bool,
    ) -> HttpResponse {
        let mut response = HttpResponse::json(
            200,
            &serde_json::json!({
                "dry_run": true,
                "custom_id": custom_id,
                "provider": provider_name,
                "status": "simulated",
                "cache_hit": cache_hit,
            }),
        );
        response.headers.insert(
            HeaderName::from_static(DRY_RUN_HEADER),
            HeaderValue::from_static("1"),
        );
        response.headers.insert(
            HeaderName::from_static(CACHE_HIT_HEADER),
            HeaderValue::from_static(if cache_hit { "1" } else { "0" }),
        );
        response
    }

    fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Watch for the idle condition: unresolved batch work exists, the
    /// queues are empty, and nothing but polling has happened for the
    /// configured threshold.
    fn spawn_deferred_watchdog(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if engine.unresolved_batches.load(Ordering::SeqCst) == 0 {
                            continue;
                        }
                        if !engine.queues.lock().await.is_empty() {
                            continue;
                        }
                        let idle = engine.last_activity.lock().elapsed();
                        if idle >= engine.config.deferred_idle {
                            tracing::info!(
                                idle = ?idle,
                                deferred_idle = ?engine.config.deferred_idle,
                                "Deferred idle threshold reached; stopping active polling"
                            );
                            engine.deferred_exit.cancel();
                            return;
                        }
                    }
                    _ = engine.shutdown.cancelled() => return,
                }
            }
        });
    }
}

fn pick_file_id(snapshot: &PollSnapshot) -> Option<&str> {
    if !snapshot.output_file_id.is_empty() {
        Some(snapshot.output_file_id.as_str())
    } else if !snapshot.error_file_id.is_empty() {
        Some(snapshot.error_file_id.as_str())
    } else {
        None
    }
}

/// Fail every handle attached to a resumed batch, returning the
/// fingerprints whose cache rows should be invalidated.
fn fail_resumed_batch(batch: ResumedBatch, error: &BatchlingError) -> Vec<String> {
    let mut fingerprints = Vec::new();
    for pending_requests in batch.requests.into_values() {
        for pending in pending_requests {
            fingerprints.push(pending.fingerprint.clone());
            let _ = pending.reply.send(Err(error.replicate()));
        }
    }
    fingerprints
}
