//! Batching scope: the ambient binding between the hook and an engine.
//!
//! Entering a scope publishes an engine into a process-ambient slot the
//! hook reads on every request; exiting restores whatever was there before
//! and closes the engine. The slot is process-ambient rather than
//! task-local so every task spawned inside the scope, including ones
//! spawned by library code, observes the same active engine.

use crate::engine::{Batcher, BatcherConfig};
use crate::error::{BatchlingError, Result};
use crate::hook;
use crate::http::HttpClient;
use arc_swap::ArcSwapOption;
use std::future::Future;
use std::sync::Arc;

static ACTIVE_ENGINE: ArcSwapOption<Batcher> = ArcSwapOption::const_empty();

/// The engine bound to the current scope, if any. Read by the hook on
/// every intercepted request.
pub(crate) fn current_engine() -> Option<Arc<Batcher>> {
    ACTIVE_ENGINE.load_full()
}

/// Guard that publishes an engine on construction and restores the
/// previous binding on drop. Nesting installs the inner engine and gives
/// the outer one back on exit.
struct ScopeGuard {
    previous: Option<Arc<Batcher>>,
}

impl ScopeGuard {
    fn publish(engine: Arc<Batcher>) -> Self {
        let previous = ACTIVE_ENGINE.swap(Some(engine));
        Self { previous }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_ENGINE.store(self.previous.take());
    }
}

/// A configured batching scope, created by [`batchify`].
///
/// Driving a future through [`run`](Self::run) activates batching for
/// every request the future (and anything it spawns) issues through the
/// hooked client. The engine itself is never handed to the caller.
pub struct BatchingContext {
    config: BatcherConfig,
    transport: Option<Arc<dyn HttpClient>>,
}

impl BatchingContext {
    /// Route engine traffic through a specific transport instead of the
    /// shared hooked client. Used by tests to script provider behavior.
    pub fn with_transport(mut self, transport: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run a future inside the batching scope.
    ///
    /// The engine is constructed, published for the duration of the
    /// future, then unpublished and closed - queues drained, pollers
    /// finished, timers cancelled - whether or not the future succeeded.
    /// In deferred mode the future races the deferred-exit signal; when
    /// the signal wins, the scope closes and returns
    /// [`BatchlingError::DeferredExit`] so the caller can exit with
    /// success and resume from cache on the next run.
    pub async fn run<F, T>(self, future: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let transport = self
            .transport
            .unwrap_or_else(crate::hook::shared_client);
        let engine = Batcher::new(self.config, transport).await;
        let deferred = engine.deferred_signal();

        let outcome = {
            let _scope = ScopeGuard::publish(engine.clone());
            match deferred {
                Some(signal) => {
                    tokio::select! {
                        value = future => Some(value),
                        _ = signal.cancelled() => None,
                    }
                }
                None => Some(future.await),
            }
            // _scope drops here: the previous binding is restored before
            // the engine is closed, so close-time provider traffic never
            // sees a half-dead engine.
        };

        engine.close().await;

        match outcome {
            Some(value) => Ok(value),
            None => Err(BatchlingError::DeferredExit),
        }
    }
}

/// Construct a batching scope.
///
/// Installs the HTTP hook on first use anywhere in the process; later
/// scopes reuse it. This is the only way to obtain an engine.
///
/// ```no_run
/// use batchling::{batchify, BatcherConfig};
///
/// # async fn example() -> batchling::Result<()> {
/// batchify(BatcherConfig {
///     batch_size: 100,
///     ..Default::default()
/// })
/// .run(async {
///     // every batchable request issued in here is grouped, submitted
///     // through the provider's batch API, and resolved transparently
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub fn batchify(config: BatcherConfig) -> BatchingContext {
    hook::install_hooks();
    BatchingContext {
        config,
        transport: None,
    }
}
