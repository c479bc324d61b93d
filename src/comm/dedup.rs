use async_trait::async_trait;
use moka::future::Cache;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::protocol::{Envelope, Reply};
use super::transport::EnvelopeHandler;
use crate::errors::CommunicationError;

/// Bounded window of recently seen request ids.
///
/// Request/response calls are executed at most once per id while the id is
/// in the window, and redeliveries receive the first reply. One-way calls are
/// admitted once and suppressed afterwards.
#[derive(Debug, Clone)]
pub struct RequestWindow {
    replies: Cache<String, Reply>,
    seen: Cache<String, ()>,
    suppressed: Arc<AtomicU64>,
}

impl RequestWindow {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            replies: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            seen: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            suppressed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns `true` the first time `request_id` is seen.
    pub async fn admit(&self, request_id: &str) -> bool {
        let fresh = self
            .seen
            .entry(request_id.to_string())
            .or_insert(())
            .await
            .is_fresh();
        if !fresh {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Runs `work` unless a reply for `request_id` is already cached.
    ///
    /// Concurrent calls with the same id share a single execution. Failures
    /// are not cached, so a failed request can be delivered again.
    pub async fn execute_once<F>(&self, request_id: &str, work: F) -> Result<Reply, CommunicationError>
    where
        F: Future<Output = Result<Reply, CommunicationError>>,
    {
        let executed = AtomicBool::new(false);
        let result = self
            .replies
            .try_get_with(request_id.to_string(), async {
                executed.store(true, Ordering::Relaxed);
                work.await
            })
            .await;

        if !executed.load(Ordering::Relaxed) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(request_id, "Replaying cached reply");
        }

        result.map_err(|e| (*e).clone())
    }

    /// Routes an envelope through the window before it reaches `handler`.
    pub async fn dispatch(
        &self,
        handler: &dyn EnvelopeHandler,
        envelope: Envelope,
    ) -> Result<Reply, CommunicationError> {
        let request_id = envelope.request_id.clone();
        if envelope.payload.is_one_way() {
            if !self.admit(&request_id).await {
                debug!(request_id = %request_id, kind = envelope.payload.kind(), "Duplicate delivery suppressed");
                return Err(CommunicationError::DuplicateSuppressed { request_id });
            }
            return handler.handle(envelope).await;
        }

        self.execute_once(&request_id, handler.handle(envelope)).await
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl Default for RequestWindow {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(300))
    }
}

/// An [`EnvelopeHandler`] that filters redeliveries through a [`RequestWindow`].
pub struct Deduplicated {
    window: RequestWindow,
    inner: Arc<dyn EnvelopeHandler>,
}

impl Deduplicated {
    pub fn new(window: RequestWindow, inner: Arc<dyn EnvelopeHandler>) -> Self {
        Self { window, inner }
    }
}

#[async_trait]
impl EnvelopeHandler for Deduplicated {
    async fn handle(&self, envelope: Envelope) -> Result<Reply, CommunicationError> {
        self.window.dispatch(self.inner.as_ref(), envelope).await
    }
}
