//! Request worker pool: bounded concurrency fan-out over a stream of
//! payloads, with cooperative cancellation on a consecutive-failure ceiling.
//!
//! Grounded in the donor's `core.rs::process_chunk`, which drives a batch of
//! domains through `futures::stream::iter(..).buffer_unordered(limit)`; this
//! module generalizes that to an open-ended payload stream fed from a
//! channel rather than one pre-loaded `Vec`, and adds the cancellation token
//! the donor doesn't need (MDI checks never abort a whole batch on
//! consecutive failures).
//!
//! The pool itself only produces [`RawHTTPResponseDetails`] on an output
//! channel — it has no idea what a findings store is. [`WorkerPool::run`] is
//! a thin convenience wrapper that drains that channel and forwards each
//! result to a [`FindingsSink`], but callers who want to do something else
//! with completed responses (filter them, batch them, fan them to more than
//! one place) should drive [`WorkerPool::process_requests`] directly.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::error::DoRequestError;
use crate::http_client::{ErrorSink, HttpClient};
use crate::payload::BypassPayload;
use crate::response::{process_response, DetailsPool, RawHTTPResponseDetails};
use crate::sinks::{Finding, FindingsSink};

/// Lock-free progress counters a caller can sample while a run is in
/// flight (exposed for a future `--stats` flag; not itself a CLI concern).
#[derive(Default)]
pub struct PoolStats {
    pub submitted: AtomicUsize,
    pub completed: AtomicUsize,
    pub active: AtomicUsize,
    pub failed: AtomicUsize,
    started_at: std::sync::OnceLock<Instant>,
    total_response_ms: AtomicU64,
}

impl PoolStats {
    fn mark_started(&self) {
        let _ = self.started_at.set(Instant::now());
    }

    /// Requests completed per second since the pool started, `0.0` before
    /// the first response lands.
    pub fn average_rate(&self) -> f64 {
        let Some(start) = self.started_at.get() else { return 0.0 };
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.completed.load(Ordering::Relaxed) as f64 / elapsed
    }
}

/// Drives a stream of [`BypassPayload`]s through an [`HttpClient`] with
/// bounded concurrency, streaming each completed [`RawHTTPResponseDetails`]
/// out on a channel and aborting the whole run if the client reports
/// [`DoRequestError::MaxConsecutiveFailuresReached`].
pub struct WorkerPool {
    client: Arc<HttpClient>,
    config: PoolConfig,
    cancel: CancellationToken,
    stats: Arc<PoolStats>,
    details_pool: Arc<DetailsPool>,
    next_id: AtomicU64,
    cancel_logged: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(client: Arc<HttpClient>, config: PoolConfig) -> Self {
        Self {
            client,
            config,
            cancel: CancellationToken::new(),
            stats: Arc::new(PoolStats::default()),
            details_pool: Arc::new(DetailsPool::new()),
            next_id: AtomicU64::new(0),
            cancel_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    /// Cooperative cancellation handle: callers external to the pool (e.g.
    /// a Ctrl-C handler) may also trigger it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns a processed [`RawHTTPResponseDetails`] to the pool's reuse
    /// freelist. Callers draining [`process_requests`](Self::process_requests)
    /// directly must call this once they're done reading a result, mirroring
    /// what [`run`](Self::run) does internally.
    pub fn release_details(&self, details: RawHTTPResponseDetails) {
        self.details_pool.release(details);
    }

    /// Feeds `payloads` through the pool with `self.config.max_concurrent`
    /// requests in flight at once, sending one [`RawHTTPResponseDetails`] per
    /// successful response on the returned channel. The channel is closed
    /// exactly once, after every in-flight request has settled or the run
    /// was cancelled — whichever comes first.
    ///
    /// Ownership of each `RawHTTPResponseDetails` passes to whoever receives
    /// it; the receiver is responsible for returning it via
    /// [`release_details`](Self::release_details) once done with it.
    pub fn process_requests(
        &self,
        payloads: Vec<BypassPayload>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> mpsc::Receiver<RawHTTPResponseDetails> {
        self.stats.mark_started();
        self.stats.submitted.fetch_add(payloads.len(), Ordering::Relaxed);

        let (in_tx, in_rx) = mpsc::channel::<BypassPayload>(self.config.channel_capacity);
        let feeder_cancel = self.cancel.clone();
        let feeder = tokio::spawn(async move {
            for payload in payloads {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    send_result = in_tx.send(payload) => {
                        if send_result.is_err() {
                            break;
                        }
                    }
                }
            }
            // in_tx dropped here, closing the input side exactly once.
        });

        let (out_tx, out_rx) = mpsc::channel::<RawHTTPResponseDetails>(self.config.channel_capacity);

        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let stats = self.stats.clone();
        let details_pool = self.details_pool.clone();
        let cancel_logged = self.cancel_logged.clone();
        let max_concurrent = self.config.max_concurrent;

        tokio::spawn(async move {
            let stream = stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            stream
                .for_each_concurrent(max_concurrent, move |payload| {
                    let client = client.clone();
                    let cancel = cancel.clone();
                    let stats = stats.clone();
                    let error_sink = error_sink.clone();
                    let details_pool = details_pool.clone();
                    let cancel_logged = cancel_logged.clone();
                    let out_tx = out_tx.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return;
                        }
                        stats.active.fetch_add(1, Ordering::Relaxed);

                        match client.do_request(&payload, error_sink.as_ref()).await {
                            Ok((elapsed_ms, resp)) => {
                                stats.total_response_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
                                let options = client.options_snapshot().await;
                                let mut details = details_pool.acquire();
                                process_response(&mut details, &resp, &payload, &options, elapsed_ms);
                                let _ = out_tx.send(details).await;
                            }
                            Err(DoRequestError::MaxConsecutiveFailuresReached) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                // Every concurrent worker observing this error
                                // would otherwise log and cancel redundantly;
                                // only the first to win the compare-exchange does.
                                if cancel_logged
                                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                    .is_ok()
                                {
                                    warn!(
                                        host = %payload.host,
                                        "consecutive failure ceiling reached, cancelling run"
                                    );
                                    cancel.cancel();
                                }
                            }
                            Err(_) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }

                        stats.active.fetch_sub(1, Ordering::Relaxed);
                        stats.completed.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .await;

            let _ = feeder.await;
            // out_tx's last clone is dropped here, closing the output
            // channel exactly once, after every worker has settled.
        });

        out_rx
    }

    /// Convenience wrapper over [`process_requests`](Self::process_requests)
    /// for callers that just want each result forwarded to a findings sink:
    /// drains the output channel, stamps a monotonically increasing id on
    /// each result, and returns the details to the pool's freelist.
    pub async fn run(
        &self,
        payloads: Vec<BypassPayload>,
        error_sink: Arc<dyn ErrorSink>,
        findings_sink: Arc<dyn FindingsSink>,
    ) {
        let mut rx = self.process_requests(payloads, error_sink);
        while let Some(details) = rx.recv().await {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let finding = Finding::new(id, &details);
            findings_sink.append(finding).await;
            self.release_details(details);
        }

        info!(
            completed = self.stats.completed.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            rate = self.stats.average_rate(),
            "run finished"
        );
    }

    /// Requests the pool stop accepting new work and drain in-flight
    /// requests; idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpClientOptions, ThrottleConfig};
    use crate::dialer::Dialer;
    use crate::http_client::ErrorContext;
    use crate::throttle::Throttler;

    struct SilentErrorSink;

    #[async_trait::async_trait]
    impl ErrorSink for SilentErrorSink {
        async fn handle_error(&self, _err: &DoRequestError, _ctx: ErrorContext<'_>) -> bool {
            false
        }
    }

    struct CollectingFindingsSink {
        count: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl FindingsSink for CollectingFindingsSink {
        async fn append(&self, _finding: Finding) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_client() -> Arc<HttpClient> {
        let dialer = Arc::new(Dialer::new(
            Arc::new(crate::resolver::ChainResolver::new().unwrap()),
            4,
            std::time::Duration::from_secs(60),
        ));
        Arc::new(HttpClient::new(
            dialer,
            HttpClientOptions::default(),
            Arc::new(Throttler::new(ThrottleConfig::default())),
        ))
    }

    #[tokio::test]
    async fn empty_run_completes_immediately() {
        let client = test_client();
        let pool = WorkerPool::new(client, PoolConfig { max_concurrent: 4, channel_capacity: 8 });
        let sink = Arc::new(CollectingFindingsSink { count: Default::default() });
        pool.run(vec![], Arc::new(SilentErrorSink), sink.clone()).await;
        assert_eq!(sink.count.load(Ordering::Relaxed), 0);
        assert_eq!(pool.stats().completed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn empty_process_requests_closes_the_channel_with_no_results() {
        let client = test_client();
        let pool = WorkerPool::new(client, PoolConfig { max_concurrent: 4, channel_capacity: 8 });
        let mut rx = pool.process_requests(vec![], Arc::new(SilentErrorSink));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn average_rate_is_zero_before_start() {
        let stats = PoolStats::default();
        assert_eq!(stats.average_rate(), 0.0);
    }
}
