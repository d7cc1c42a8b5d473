//! Bounded worker pool.
//!
//! A pool permit is acquired before each fetch, so the pool never holds more
//! than `workers` jobs. Every job runs in its own task with its own session.
//! On shutdown the pool stops fetching, in-flight jobs observe the cancelled
//! token (tearing down and acknowledging with `Error`), and the pool waits
//! for all of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildr_core::{BuildResult, Delivery, JobHandler, JobOutcome};
use buildr_queue::JobQueue;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FETCH_RETRY: Duration = Duration::from_secs(1);

/// Where jobs come from.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Next job, or `None` when none arrived within the source's wait.
    async fn next_job(&self) -> anyhow::Result<Option<Box<dyn Delivery>>>;
}

#[async_trait]
impl JobSource for JobQueue {
    async fn next_job(&self) -> anyhow::Result<Option<Box<dyn Delivery>>> {
        Ok(self
            .next()
            .await?
            .map(|delivery| Box::new(delivery) as Box<dyn Delivery>))
    }
}

/// Totals for one pool run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub handled: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Job tasks that died without producing an outcome.
    pub lost: usize,
}

impl PoolStats {
    fn record(&mut self, joined: Result<JobOutcome, JoinError>) {
        match joined {
            Ok(outcome) => {
                self.handled += 1;
                match outcome.result {
                    BuildResult::Pass => self.passed += 1,
                    BuildResult::Fail => self.failed += 1,
                    BuildResult::Error | BuildResult::Pending => self.errored += 1,
                }
            }
            Err(e) => {
                error!(error = %e, "Job task failed");
                self.lost += 1;
            }
        }
    }
}

/// Run jobs from `source` with at most `workers` in flight until `shutdown`
/// is cancelled, then drain.
pub async fn run_pool(
    source: Arc<dyn JobSource>,
    handler: JobHandler,
    workers: usize,
    shutdown: CancellationToken,
) -> PoolStats {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut jobs = JoinSet::new();
    let mut stats = PoolStats::default();
    info!(workers, "Worker pool started");

    loop {
        while let Some(joined) = jobs.try_join_next() {
            stats.record(joined);
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        if shutdown.is_cancelled() {
            break;
        }

        // Not raced against shutdown: a fetched job must be handled and acked.
        match source.next_job().await {
            Ok(Some(delivery)) => {
                let handler = handler.clone();
                let cancel = shutdown.clone();
                jobs.spawn(async move {
                    let _permit = permit;
                    handler.handle(delivery.as_ref(), cancel).await
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to fetch job, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(FETCH_RETRY) => {}
                }
            }
        }
    }

    info!(in_flight = jobs.len(), "Shutting down, waiting for in-flight jobs");
    while let Some(joined) = jobs.join_next().await {
        stats.record(joined);
    }
    info!(?stats, "Worker pool stopped");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use buildr_core::fakes::{FakeCheckout, FakeDelivery, FakeEngine, MemoryPublisher};
    use buildr_core::{BuildrConfig, Checkout, CheckoutError};

    struct Shared(Arc<FakeDelivery>);

    #[async_trait]
    impl Delivery for Shared {
        fn payload(&self) -> &[u8] {
            self.0.payload()
        }
        fn reply_to(&self) -> Option<&str> {
            self.0.reply_to()
        }
        fn correlation_id(&self) -> Option<&str> {
            self.0.correlation_id()
        }
        async fn ack(&self) -> anyhow::Result<()> {
            self.0.ack().await
        }
        async fn progress(&self) -> anyhow::Result<()> {
            self.0.progress().await
        }
    }

    /// Hands out queued deliveries. With a shutdown token, stops the pool
    /// once every delivery has been acknowledged.
    struct QueueSource {
        pending: Mutex<VecDeque<Arc<FakeDelivery>>>,
        all: Vec<Arc<FakeDelivery>>,
        shutdown_when_done: Option<CancellationToken>,
        fetches: AtomicUsize,
    }

    impl QueueSource {
        fn new(deliveries: Vec<Arc<FakeDelivery>>, shutdown: Option<CancellationToken>) -> Self {
            Self {
                pending: Mutex::new(deliveries.clone().into()),
                all: deliveries,
                shutdown_when_done: shutdown,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobSource for QueueSource {
        async fn next_job(&self) -> anyhow::Result<Option<Box<dyn Delivery>>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self.pending.lock().unwrap().pop_front();
            if let Some(delivery) = next {
                return Ok(Some(Box::new(Shared(delivery))));
            }
            if let Some(token) = &self.shutdown_when_done {
                if self.all.iter().all(|d| d.acks() > 0) {
                    token.cancel();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(None)
        }
    }

    /// Checkout that tracks how many checkouts run at once.
    struct SlowCheckout {
        inner: FakeCheckout,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Checkout for SlowCheckout {
        async fn checkout(
            &self,
            repo: &str,
            branch: &str,
            dest: &std::path::Path,
        ) -> Result<(), CheckoutError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.inner.checkout(repo, branch, dest).await
        }
    }

    fn handler(engine: FakeEngine, checkout: Arc<dyn Checkout>) -> JobHandler {
        JobHandler::new(
            BuildrConfig::default(),
            Arc::new(engine),
            checkout,
            Arc::new(MemoryPublisher::new()),
        )
    }

    fn deliveries(n: usize) -> Vec<Arc<FakeDelivery>> {
        (0..n)
            .map(|i| Arc::new(FakeDelivery::job(&format!("repo-{i}"), "main").with_reply_to("_INBOX.t")))
            .collect()
    }

    #[tokio::test]
    async fn test_every_job_handled_and_acked_once() {
        let shutdown = CancellationToken::new();
        let jobs = deliveries(5);
        let source = Arc::new(QueueSource::new(jobs.clone(), Some(shutdown.clone())));
        let checkout = Arc::new(FakeCheckout::with_manifest(
            "version: 1\nstages: [build]\nbuild:\n  script: [make]\n",
        ));

        let stats = run_pool(source, handler(FakeEngine::new(), checkout), 2, shutdown).await;

        assert_eq!(stats.handled, 5);
        assert_eq!(stats.passed, 5);
        assert!(jobs.iter().all(|d| d.acks() == 1));
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let shutdown = CancellationToken::new();
        let source = Arc::new(QueueSource::new(deliveries(6), Some(shutdown.clone())));
        let checkout = Arc::new(SlowCheckout {
            inner: FakeCheckout::with_manifest("version: 1\nstages: []\n"),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let stats = run_pool(
            source,
            handler(FakeEngine::new(), checkout.clone()),
            2,
            shutdown,
        )
        .await;

        assert_eq!(stats.handled, 6);
        assert!(checkout.peak.load(Ordering::SeqCst) <= 2);
        assert!(checkout.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_jobs() {
        let shutdown = CancellationToken::new();
        let job = Arc::new(FakeDelivery::job("repo", "main").with_reply_to("_INBOX.t"));
        let source = Arc::new(QueueSource::new(vec![job.clone()], None));
        let engine = FakeEngine::new().with_hang("sleep 3600");
        let checkout = Arc::new(FakeCheckout::with_manifest(
            "version: 1\nstages: [build]\nbuild:\n  script: [\"sleep 3600\"]\n",
        ));

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let stats = run_pool(source, handler(engine, checkout), 1, shutdown).await;

        assert_eq!(stats.handled, 1);
        assert_eq!(stats.errored, 1);
        assert_eq!(job.acks(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_pool_fetches_nothing() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let source = Arc::new(QueueSource::new(deliveries(1), None));
        let checkout = Arc::new(FakeCheckout::with_manifest("version: 1\n"));

        let stats = run_pool(
            source.clone(),
            handler(FakeEngine::new(), checkout),
            1,
            shutdown,
        )
        .await;

        assert_eq!(stats, PoolStats::default());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }
}
