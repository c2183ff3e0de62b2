//! Per-queue worker pools.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::job::JobRecord;
use crate::store::JobStore;

pub mod shared;
pub mod supervisor;

pub use shared::{ResourceHandler, SharedHandler, SharedResource};
pub use supervisor::WorkerRuntime;

/// External processing step for one queue. An `Err` marks the job failed
/// with the error chain as its reason; there is no automatic retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> anyhow::Result<()>;
}

/// Fixed set of concurrent consumers for one queue.
pub struct WorkerPool {
    queue: String,
    concurrency: usize,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue)
            .field("concurrency", &self.concurrency)
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn spawn<S>(
        store: Arc<S>,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
        poll_interval: Duration,
    ) -> Self
    where
        S: JobStore + ?Sized + 'static,
    {
        Self::spawn_with_token(
            store,
            queue,
            concurrency,
            handler,
            poll_interval,
            CancellationToken::new(),
        )
    }

    /// Spawn a pool whose workers share `resource`. The pool owns the
    /// resource; it is loaded by the first job and reused after that.
    pub fn spawn_shared<S, T, H>(
        store: Arc<S>,
        queue: &str,
        concurrency: usize,
        resource: SharedResource<T>,
        handler: H,
        poll_interval: Duration,
    ) -> Self
    where
        S: JobStore + ?Sized + 'static,
        T: Send + Sync + 'static,
        H: ResourceHandler<T> + 'static,
    {
        Self::spawn(
            store,
            queue,
            concurrency,
            Arc::new(SharedHandler::new(resource, handler)),
            poll_interval,
        )
    }

    /// Like [`WorkerPool::spawn`], stopping when `shutdown` is cancelled.
    pub fn spawn_with_token<S>(
        store: Arc<S>,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self
    where
        S: JobStore + ?Sized + 'static,
    {
        let worker_group = format!("{}-{}", queue, std::process::id());
        let mut handles = Vec::with_capacity(concurrency);

        for i in 0..concurrency {
            let worker_id = format!("{worker_group}-w{i}");
            let store = Arc::clone(&store);
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            let queue = queue.to_string();

            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        tracing::debug!(worker = %worker_id, "worker shutting down");
                        break;
                    }

                    match store.claim(&queue, &worker_id).await {
                        Ok(Some(job)) => {
                            run_job(store.as_ref(), handler.as_ref(), &worker_id, job)
                                .await;
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = store.wait_for_job(&queue, poll_interval) => {}
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                worker = %worker_id,
                                queue = %queue,
                                error = %err,
                                "claim failed"
                            );
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                    }
                }
            }));
        }

        tracing::info!(queue, concurrency, "worker pool started");

        Self {
            queue: queue.to_string(),
            concurrency,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(queue = %self.queue, error = %err, "worker task ended abnormally");
            }
        }
        tracing::info!(queue = %self.queue, "worker pool stopped");
    }
}

async fn run_job<S>(store: &S, handler: &dyn JobHandler, worker_id: &str, job: JobRecord)
where
    S: JobStore + ?Sized,
{
    tracing::trace!(worker = %worker_id, queue = %job.queue, job = %job.id, "job claimed");

    let outcome = AssertUnwindSafe(handler.handle(&job)).catch_unwind().await;
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(QueueError::Handler(format!("{err:#}"))),
        Err(_) => Some(QueueError::Handler("handler panicked".to_string())),
    };

    let result = match failure {
        None => store.complete(&job.queue, &job.id).await,
        Some(err) => {
            tracing::warn!(
                worker = %worker_id,
                queue = %job.queue,
                job = %job.id,
                reason = %err,
                "job failed"
            );
            store.fail(&job.queue, &job.id, &err.to_string()).await
        }
    };
    if let Err(err) = result {
        tracing::error!(
            worker = %worker_id,
            queue = %job.queue,
            job = %job.id,
            error = %err,
            "failed to record job outcome"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobPayload, JobState, NewJob};
    use crate::store::InMemoryJobStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const Q: &str = "duplicatesQueue";

    struct RecordingHandler {
        seen: Mutex<Vec<JobId>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &JobRecord) -> anyhow::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().await.push(job.id.clone());
            self.running.fetch_sub(1, Ordering::SeqCst);
            if job.id.as_str().starts_with("bad") {
                anyhow::bail!("cannot decode {}", job.id);
            }
            Ok(())
        }
    }

    async fn wait_until_drained(store: &InMemoryJobStore) {
        for _ in 0..200 {
            let counts = store.job_counts(Q).await.unwrap();
            if counts.completed + counts.failed == 20 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs were not drained");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_processes_each_job_once_within_concurrency() {
        let store = Arc::new(InMemoryJobStore::new());
        let jobs = (0..20)
            .map(|i| {
                let id = if i % 5 == 0 { format!("bad{i}") } else { format!("ok{i}") };
                NewJob::new(JobId(id), "duplicate-detection", JobPayload::new())
            })
            .collect();
        store.add_bulk(Q, jobs).await.unwrap();

        let handler = Arc::new(RecordingHandler::new());
        let pool = WorkerPool::spawn(
            Arc::clone(&store),
            Q,
            3,
            handler.clone(),
            Duration::from_millis(5),
        );
        wait_until_drained(&store).await;
        pool.shutdown().await;

        let seen = handler.seen.lock().await;
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 20);
        assert_eq!(unique.len(), 20);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);

        let failed = store.get_jobs(Q, JobState::Failed, 0, None).await.unwrap();
        assert_eq!(failed.len(), 4);
        assert!(failed
            .iter()
            .all(|job| job.failed_reason.as_deref().is_some_and(|r| r.starts_with("cannot decode"))));
    }

    #[tokio::test]
    async fn paused_queue_is_not_consumed() {
        let store = Arc::new(InMemoryJobStore::new());
        store.pause(Q).await.unwrap();
        store
            .add(Q, NewJob::new(JobId::from("ok1"), "duplicate-detection", JobPayload::new()))
            .await
            .unwrap();

        let handler = Arc::new(RecordingHandler::new());
        let pool = WorkerPool::spawn(Arc::clone(&store), Q, 2, handler.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.seen.lock().await.is_empty());

        store.resume(Q).await.unwrap();
        for _ in 0..100 {
            if store.job_counts(Q).await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;
        assert_eq!(store.job_counts(Q).await.unwrap().completed, 1);
    }

    struct LabelHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ResourceHandler<Vec<String>> for LabelHandler {
        async fn handle(&self, labels: &Vec<String>, job: &JobRecord) -> anyhow::Result<()> {
            self.seen.lock().await.push(format!("{}:{}", job.id, labels[0]));
            Ok(())
        }
    }

    async fn wait_for_finished(store: &InMemoryJobStore, expected: usize) {
        for _ in 0..200 {
            let counts = store.job_counts(Q).await.unwrap();
            if counts.completed + counts.failed == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs were not drained");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_workers_share_one_resource_load() {
        let store = Arc::new(InMemoryJobStore::new());
        let jobs = (0..12)
            .map(|i| NewJob::new(JobId(format!("m{i}")), "object-detection", JobPayload::new()))
            .collect();
        store.add_bulk(Q, jobs).await.unwrap();

        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let labels = SharedResource::new("labels", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(vec!["cat".to_string()])
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = WorkerPool::spawn_shared(
            Arc::clone(&store),
            Q,
            4,
            labels,
            LabelHandler { seen: Arc::clone(&seen) },
            Duration::from_millis(5),
        );
        wait_for_finished(&store, 12).await;
        pool.shutdown().await;

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(store.job_counts(Q).await.unwrap().completed, 12);
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 12);
        assert!(seen.iter().all(|entry| entry.ends_with(":cat")));
    }

    #[tokio::test]
    async fn failed_resource_load_fails_the_job_and_is_retried() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .add_bulk(
                Q,
                vec![
                    NewJob::new(JobId::from("a"), "object-detection", JobPayload::new()),
                    NewJob::new(JobId::from("b"), "object-detection", JobPayload::new()),
                ],
            )
            .await
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let labels = SharedResource::new("labels", move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("weights missing");
                }
                Ok(vec!["dog".to_string()])
            }
        });
        let pool = WorkerPool::spawn_shared(
            Arc::clone(&store),
            Q,
            1,
            labels,
            LabelHandler { seen: Arc::new(Mutex::new(Vec::new())) },
            Duration::from_millis(5),
        );
        wait_for_finished(&store, 2).await;
        pool.shutdown().await;

        let failed = store.get_jobs(Q, JobState::Failed, 0, None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id.as_str(), "a");
        assert_eq!(
            failed[0].failed_reason.as_deref(),
            Some("loading labels: weights missing")
        );
        assert_eq!(store.job_counts(Q).await.unwrap().completed, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _job: &JobRecord) -> anyhow::Result<()> {
            panic!("model crashed");
        }
    }

    #[tokio::test]
    async fn handler_panic_fails_the_job_and_keeps_the_worker() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .add_bulk(
                Q,
                vec![
                    NewJob::new(JobId::from("a"), "x", JobPayload::new()),
                    NewJob::new(JobId::from("b"), "x", JobPayload::new()),
                ],
            )
            .await
            .unwrap();
        let pool = WorkerPool::spawn(Arc::clone(&store), Q, 1, Arc::new(PanickingHandler), Duration::from_millis(5));
        for _ in 0..100 {
            if store.job_counts(Q).await.unwrap().failed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;
        let failed = store.get_jobs(Q, JobState::Failed, 0, None).await.unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].failed_reason.as_deref(), Some("handler panicked"));
    }
}
