use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medman_core::admin::QueueAdmin;
use medman_core::job::{
    BulkAddOutcome, JobCounts, JobId, JobPayload, JobRecord, JobState, NewJob, queues,
};
use medman_core::store::{InMemoryJobStore, JobStore};
use medman_core::{QueueError, Result};

/// Delegates to an in-memory store with switchable failures.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryJobStore,
    /// Job id whose removal fails.
    broken: Option<JobId>,
    fail_listing: bool,
    fail_resume: bool,
}

impl FlakyStore {
    fn refusing_to_remove(id: &str) -> Self {
        Self {
            broken: Some(JobId::from(id)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> Result<BulkAddOutcome> {
        self.inner.add_bulk(queue, jobs).await
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        self.inner.pause(queue).await
    }

    async fn resume(&self, queue: &str) -> Result<()> {
        if self.fail_resume {
            return Err(QueueError::Internal("broker went away".into()));
        }
        self.inner.resume(queue).await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        self.inner.is_paused(queue).await
    }

    async fn get_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<JobRecord>> {
        if self.fail_listing {
            return Err(QueueError::Internal("read timed out".into()));
        }
        self.inner.get_jobs(queue, state, offset, limit).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>> {
        self.inner.get_job(queue, id).await
    }

    async fn remove(&self, queue: &str, id: &JobId) -> Result<bool> {
        if self.broken.as_ref() == Some(id) {
            return Err(QueueError::Internal("connection reset".into()));
        }
        self.inner.remove(queue, id).await
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<usize> {
        self.inner.clean(queue, grace, limit, state).await
    }

    async fn job_counts(&self, queue: &str) -> Result<JobCounts> {
        self.inner.job_counts(queue).await
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<JobRecord>> {
        self.inner.claim(queue, worker_id).await
    }

    async fn complete(&self, queue: &str, id: &JobId) -> Result<()> {
        self.inner.complete(queue, id).await
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> Result<()> {
        self.inner.fail(queue, id, reason).await
    }
}

fn exif_job(item: &str, method: &str) -> NewJob {
    let mut payload = JobPayload::new();
    payload.insert("id".into(), item.into());
    payload.insert("method".into(), method.into());
    NewJob::new(JobId::for_item(item, Some(method)), "exif-extraction", payload)
}

async fn fail_all(store: &impl JobStore, queue: &str) {
    while let Some(job) = store.claim(queue, "test-w0").await.expect("claim") {
        store
            .fail(queue, &job.id, "exiftool exited with status 1")
            .await
            .expect("fail job");
    }
}

#[tokio::test]
async fn requeue_skips_a_failing_job_and_resumes_the_queue() {
    let store = Arc::new(FlakyStore::refusing_to_remove("b-fast"));
    store
        .add_bulk(
            queues::EXIF,
            vec![exif_job("a", "fast"), exif_job("b", "fast"), exif_job("c", "fast")],
        )
        .await
        .expect("seed jobs");
    fail_all(store.as_ref(), queues::EXIF).await;

    let admin = QueueAdmin::new(Arc::clone(&store));
    let report = admin
        .requeue_with_method(queues::EXIF, JobState::Failed, "slow")
        .await
        .expect("requeue");

    assert_eq!((report.total, report.requeued, report.failed), (3, 2, 1));
    assert!(!store.is_paused(queues::EXIF).await.expect("paused flag"));

    let counts = store.job_counts(queues::EXIF).await.expect("counts");
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.waiting, 2);
    for id in ["a-slow", "c-slow"] {
        let job = store
            .get_job(queues::EXIF, &JobId::from(id))
            .await
            .expect("get job")
            .expect("requeued job exists");
        assert_eq!(job.method(), Some("slow"));
        assert_eq!(job.state, JobState::Waiting);
    }
}

#[tokio::test]
async fn requeued_jobs_are_consumed_after_resume() {
    let store = Arc::new(InMemoryJobStore::new());
    store
        .add_bulk(queues::EXIF, vec![exif_job("a", "fast"), exif_job("b", "fast")])
        .await
        .expect("seed jobs");
    fail_all(store.as_ref(), queues::EXIF).await;

    QueueAdmin::new(Arc::clone(&store))
        .requeue_with_method(queues::EXIF, JobState::Failed, "slow")
        .await
        .expect("requeue");

    let claimed = store
        .claim(queues::EXIF, "test-w1")
        .await
        .expect("claim")
        .expect("requeued job is ready");
    assert!(claimed.id.as_str().ends_with("-slow"));
}

#[tokio::test]
async fn requeue_of_active_jobs_is_rejected() {
    let store = Arc::new(InMemoryJobStore::new());
    let admin = QueueAdmin::new(Arc::clone(&store));
    let err = admin
        .requeue_with_method(queues::EXIF, JobState::Active, "slow")
        .await
        .expect_err("active is not requeueable");
    assert!(matches!(err, QueueError::UnsupportedState { .. }));
    assert!(!store.is_paused(queues::EXIF).await.expect("paused flag"));
}

#[tokio::test]
async fn reset_failed_leaves_other_states_alone() {
    let store = Arc::new(InMemoryJobStore::new());
    store
        .add_bulk(queues::EXIF, vec![exif_job("a", "fast"), exif_job("b", "fast")])
        .await
        .expect("seed jobs");
    let job = store
        .claim(queues::EXIF, "test-w0")
        .await
        .expect("claim")
        .expect("ready job");
    store.fail(queues::EXIF, &job.id, "boom").await.expect("fail job");

    let removed = QueueAdmin::new(Arc::clone(&store))
        .reset_state(queues::EXIF, JobState::Failed)
        .await
        .expect("reset");

    assert_eq!(removed, 1);
    let counts = store.job_counts(queues::EXIF).await.expect("counts");
    assert_eq!((counts.failed, counts.waiting), (0, 1));
}

#[tokio::test]
async fn requeue_keeps_a_job_whose_new_id_is_taken() {
    let store = Arc::new(InMemoryJobStore::new());
    store
        .add_bulk(queues::EXIF, vec![exif_job("1", "slow"), exif_job("1", "fast")])
        .await
        .expect("seed jobs");
    let done = store
        .claim(queues::EXIF, "test-w0")
        .await
        .expect("claim")
        .expect("ready job");
    assert_eq!(done.id.as_str(), "1-slow");
    store.complete(queues::EXIF, &done.id).await.expect("complete job");
    fail_all(store.as_ref(), queues::EXIF).await;

    let report = QueueAdmin::new(Arc::clone(&store))
        .requeue_with_method(queues::EXIF, JobState::Failed, "slow")
        .await
        .expect("requeue");

    assert_eq!((report.total, report.requeued, report.failed), (1, 0, 1));
    let counts = store.job_counts(queues::EXIF).await.expect("counts");
    assert_eq!((counts.completed, counts.failed, counts.waiting), (1, 1, 0));
    let kept = store
        .get_job(queues::EXIF, &JobId::from("1-fast"))
        .await
        .expect("get job")
        .expect("original job kept");
    assert_eq!(kept.state, JobState::Failed);
}

#[tokio::test]
async fn requeue_of_paused_ignores_jobs_that_were_waiting() {
    let store = Arc::new(InMemoryJobStore::new());
    store
        .add_bulk(queues::EXIF, vec![exif_job("a", "fast"), exif_job("b", "fast")])
        .await
        .expect("seed jobs");

    let report = QueueAdmin::new(Arc::clone(&store))
        .requeue_with_method(queues::EXIF, JobState::Paused, "slow")
        .await
        .expect("requeue");

    assert_eq!(report.total, 0);
    assert!(!store.is_paused(queues::EXIF).await.expect("paused flag"));
    for id in ["a-fast", "b-fast"] {
        let job = store
            .get_job(queues::EXIF, &JobId::from(id))
            .await
            .expect("get job")
            .expect("job untouched");
        assert_eq!(job.state, JobState::Waiting);
    }
}

#[tokio::test]
async fn requeue_of_paused_rewrites_jobs_paused_beforehand() {
    let store = Arc::new(InMemoryJobStore::new());
    store.pause(queues::EXIF).await.expect("pause");
    store
        .add_bulk(queues::EXIF, vec![exif_job("a", "fast")])
        .await
        .expect("seed jobs");

    let report = QueueAdmin::new(Arc::clone(&store))
        .requeue_with_method(queues::EXIF, JobState::Paused, "slow")
        .await
        .expect("requeue");

    assert_eq!((report.total, report.requeued), (1, 1));
    assert!(
        store
            .get_job(queues::EXIF, &JobId::from("a-slow"))
            .await
            .expect("get job")
            .is_some()
    );
}

#[tokio::test]
async fn aborted_requeue_still_resumes_the_queue() {
    let store = Arc::new(FlakyStore {
        fail_listing: true,
        ..FlakyStore::default()
    });
    store
        .add_bulk(queues::EXIF, vec![exif_job("a", "fast")])
        .await
        .expect("seed jobs");

    let err = QueueAdmin::new(Arc::clone(&store))
        .requeue_with_method(queues::EXIF, JobState::Failed, "slow")
        .await
        .expect_err("listing failure aborts the requeue");

    assert!(matches!(err, QueueError::Admin(_)));
    assert!(!store.is_paused(queues::EXIF).await.expect("paused flag"));
    let job = store
        .get_job(queues::EXIF, &JobId::from("a-fast"))
        .await
        .expect("get job")
        .expect("job untouched");
    assert_eq!(job.state, JobState::Waiting);
}

#[tokio::test]
async fn resume_failure_after_requeue_is_reported() {
    let store = Arc::new(FlakyStore {
        fail_resume: true,
        ..FlakyStore::default()
    });
    store
        .add_bulk(queues::EXIF, vec![exif_job("a", "fast")])
        .await
        .expect("seed jobs");
    fail_all(store.as_ref(), queues::EXIF).await;

    let err = QueueAdmin::new(Arc::clone(&store))
        .requeue_with_method(queues::EXIF, JobState::Failed, "slow")
        .await
        .expect_err("resume failure is surfaced");

    match err {
        QueueError::Admin(message) => assert!(message.contains("could not be resumed")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(
        store
            .get_job(queues::EXIF, &JobId::from("a-slow"))
            .await
            .expect("get job")
            .is_some()
    );
}
