//! Job store abstraction and its backends.
//!
//! A [`JobStore`] holds any number of named queues. Each queue keeps its own
//! pause flag and its own jobs keyed by [`JobId`]; nothing is shared between
//! queues.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{BulkAddOutcome, JobCounts, JobId, JobRecord, JobState, NewJob};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryJobStore;
#[cfg(feature = "redis")]
pub use redis::RedisJobStore;

/// Persistence and scheduling backend consumed by the enqueuer, the worker
/// pools and the administrator.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert jobs whose ids are not present yet. Existing ids are left
    /// untouched, payload included.
    async fn add_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<BulkAddOutcome>;

    async fn pause(&self, queue: &str) -> Result<()>;

    async fn resume(&self, queue: &str) -> Result<()>;

    async fn is_paused(&self, queue: &str) -> Result<bool>;

    /// Jobs currently in `state`, in dequeue order for ready states and
    /// oldest first otherwise. `limit = None` reads to the end.
    async fn get_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<JobRecord>>;

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>>;

    /// Remove a job. Active jobs are locked by their worker and yield
    /// [`QueueError::JobLocked`](crate::error::QueueError::JobLocked).
    /// Returns whether a job was removed.
    async fn remove(&self, queue: &str, id: &JobId) -> Result<bool>;

    /// Remove up to `limit` jobs in `state` not touched within `grace`.
    /// Active jobs are never cleaned.
    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<usize>;

    async fn job_counts(&self, queue: &str) -> Result<JobCounts>;

    /// Exclusively move the next ready job to active. Returns `None` when the
    /// queue is paused or empty.
    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<JobRecord>>;

    async fn complete(&self, queue: &str, id: &JobId) -> Result<()>;

    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> Result<()>;

    async fn add(&self, queue: &str, job: NewJob) -> Result<bool> {
        let outcome = self.add_bulk(queue, vec![job]).await?;
        Ok(outcome.added == 1)
    }

    /// Park until a job may be available or `timeout` elapses. Backends that
    /// cannot signal arrivals simply sleep.
    async fn wait_for_job(&self, _queue: &str, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}
