use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::JobStore;
use crate::error::{QueueError, Result};
use crate::job::{BulkAddOutcome, JobCounts, JobId, JobRecord, JobState, NewJob};

#[derive(Debug)]
struct StoredJob {
    record: JobRecord,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    paused: bool,
    next_seq: u64,
    jobs: HashMap<JobId, StoredJob>,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let paused = self.paused;
        for stored in self.jobs.values_mut() {
            let record = &mut stored.record;
            if record.state == JobState::Delayed
                && record.available_at.is_none_or(|at| at <= now)
            {
                record.state = if record.priority > 0 {
                    JobState::Prioritized
                } else if paused {
                    JobState::Paused
                } else {
                    JobState::Waiting
                };
                record.available_at = None;
            }
        }
    }

    /// Jobs in `state`, ordered the way they would be dequeued.
    fn ordered(&self, state: JobState) -> Vec<&StoredJob> {
        let mut jobs: Vec<&StoredJob> = self
            .jobs
            .values()
            .filter(|stored| stored.record.state == state)
            .collect();
        match state {
            JobState::Waiting | JobState::Prioritized | JobState::Paused => {
                jobs.sort_by(|a, b| {
                    b.record
                        .priority
                        .cmp(&a.record.priority)
                        .then(a.seq.cmp(&b.seq))
                });
            }
            _ => {
                jobs.sort_by(|a, b| {
                    a.record
                        .last_touched()
                        .cmp(&b.record.last_touched())
                        .then(a.seq.cmp(&b.seq))
                });
            }
        }
        jobs
    }

    fn next_ready(&self) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|stored| stored.record.state.is_ready())
            .min_by(|a, b| {
                b.record
                    .priority
                    .cmp(&a.record.priority)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|stored| stored.record.id.clone())
    }
}

/// Process-local job store. Used by tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    arrivals: Arc<Notify>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue_count = match self.queues.try_lock() {
            Ok(guard) => guard.len().to_string(),
            Err(_) => "<locked>".to_string(),
        };
        f.debug_struct("InMemoryJobStore")
            .field("queues", &queue_count)
            .finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(
        queues: &mut HashMap<String, QueueState>,
        queue: &str,
        id: &JobId,
        outcome: JobState,
        reason: Option<&str>,
    ) -> Result<()> {
        let stored = queues
            .get_mut(queue)
            .and_then(|state| state.jobs.get_mut(id))
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if stored.record.state != JobState::Active {
            return Err(QueueError::InvalidInput(format!(
                "job {id} is {} and cannot be marked {outcome}",
                stored.record.state
            )));
        }
        stored.record.state = outcome;
        stored.record.finished_at = Some(Utc::now());
        stored.record.failed_reason = reason.map(str::to_string);
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<BulkAddOutcome> {
        let now = Utc::now();
        let mut outcome = BulkAddOutcome::default();
        {
            let mut queues = self.queues.lock().await;
            let state = queues.entry(queue.to_string()).or_default();
            for job in jobs {
                if state.jobs.contains_key(&job.id) {
                    outcome.skipped += 1;
                    continue;
                }
                let initial = job.initial_state(state.paused);
                let record = JobRecord::from_new(queue, job, initial, now);
                let seq = state.next_seq;
                state.next_seq += 1;
                state.jobs.insert(record.id.clone(), StoredJob { record, seq });
                outcome.added += 1;
            }
        }
        if outcome.added > 0 {
            self.arrivals.notify_waiters();
        }
        debug!(
            queue,
            added = outcome.added,
            skipped = outcome.skipped,
            "bulk add"
        );
        Ok(outcome)
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.paused = true;
        for stored in state.jobs.values_mut() {
            if stored.record.state == JobState::Waiting {
                stored.record.state = JobState::Paused;
            }
        }
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<()> {
        {
            let mut queues = self.queues.lock().await;
            let state = queues.entry(queue.to_string()).or_default();
            state.paused = false;
            for stored in state.jobs.values_mut() {
                if stored.record.state == JobState::Paused {
                    stored.record.state = JobState::Waiting;
                }
            }
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).is_some_and(|state| state.paused))
    }

    async fn get_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<JobRecord>> {
        let mut queues = self.queues.lock().await;
        let Some(queue_state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        queue_state.promote_due(Utc::now());
        Ok(queue_state
            .ordered(state)
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .and_then(|state| state.jobs.get(id))
            .map(|stored| stored.record.clone()))
    }

    async fn remove(&self, queue: &str, id: &JobId) -> Result<bool> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };
        match state.jobs.get(id) {
            None => Ok(false),
            Some(stored) if stored.record.state == JobState::Active => {
                Err(QueueError::JobLocked(id.to_string()))
            }
            Some(_) => {
                state.jobs.remove(id);
                Ok(true)
            }
        }
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<usize> {
        if state == JobState::Active {
            warn!(queue, "refusing to clean active jobs");
            return Ok(0);
        }
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(grace)
            .map(|grace| now - grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut queues = self.queues.lock().await;
        let Some(queue_state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        queue_state.promote_due(now);
        let limit = if limit == 0 { usize::MAX } else { limit };
        let doomed: Vec<JobId> = queue_state
            .ordered(state)
            .into_iter()
            .filter(|stored| stored.record.last_touched() <= cutoff)
            .take(limit)
            .map(|stored| stored.record.id.clone())
            .collect();
        for id in &doomed {
            queue_state.jobs.remove(id);
        }
        Ok(doomed.len())
    }

    async fn job_counts(&self, queue: &str) -> Result<JobCounts> {
        let mut queues = self.queues.lock().await;
        let mut counts = JobCounts::default();
        if let Some(queue_state) = queues.get_mut(queue) {
            queue_state.promote_due(Utc::now());
            for stored in queue_state.jobs.values() {
                let state = stored.record.state;
                counts.set(state, counts.get(state) + 1);
            }
        }
        Ok(counts)
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        if state.paused {
            return Ok(None);
        }
        state.promote_due(now);
        let Some(id) = state.next_ready() else {
            return Ok(None);
        };
        let Some(stored) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        stored.record.state = JobState::Active;
        stored.record.attempts += 1;
        stored.record.processed_at = Some(now);
        debug!(queue, worker = worker_id, job = %id, "claimed job");
        Ok(Some(stored.record.clone()))
    }

    async fn complete(&self, queue: &str, id: &JobId) -> Result<()> {
        let mut queues = self.queues.lock().await;
        Self::finish(&mut queues, queue, id, JobState::Completed, None)
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        Self::finish(&mut queues, queue, id, JobState::Failed, Some(reason))
    }

    async fn wait_for_job(&self, _queue: &str, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.arrivals.notified()).await;
    }
}
