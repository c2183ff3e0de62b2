//! Operator administration: pause/resume, reset by state, requeue with a new
//! processing method, and queue statistics.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{QueueError, Result};
use crate::job::{JobCounts, JobId, JobPayload, JobRecord, JobState, METHOD_KEY, NewJob};
use crate::store::JobStore;

/// Outcome of a requeue pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueReport {
    pub queue: String,
    pub state: JobState,
    pub method: String,
    /// Jobs found in the requested state.
    pub total: usize,
    pub requeued: usize,
    /// Jobs whose remove-and-readd failed; they were logged and skipped.
    pub failed: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub id: JobId,
    pub name: String,
    pub payload: JobPayload,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for ActiveJob {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            name: job.name,
            payload: job.payload,
            processed_at: job.processed_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub paused: bool,
    pub counts: JobCounts,
    pub active_jobs: Vec<ActiveJob>,
}

/// States an operator-facing state name covers. "waiting" means every job
/// that has not started yet, whatever list the store keeps it in.
fn covered_states(state: JobState) -> Vec<JobState> {
    match state {
        JobState::Waiting => {
            vec![JobState::Waiting, JobState::Paused, JobState::Prioritized]
        }
        other => vec![other],
    }
}

/// Administrative operations over a [`JobStore`]. Bulk operations are not
/// atomic across the batch; each is safe to re-run against what remains.
pub struct QueueAdmin<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> fmt::Debug for QueueAdmin<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueAdmin")
            .field("store", &std::any::type_name::<S>())
            .finish()
    }
}

impl<S: JobStore + ?Sized> QueueAdmin<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn set_paused(&self, queue: &str, paused: bool) -> Result<()> {
        if paused {
            self.store.pause(queue).await?;
        } else {
            self.store.resume(queue).await?;
        }
        info!(queue, paused, "queue pause state changed");
        Ok(())
    }

    /// Remove every job in `state`. Returns how many were removed; an empty
    /// state is a no-op returning 0.
    pub async fn reset_state(&self, queue: &str, state: JobState) -> Result<usize> {
        if state == JobState::Active {
            return Err(QueueError::UnsupportedState {
                operation: "reset",
                state: state.to_string(),
            });
        }
        let mut removed = 0;
        for covered in covered_states(state) {
            removed += self.store.clean(queue, Duration::ZERO, 0, covered).await?;
        }
        info!(queue, state = %state, removed, "queue state reset");
        Ok(removed)
    }

    /// Resubmit every job in `state` under `method`.
    ///
    /// The queue is paused for the duration so no worker claims a job while
    /// it is being swapped, and is resumed afterwards on every path.
    pub async fn requeue_with_method(
        &self,
        queue: &str,
        state: JobState,
        method: &str,
    ) -> Result<RequeueReport> {
        if state == JobState::Active {
            return Err(QueueError::UnsupportedState {
                operation: "requeue",
                state: state.to_string(),
            });
        }
        if method.trim().is_empty() {
            return Err(QueueError::InvalidInput("method must not be empty".into()));
        }

        let outcome = self.requeue_paused(queue, state, method).await;
        let resumed = self.store.resume(queue).await;
        if let Err(err) = &resumed {
            error!(queue, error = %err, "failed to resume queue after requeue");
        }

        match (outcome, resumed) {
            (Ok(report), Ok(())) => {
                info!(
                    queue,
                    state = %state,
                    method,
                    total = report.total,
                    requeued = report.requeued,
                    failed = report.failed,
                    "requeue finished"
                );
                Ok(report)
            }
            (Ok(_), Err(err)) => Err(QueueError::Admin(format!(
                "requeue finished but queue {queue} could not be resumed: {err}"
            ))),
            (Err(err), _) => {
                error!(queue, state = %state, error = %err, "requeue aborted");
                Err(QueueError::Admin(format!("requeue of {queue} failed: {err}")))
            }
        }
    }

    async fn requeue_paused(
        &self,
        queue: &str,
        state: JobState,
        method: &str,
    ) -> Result<RequeueReport> {
        // Pausing moves waiting jobs into the paused list, so remember which
        // jobs were already paused before the pause itself.
        let already_paused: Option<HashSet<JobId>> = if state == JobState::Paused {
            let jobs = self.store.get_jobs(queue, JobState::Paused, 0, None).await?;
            Some(jobs.into_iter().map(|job| job.id).collect())
        } else {
            None
        };

        self.store.pause(queue).await?;

        let mut jobs = Vec::new();
        for covered in covered_states(state) {
            jobs.extend(self.store.get_jobs(queue, covered, 0, None).await?);
        }
        if let Some(ids) = &already_paused {
            jobs.retain(|job| ids.contains(&job.id));
        }

        let mut report = RequeueReport {
            queue: queue.to_string(),
            state,
            method: method.to_string(),
            total: jobs.len(),
            requeued: 0,
            failed: 0,
        };
        for job in &jobs {
            match self.requeue_one(queue, job, method).await {
                Ok(()) => report.requeued += 1,
                Err(err) => {
                    warn!(queue, job = %job.id, error = %err, "skipping job during requeue");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Swap one job for its rewritten id. A rewritten id that is already
    /// taken leaves the original job in place.
    async fn requeue_one(&self, queue: &str, job: &JobRecord, method: &str) -> Result<()> {
        let new_id = job.id.with_method(job.method(), method);
        if new_id != job.id
            && let Some(existing) = self.store.get_job(queue, &new_id).await?
        {
            return Err(QueueError::AlreadyExists {
                id: new_id.to_string(),
                state: existing.state.to_string(),
            });
        }
        if !self.store.remove(queue, &job.id).await? {
            return Err(QueueError::NotFound(job.id.to_string()));
        }

        let mut payload = job.payload.clone();
        payload.insert(METHOD_KEY.to_string(), Value::String(method.to_string()));
        let resubmitted =
            NewJob::new(new_id.clone(), job.name.clone(), payload).with_priority(job.priority);
        if !self.store.add(queue, resubmitted).await? {
            return Err(QueueError::Admin(format!(
                "job {new_id} appeared while {} was being requeued",
                job.id
            )));
        }
        Ok(())
    }

    /// One page of jobs in `state`, in the store's listing order.
    pub async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.store.get_jobs(queue, state, offset, Some(limit)).await
    }

    /// Counts for all eight states plus the jobs currently being processed.
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let counts = self.store.job_counts(queue).await?;
        let paused = self.store.is_paused(queue).await?;
        let active_jobs = self
            .store
            .get_jobs(queue, JobState::Active, 0, None)
            .await?
            .into_iter()
            .map(ActiveJob::from)
            .collect();
        Ok(QueueStats {
            queue: queue.to_string(),
            paused,
            counts,
            active_jobs,
        })
    }
}
