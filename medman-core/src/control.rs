//! In-process control plane.
//!
//! Every operation returns an [`OperationOutcome`] instead of an error so a
//! calling layer (CLI, RPC shim, dashboard) can render failures directly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::admin::{QueueAdmin, QueueStats, RequeueReport};
use crate::backfill::{BackfillEnqueuer, BackfillReport, BackfillRequest};
use crate::catalog::{CatalogItem, CatalogSource};
use crate::config::PipelineConfig;
use crate::duplicates::{self, DuplicateReport, HashedItem, SimilarMatch};
use crate::error::Result;
use crate::job::{JobRecord, JobState};
use crate::priority::JitterPolicy;
use crate::store::JobStore;

/// Explicit success/failure wrapper returned across the control boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> OperationOutcome<T> {
    pub fn ok(value: T) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(message.into()),
        }
    }

    fn from_result(operation: &'static str, result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(err) => {
                warn!(operation, error = %err, "control operation failed");
                Self::failed(err.to_string())
            }
        }
    }

    pub fn into_result(self) -> std::result::Result<T, String> {
        match (self.success, self.value) {
            (true, Some(value)) => Ok(value),
            _ => Err(self.error.unwrap_or_else(|| "operation failed".to_string())),
        }
    }
}

/// Facade over the enqueuer, the administrator and the clustering engine.
pub struct ControlPlane<S: ?Sized, C: ?Sized> {
    config: PipelineConfig,
    jitter: JitterPolicy,
    enqueuer: BackfillEnqueuer<S, C>,
    admin: QueueAdmin<S>,
}

impl<S: ?Sized, C: ?Sized> fmt::Debug for ControlPlane<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlane")
            .field("jitter", &self.jitter)
            .field("enqueuer", &self.enqueuer)
            .field("admin", &self.admin)
            .finish()
    }
}

impl<S, C> ControlPlane<S, C>
where
    S: JobStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    pub fn new(store: Arc<S>, catalog: Arc<C>, config: PipelineConfig) -> Self {
        Self {
            enqueuer: BackfillEnqueuer::new(Arc::clone(&store), catalog),
            admin: QueueAdmin::new(store),
            jitter: config.jitter,
            config,
        }
    }

    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Page the catalog for `queue` and submit every eligible item.
    pub async fn enqueue_backfill(
        &self,
        queue: &str,
        method: Option<&str>,
    ) -> OperationOutcome<BackfillReport> {
        let request = BackfillRequest::from_settings(
            queue,
            &self.config.queue(queue),
            method.map(str::to_string),
            self.config.backfill.batch_size,
            self.jitter.source(),
        );
        OperationOutcome::from_result("enqueue_backfill", self.enqueuer.run(&request).await)
    }

    /// Submit one item at the direct-action priority. The value reports
    /// whether a new job was created.
    pub async fn enqueue_item(
        &self,
        queue: &str,
        item: &CatalogItem,
        method: Option<&str>,
    ) -> OperationOutcome<bool> {
        let settings = self.config.queue(queue);
        let method = method.or(settings.default_method.as_deref());
        let result = self
            .enqueuer
            .submit_item(
                queue,
                &settings.job_name,
                item,
                method,
                self.config.backfill.direct_priority,
            )
            .await;
        OperationOutcome::from_result("enqueue_item", result)
    }

    pub async fn get_queue_counts(&self, queue: &str) -> OperationOutcome<QueueStats> {
        OperationOutcome::from_result("get_queue_counts", self.admin.queue_stats(queue).await)
    }

    pub async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> OperationOutcome<Vec<JobRecord>> {
        let result = self.admin.list_jobs(queue, state, offset, limit).await;
        OperationOutcome::from_result("list_jobs", result)
    }

    /// The value is the pause state after the call.
    pub async fn set_paused(&self, queue: &str, paused: bool) -> OperationOutcome<bool> {
        let result = self.admin.set_paused(queue, paused).await.map(|_| paused);
        OperationOutcome::from_result("set_paused", result)
    }

    pub async fn reset_state(&self, queue: &str, state: JobState) -> OperationOutcome<usize> {
        OperationOutcome::from_result("reset_state", self.admin.reset_state(queue, state).await)
    }

    pub async fn requeue_with_method(
        &self,
        queue: &str,
        state: JobState,
        method: &str,
    ) -> OperationOutcome<RequeueReport> {
        let result = self.admin.requeue_with_method(queue, state, method).await;
        OperationOutcome::from_result("requeue_with_method", result)
    }

    /// Cluster `items`; `max_distance` defaults to the configured threshold.
    pub fn compute_duplicate_groups(
        &self,
        items: &[HashedItem],
        max_distance: Option<u32>,
    ) -> OperationOutcome<DuplicateReport> {
        let max_distance =
            max_distance.unwrap_or(self.config.duplicates.max_hamming_distance);
        OperationOutcome::ok(duplicates::cluster(items, max_distance))
    }

    pub fn find_similar(
        &self,
        target: &HashedItem,
        candidates: &[HashedItem],
        max_distance: Option<u32>,
    ) -> OperationOutcome<Vec<SimilarMatch>> {
        let max_distance =
            max_distance.unwrap_or(self.config.duplicates.max_hamming_distance);
        OperationOutcome::ok(duplicates::find_similar(target, candidates, max_distance))
    }
}
