//! Cursor-paginated backfill of catalog items into a queue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::catalog::{CatalogItem, CatalogSource};
use crate::config::QueueSettings;
use crate::error::{QueueError, Result};
use crate::job::{BulkAddOutcome, JobId, JobPayload, METHOD_KEY, NewJob};
use crate::priority::{JitterSource, PriorityScorer};
use crate::store::JobStore;

/// Parameters for one backfill run.
#[derive(Debug)]
pub struct BackfillRequest {
    pub queue: String,
    pub job_name: String,
    pub method: Option<String>,
    pub batch_size: usize,
    /// `None` submits every job at priority 0.
    pub scorer: Option<PriorityScorer>,
}

impl BackfillRequest {
    pub fn new(queue: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            job_name: job_name.into(),
            method: None,
            batch_size: 1000,
            scorer: None,
        }
    }

    /// Request shaped by a queue's effective settings. `method` falls back to
    /// the queue's default method.
    pub fn from_settings(
        queue: &str,
        settings: &QueueSettings,
        method: Option<String>,
        batch_size: usize,
        jitter: JitterSource,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            job_name: settings.job_name.clone(),
            method: method.or_else(|| settings.default_method.clone()),
            batch_size,
            scorer: settings
                .priority
                .map(|profile| PriorityScorer::new(profile, jitter)),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_scorer(mut self, scorer: PriorityScorer) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

/// Totals for one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub queue: String,
    /// Catalog fetches issued, including a final empty probe.
    pub pages: usize,
    pub fetched: usize,
    pub added: usize,
    /// Items whose job id was already queued.
    pub skipped: usize,
}

impl BackfillReport {
    fn record(&mut self, fetched: usize, outcome: BulkAddOutcome) {
        self.fetched += fetched;
        self.added += outcome.added;
        self.skipped += outcome.skipped;
    }
}

/// Pages the catalog and bulk-submits one idempotent job per item.
///
/// Reads are strictly sequential within a run. Re-running is cheap: ids
/// already present in the store are skipped.
pub struct BackfillEnqueuer<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    catalog: Arc<C>,
}

impl<S: ?Sized, C: ?Sized> std::fmt::Debug for BackfillEnqueuer<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillEnqueuer")
            .field("store", &std::any::type_name::<S>())
            .field("catalog", &std::any::type_name::<C>())
            .finish()
    }
}

impl<S, C> BackfillEnqueuer<S, C>
where
    S: JobStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    pub fn new(store: Arc<S>, catalog: Arc<C>) -> Self {
        Self { store, catalog }
    }

    pub async fn run(&self, request: &BackfillRequest) -> Result<BackfillReport> {
        if request.batch_size == 0 {
            return Err(QueueError::InvalidInput(
                "backfill batch size must be positive".into(),
            ));
        }
        let queue = request.queue.as_str();
        let mut report = BackfillReport {
            queue: queue.to_string(),
            ..BackfillReport::default()
        };
        let mut offset = 0;

        loop {
            let page = match self
                .catalog
                .fetch_page(queue, offset, request.batch_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    error!(
                        queue,
                        offset,
                        submitted = report.added,
                        error = %err,
                        "catalog fetch failed; aborting backfill run"
                    );
                    return Err(match err {
                        QueueError::Catalog(_) => err,
                        other => QueueError::Catalog(other.to_string()),
                    });
                }
            };
            report.pages += 1;

            let fetched = page.len();
            if fetched == 0 {
                break;
            }

            let jobs: Vec<NewJob> = page
                .iter()
                .map(|item| self.job_for(item, request))
                .collect();
            let outcome = self.store.add_bulk(queue, jobs).await?;
            report.record(fetched, outcome);
            debug!(
                queue,
                offset,
                fetched,
                added = outcome.added,
                skipped = outcome.skipped,
                "backfill page submitted"
            );

            offset += fetched;
            if fetched < request.batch_size {
                break;
            }
        }

        info!(
            queue,
            pages = report.pages,
            fetched = report.fetched,
            added = report.added,
            skipped = report.skipped,
            "backfill run finished"
        );
        Ok(report)
    }

    /// Submit a single item at a fixed priority. Returns whether a new job
    /// was created; an already queued id is left as is.
    pub async fn submit_item(
        &self,
        queue: &str,
        job_name: &str,
        item: &CatalogItem,
        method: Option<&str>,
        priority: i64,
    ) -> Result<bool> {
        let job = NewJob::new(
            JobId::for_item(&item.id, method),
            job_name,
            payload_for(item, method),
        )
        .with_priority(priority);
        let added = self.store.add(queue, job).await?;
        debug!(queue, item = %item.id, added, "single item submitted");
        Ok(added)
    }

    fn job_for(&self, item: &CatalogItem, request: &BackfillRequest) -> NewJob {
        let method = request.method.as_deref();
        let priority = request
            .scorer
            .as_ref()
            .map(|scorer| scorer.score(&item.attributes))
            .unwrap_or(0);
        NewJob::new(
            JobId::for_item(&item.id, method),
            request.job_name.clone(),
            payload_for(item, method),
        )
        .with_priority(priority)
    }
}

fn payload_for(item: &CatalogItem, method: Option<&str>) -> JobPayload {
    let mut payload = item.fields.clone();
    payload.insert("id".to_string(), Value::String(item.id.clone()));
    if let Some(method) = method {
        payload.insert(METHOD_KEY.to_string(), Value::String(method.to_string()));
    }
    payload
}
