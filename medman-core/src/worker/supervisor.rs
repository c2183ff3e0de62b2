use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{JobHandler, WorkerPool};
use crate::config::PipelineConfig;
use crate::store::JobStore;

/// Runs one worker pool per registered queue. Queues are independent: each
/// pool has its own concurrency and observes its own queue's pause flag.
pub struct WorkerRuntime {
    shutdown_token: CancellationToken,
    pools: Vec<WorkerPool>,
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("pools", &self.pools)
            .finish()
    }
}

impl WorkerRuntime {
    /// Spawn a pool for every queue in `handlers`, sized from `config`.
    pub fn start<S>(
        store: Arc<S>,
        config: &PipelineConfig,
        handlers: BTreeMap<String, Arc<dyn JobHandler>>,
    ) -> Self
    where
        S: JobStore + ?Sized + 'static,
    {
        let shutdown_token = CancellationToken::new();
        let poll_interval = config.worker.poll_interval();
        let mut pools = Vec::with_capacity(handlers.len());

        for (queue, handler) in handlers {
            let concurrency = config.queue(&queue).concurrency;
            if concurrency == 0 {
                tracing::warn!(queue = %queue, "concurrency is 0; queue will not be consumed");
                continue;
            }
            pools.push(WorkerPool::spawn_with_token(
                Arc::clone(&store),
                &queue,
                concurrency,
                handler,
                poll_interval,
                shutdown_token.child_token(),
            ));
        }

        Self {
            shutdown_token,
            pools,
        }
    }

    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    /// Stop every pool and wait for in-flight jobs.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        for pool in &self.pools {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobPayload, JobRecord, NewJob, queues};
    use crate::store::InMemoryJobStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &JobRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pools_follow_configured_concurrency_and_pause_independently() {
        let mut config = PipelineConfig::default();
        config.queue_mut(queues::EXIF).concurrency = Some(2);
        config.worker.poll_interval_ms = 5;

        let store = Arc::new(InMemoryJobStore::new());
        store.pause(queues::THUMBNAIL).await.unwrap();
        for queue in [queues::EXIF, queues::THUMBNAIL] {
            store
                .add(queue, NewJob::new(JobId::from("m1"), "job", JobPayload::new()))
                .await
                .unwrap();
        }

        let mut handlers: BTreeMap<String, Arc<dyn JobHandler>> = BTreeMap::new();
        handlers.insert(queues::EXIF.to_string(), Arc::new(Noop));
        handlers.insert(queues::THUMBNAIL.to_string(), Arc::new(Noop));
        let runtime = WorkerRuntime::start(Arc::clone(&store), &config, handlers);

        let sizes: Vec<_> = runtime
            .pools()
            .iter()
            .map(|pool| (pool.queue().to_string(), pool.concurrency()))
            .collect();
        assert!(sizes.contains(&(queues::EXIF.to_string(), 2)));
        assert!(sizes.contains(&(queues::THUMBNAIL.to_string(), 20)));

        for _ in 0..100 {
            if store.job_counts(queues::EXIF).await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runtime.shutdown().await;

        assert_eq!(store.job_counts(queues::EXIF).await.unwrap().completed, 1);
        assert_eq!(store.job_counts(queues::THUMBNAIL).await.unwrap().paused, 1);
    }
}
