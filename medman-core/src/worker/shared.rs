use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use super::JobHandler;
use crate::job::JobRecord;

type Loader<T> = dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync;

/// Expensive handler dependency (an ML model, a decoder context) loaded on
/// first use and shared by every worker of a pool.
///
/// Concurrent first callers wait on a single load. A failed load leaves the
/// slot empty so the next caller tries again.
pub struct SharedResource<T> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    loader: Box<Loader<T>>,
}

impl<T> fmt::Debug for SharedResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResource")
            .field("name", &self.name)
            .field("loaded", &self.cell.initialized())
            .finish()
    }
}

impl<T: Send + Sync + 'static> SharedResource<T> {
    pub fn new<F, Fut>(name: &'static str, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name,
            cell: OnceCell::new(),
            loader: Box::new(move || loader().boxed()),
        }
    }

    pub async fn get(&self) -> anyhow::Result<Arc<T>> {
        let value = self
            .cell
            .get_or_try_init(|| async {
                tracing::info!(resource = self.name, "loading shared resource");
                (self.loader)().await.map(Arc::new).inspect_err(|err| {
                    tracing::warn!(
                        resource = self.name,
                        error = %err,
                        "shared resource failed to load"
                    )
                })
            })
            .await?;
        Ok(Arc::clone(value))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

/// Processing step that needs a loaded [`SharedResource`].
#[async_trait]
pub trait ResourceHandler<T: Send + Sync>: Send + Sync {
    async fn handle(&self, resource: &T, job: &JobRecord) -> anyhow::Result<()>;
}

/// [`JobHandler`] built by pool construction around the resource the pool
/// owns. Every worker of the pool goes through the same load.
pub struct SharedHandler<T, H> {
    resource: Arc<SharedResource<T>>,
    handler: H,
}

impl<T, H> fmt::Debug for SharedHandler<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandler")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl<T, H> SharedHandler<T, H> {
    pub fn new(resource: SharedResource<T>, handler: H) -> Self {
        Self {
            resource: Arc::new(resource),
            handler,
        }
    }

    pub fn resource(&self) -> &Arc<SharedResource<T>> {
        &self.resource
    }
}

#[async_trait]
impl<T, H> JobHandler for SharedHandler<T, H>
where
    T: Send + Sync + 'static,
    H: ResourceHandler<T> + 'static,
{
    async fn handle(&self, job: &JobRecord) -> anyhow::Result<()> {
        let resource = self
            .resource
            .get()
            .await
            .with_context(|| format!("loading {}", self.resource.name()))?;
        self.handler.handle(&resource, job).await
    }
}
