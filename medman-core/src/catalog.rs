//! Catalog paging capability consumed by the backfill enqueuer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// The attributes scoring and eligibility need.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaAttributes {
    pub size_bytes: Option<u64>,
    /// Format can be processed without conversion.
    pub is_native: bool,
    /// The artifact this stage depends on already exists.
    pub has_prerequisite: bool,
    pub mime_type: Option<String>,
}

/// One catalog row. `fields` are copied verbatim into the job payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    #[serde(default)]
    pub attributes: MediaAttributes,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: MediaAttributes::default(),
            fields: Map::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: MediaAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Pages through the items that still need processing for a queue.
///
/// Pages must be ordered by a stable ascending key so that successive
/// `(offset, limit)` windows never overlap.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_page(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CatalogItem>>;
}

type Eligibility = dyn Fn(&str, &CatalogItem) -> bool + Send + Sync;

/// Catalog snapshot held in memory, sorted by item id.
#[derive(Clone)]
pub struct InMemoryCatalog {
    items: Vec<CatalogItem>,
    eligible: Arc<Eligibility>,
}

impl fmt::Debug for InMemoryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCatalog")
            .field("items", &self.items.len())
            .finish()
    }
}

impl InMemoryCatalog {
    /// Every item is eligible for every queue.
    pub fn new(mut items: Vec<CatalogItem>) -> Self {
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            items,
            eligible: Arc::new(|_, _| true),
        }
    }

    pub fn with_eligibility<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &CatalogItem) -> bool + Send + Sync + 'static,
    {
        self.eligible = Arc::new(predicate);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl CatalogSource for InMemoryCatalog {
    async fn fetch_page(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CatalogItem>> {
        Ok(self
            .items
            .iter()
            .filter(|item| (self.eligible)(queue, item))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Eligibility for queues that only handle images.
pub fn is_image(item: &CatalogItem) -> bool {
    item.attributes
        .mime_type
        .as_deref()
        .is_some_and(|mime| mime.starts_with("image/"))
}
