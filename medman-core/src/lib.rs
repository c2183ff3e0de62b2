//! # Medman Core
//!
//! Background processing pipeline for a media catalog: named job queues,
//! catalog backfill, per-queue worker pools, operator administration and
//! perceptual-hash duplicate clustering.
//!
//! ## Overview
//!
//! - **Job store**: [`store::JobStore`] with an in-memory backend and a Redis
//!   backend (feature `redis`, on by default)
//! - **Backfill**: [`backfill::BackfillEnqueuer`] pages a
//!   [`catalog::CatalogSource`] and submits idempotent jobs
//! - **Priority scoring**: [`priority::PriorityScorer`] favors small files
//! - **Workers**: [`worker::WorkerRuntime`] runs one pool per queue
//! - **Administration**: [`admin::QueueAdmin`] pauses, resets and requeues
//! - **Duplicates**: [`duplicates::cluster`] groups near-identical hashes
//! - **Control plane**: [`control::ControlPlane`] wraps all of the above in
//!   explicit success/failure outcomes
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use medman_core::{
//!     catalog::{CatalogItem, InMemoryCatalog},
//!     config::PipelineConfig,
//!     control::ControlPlane,
//!     job::queues,
//!     store::InMemoryJobStore,
//! };
//!
//! async fn backfill_thumbnails() {
//!     let store = Arc::new(InMemoryJobStore::new());
//!     let catalog = Arc::new(InMemoryCatalog::new(vec![CatalogItem::new("m1")]));
//!     let control = ControlPlane::new(store, catalog, PipelineConfig::default());
//!
//!     let outcome = control.enqueue_backfill(queues::THUMBNAIL, None).await;
//!     assert!(outcome.success);
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod admin;
pub mod backfill;
pub mod catalog;
pub mod config;
pub mod control;
pub mod duplicates;
pub mod error;
pub mod job;
pub mod priority;
pub mod store;
pub mod worker;

pub use control::{ControlPlane, OperationOutcome};
pub use error::{QueueError, Result};
pub use job::{JobId, JobRecord, JobState, NewJob};
pub use store::{InMemoryJobStore, JobStore};

#[cfg(feature = "redis")]
pub use store::RedisJobStore;
