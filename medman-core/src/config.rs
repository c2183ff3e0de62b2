use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duplicates::DEFAULT_MAX_HAMMING_DISTANCE;
use crate::job::queues;
use crate::priority::{JitterPolicy, PriorityProfile};

/// Priority given to jobs submitted for a single item from the control
/// plane, ahead of anything a backfill scores.
pub const DIRECT_PRIORITY: i64 = 100;

/// Top-level pipeline settings shared by the enqueuer, the worker runtime and
/// the operator CLI.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-queue overrides keyed by queue name, layered over
    /// [`QueueSettings::for_queue`].
    pub queues: BTreeMap<String, QueueOverrides>,
    pub backfill: BackfillConfig,
    pub worker: WorkerConfig,
    pub duplicates: DuplicateConfig,
    pub redis: RedisConfig,
    /// Tie-breaker applied to backfill priority scores.
    pub jitter: JitterPolicy,
}

impl PipelineConfig {
    /// Effective settings for `name`.
    pub fn queue(&self, name: &str) -> QueueSettings {
        let mut settings = QueueSettings::for_queue(name);
        if let Some(overrides) = self.queues.get(name) {
            overrides.apply(&mut settings);
        }
        settings
    }

    pub fn queue_mut(&mut self, name: &str) -> &mut QueueOverrides {
        self.queues.entry(name.to_string()).or_default()
    }

    /// Known queues plus any configured ones.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            queues::ALL.iter().map(|name| name.to_string()).collect();
        for name in self.queues.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// Optional per-queue settings read from configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOverrides {
    pub concurrency: Option<usize>,
    pub job_name: Option<String>,
    pub default_method: Option<String>,
    pub priority: Option<PriorityProfile>,
}

impl QueueOverrides {
    fn apply(&self, settings: &mut QueueSettings) {
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = concurrency;
        }
        if let Some(job_name) = &self.job_name {
            settings.job_name = job_name.clone();
        }
        if let Some(method) = &self.default_method {
            settings.default_method = Some(method.clone());
        }
        if let Some(profile) = self.priority {
            settings.priority = Some(profile);
        }
    }
}

/// Effective settings for one queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Concurrent consumers. Keep low for CPU/GPU-bound analysis, high for
    /// I/O-bound stages.
    pub concurrency: usize,
    /// Job name stamped on every submission.
    pub job_name: String,
    /// Method used when a backfill or single-item submission names none.
    pub default_method: Option<String>,
    /// Scoring curve for backfill submissions. `None` submits at priority 0.
    pub priority: Option<PriorityProfile>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            job_name: "process".to_string(),
            default_method: None,
            priority: None,
        }
    }
}

impl QueueSettings {
    /// Production defaults for the known queues.
    pub fn for_queue(name: &str) -> Self {
        let (concurrency, job_name) = match name {
            queues::FOLDER_SCAN => (1, "folder-scan"),
            queues::ADVANCED_ANALYSIS => (4, "advanced-analysis"),
            queues::DUPLICATES => (10, "duplicate-detection"),
            queues::CONTENT_WARNINGS => (3, "content-warning-detection"),
            queues::THUMBNAIL => (20, "thumbnail-generation"),
            queues::EXIF => (30, "exif-extraction"),
            queues::OBJECT_ANALYSIS => (3, "object-detection"),
            queues::FIX_IMAGE_DATES => (1, "fix-image-dates"),
            queues::VISUAL_HASH => (1, "visual-hash-generation"),
            _ => return Self::default(),
        };
        let default_method = match name {
            queues::THUMBNAIL => Some("ultra".to_string()),
            queues::EXIF => Some("fast".to_string()),
            _ => None,
        };
        let priority = match name {
            queues::THUMBNAIL => Some(PriorityProfile::thumbnail()),
            queues::VISUAL_HASH => Some(PriorityProfile::visual_hash()),
            _ => None,
        };
        Self {
            concurrency,
            job_name: job_name.to_string(),
            default_method,
            priority,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Catalog page size and bulk submission size.
    pub batch_size: usize,
    /// Priority for single-item submissions.
    pub direct_priority: i64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            direct_priority: DIRECT_PRIORITY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound on how long an idle worker parks before polling again.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    pub max_hamming_distance: u32,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            max_hamming_distance: DEFAULT_MAX_HAMMING_DISTANCE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for every key the store writes.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "medman".to_string(),
        }
    }
}
