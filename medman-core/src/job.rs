use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Names of the processing queues the pipeline runs.
pub mod queues {
    pub const FOLDER_SCAN: &str = "folderScanQueue";
    pub const ADVANCED_ANALYSIS: &str = "advancedAnalysisQueue";
    pub const DUPLICATES: &str = "duplicatesQueue";
    pub const CONTENT_WARNINGS: &str = "contentWarningsQueue";
    pub const THUMBNAIL: &str = "thumbnailQueue";
    pub const EXIF: &str = "exifQueue";
    pub const OBJECT_ANALYSIS: &str = "objectAnalysisQueue";
    pub const FIX_IMAGE_DATES: &str = "fixImageDatesQueue";
    pub const VISUAL_HASH: &str = "visualHashQueue";

    pub const ALL: [&str; 9] = [
        FOLDER_SCAN,
        ADVANCED_ANALYSIS,
        DUPLICATES,
        CONTENT_WARNINGS,
        THUMBNAIL,
        EXIF,
        OBJECT_ANALYSIS,
        FIX_IMAGE_DATES,
        VISUAL_HASH,
    ];
}

/// Opaque key/value data handed to the job handler.
pub type JobPayload = Map<String, Value>;

/// Payload key carrying the processing method a job was submitted with.
pub const METHOD_KEY: &str = "method";

/// Deterministic job identifier. Two submissions for the same item and
/// method always produce the same id, which is what makes submission
/// idempotent.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `"{item}-{method}"`, or just the item id when no method applies.
    pub fn for_item(item_id: &str, method: Option<&str>) -> Self {
        match method {
            Some(method) if !method.is_empty() => {
                Self(format!("{item_id}-{method}"))
            }
            _ => Self(item_id.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the id a job gets when it is resubmitted with `new_method`.
    ///
    /// The trailing `-{current}` segment is swapped for `-{new_method}` when
    /// the id carries the job's current method; otherwise `-{new_method}` is
    /// appended. Item ids that themselves contain hyphens (UUIDs) keep their
    /// shape either way.
    pub fn with_method(&self, current: Option<&str>, new_method: &str) -> Self {
        if let Some(current) = current.filter(|m| !m.is_empty())
            && let Some(stem) = self
                .0
                .strip_suffix(current)
                .and_then(|rest| rest.strip_suffix('-'))
            && !stem.is_empty()
        {
            return Self(format!("{stem}-{new_method}"));
        }
        Self(format!("{}-{new_method}", self.0))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Every state a job can be observed in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
    Prioritized,
    WaitingChildren,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Active,
        JobState::Waiting,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
        JobState::Paused,
        JobState::WaitingChildren,
        JobState::Prioritized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
            JobState::Prioritized => "prioritized",
            JobState::WaitingChildren => "waiting-children",
        }
    }

    /// States a worker may claim from.
    pub fn is_ready(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Prioritized)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting" | "wait" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "delayed" => Ok(JobState::Delayed),
            "paused" => Ok(JobState::Paused),
            "prioritized" => Ok(JobState::Prioritized),
            "waiting-children" | "waiting_children" => {
                Ok(JobState::WaitingChildren)
            }
            other => {
                Err(QueueError::InvalidInput(format!("unknown job state '{other}'")))
            }
        }
    }
}

/// A job as stored in a queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: JobPayload,
    /// Higher values are dequeued first.
    pub priority: i64,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    /// Set for delayed jobs: the instant they become claimable.
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Materialize a submitted job. The caller decides the initial state.
    pub fn from_new(
        queue: &str,
        job: NewJob,
        state: JobState,
        now: DateTime<Utc>,
    ) -> Self {
        let available_at = job.delay.and_then(|delay| {
            chrono::Duration::from_std(delay).ok().map(|d| now + d)
        });
        Self {
            id: job.id,
            queue: queue.to_string(),
            name: job.name,
            payload: job.payload,
            priority: job.priority,
            state,
            created_at: now,
            attempts: 0,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            available_at,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.payload.get(METHOD_KEY).and_then(Value::as_str)
    }

    /// Timestamp `clean` compares against the grace period.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.finished_at
            .or(self.processed_at)
            .unwrap_or(self.created_at)
    }
}

/// Submission request for a single job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub name: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub delay: Option<Duration>,
}

impl NewJob {
    pub fn new(id: JobId, name: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
            priority: 0,
            delay: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// State a freshly added job lands in.
    pub fn initial_state(&self, queue_paused: bool) -> JobState {
        if self.delay.is_some_and(|d| !d.is_zero()) {
            JobState::Delayed
        } else if self.priority > 0 {
            JobState::Prioritized
        } else if queue_paused {
            JobState::Paused
        } else {
            JobState::Waiting
        }
    }
}

/// Result of a bulk submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkAddOutcome {
    pub added: usize,
    /// Ids already present in the queue; left untouched.
    pub skipped: usize,
}

/// Per-state job counts for one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobCounts {
    pub active: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
    pub waiting_children: usize,
    pub prioritized: usize,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Active => self.active,
            JobState::Waiting => self.waiting,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Delayed => self.delayed,
            JobState::Paused => self.paused,
            JobState::WaitingChildren => self.waiting_children,
            JobState::Prioritized => self.prioritized,
        }
    }

    pub fn set(&mut self, state: JobState, count: usize) {
        let slot = match state {
            JobState::Active => &mut self.active,
            JobState::Waiting => &mut self.waiting,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Delayed => &mut self.delayed,
            JobState::Paused => &mut self.paused,
            JobState::WaitingChildren => &mut self.waiting_children,
            JobState::Prioritized => &mut self.prioritized,
        };
        *slot = count;
    }

    pub fn total(&self) -> usize {
        JobState::ALL.iter().map(|state| self.get(*state)).sum()
    }
}
