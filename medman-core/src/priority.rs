//! Priority scoring for backfill submissions.
//!
//! Smaller files are favored through an inverse-log curve so that a handful of
//! very large files cannot drive the score to pathological values. Fixed
//! bonuses reward items that need no conversion or already have the artifact
//! the stage depends on, and a small jitter spreads ties across workers.

use std::fmt;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::catalog::MediaAttributes;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Tunable weights for one queue's scoring curve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityProfile {
    /// Score of a zero-megabyte file before bonuses.
    pub base: f64,
    /// Points lost per decade of file size in megabytes.
    pub size_factor: f64,
    /// Added when the format can be processed without conversion.
    pub native_bonus: f64,
    /// Added when the prerequisite artifact (e.g. a thumbnail) exists.
    pub prerequisite_bonus: f64,
    /// Upper bound (exclusive) of the random tie-breaker.
    pub jitter_max: f64,
}

impl Default for PriorityProfile {
    fn default() -> Self {
        Self {
            base: 100.0,
            size_factor: 30.0,
            native_bonus: 0.0,
            prerequisite_bonus: 0.0,
            jitter_max: 5.0,
        }
    }
}

impl PriorityProfile {
    pub fn thumbnail() -> Self {
        Self {
            native_bonus: 15.0,
            ..Self::default()
        }
    }

    pub fn visual_hash() -> Self {
        Self {
            prerequisite_bonus: 20.0,
            ..Self::default()
        }
    }

    /// Score before jitter and rounding.
    pub fn raw_score(&self, attrs: &MediaAttributes) -> f64 {
        let mut score = 0.0;
        if let Some(size) = attrs.size_bytes.filter(|size| *size > 0) {
            let size_mb = size as f64 / BYTES_PER_MB;
            score += (self.base - (size_mb + 1.0).log10() * self.size_factor)
                .max(0.0);
        }
        if attrs.is_native {
            score += self.native_bonus;
        }
        if attrs.has_prerequisite {
            score += self.prerequisite_bonus;
        }
        score
    }
}

/// Source of the random tie-breaker.
pub enum JitterSource {
    Disabled,
    Seeded(Mutex<StdRng>),
    Entropy,
}

impl JitterSource {
    pub fn seeded(seed: u64) -> Self {
        JitterSource::Seeded(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    /// Uniform sample in `[0, max)`; zero when disabled or when `max` is not
    /// a positive finite number.
    pub fn sample(&self, max: f64) -> f64 {
        if !max.is_finite() || max <= 0.0 {
            return 0.0;
        }
        match self {
            JitterSource::Disabled => 0.0,
            JitterSource::Seeded(rng) => {
                let mut rng = match rng.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                rng.random_range(0.0..max)
            }
            JitterSource::Entropy => rand::rng().random_range(0.0..max),
        }
    }
}

impl fmt::Debug for JitterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitterSource::Disabled => f.write_str("Disabled"),
            JitterSource::Seeded(_) => f.write_str("Seeded"),
            JitterSource::Entropy => f.write_str("Entropy"),
        }
    }
}

/// How new jitter sources are made for each scoring pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    Disabled,
    /// Every pass replays the same sequence.
    Seeded(u64),
    #[default]
    Entropy,
}

impl JitterPolicy {
    pub fn source(&self) -> JitterSource {
        match self {
            JitterPolicy::Disabled => JitterSource::Disabled,
            JitterPolicy::Seeded(seed) => JitterSource::seeded(*seed),
            JitterPolicy::Entropy => JitterSource::Entropy,
        }
    }
}

/// Pairs a profile with its jitter source.
#[derive(Debug)]
pub struct PriorityScorer {
    profile: PriorityProfile,
    jitter: JitterSource,
}

impl PriorityScorer {
    pub fn new(profile: PriorityProfile, jitter: JitterSource) -> Self {
        Self { profile, jitter }
    }

    /// Deterministic scorer, used by tests and dry runs.
    pub fn without_jitter(profile: PriorityProfile) -> Self {
        Self::new(profile, JitterSource::Disabled)
    }

    pub fn profile(&self) -> &PriorityProfile {
        &self.profile
    }

    pub fn score(&self, attrs: &MediaAttributes) -> i64 {
        let jitter = self.jitter.sample(self.profile.jitter_max);
        (self.profile.raw_score(attrs) + jitter).round() as i64
    }
}
