use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use medman_core::job::queues;
use serde::Serialize;

use crate::util::{non_empty, queue_env_prefix};

pub const CONFIG_PATH_VAR: &str = "MEDMAN_CONFIG_PATH";
pub const PIPELINE_JSON_VAR: &str = "MEDMAN_PIPELINE_JSON";
pub const REDIS_PREFIX_VAR: &str = "MEDMAN_REDIS_PREFIX";
pub const BATCH_SIZE_VAR: &str = "BACKFILL_BATCH_SIZE";
pub const JITTER_VAR: &str = "PRIORITY_JITTER";

/// Older deployments name the object analysis stage after its model.
const QUEUE_ENV_ALIASES: &[(&str, &str)] =
    &[(queues::OBJECT_ANALYSIS, "OBJECT_DETECTION")];

/// Source that produced the pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ConfigSource {
    #[default]
    Default,
    /// Path given by the caller.
    Explicit(PathBuf),
    /// Path from `MEDMAN_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// Inline JSON from `MEDMAN_PIPELINE_JSON`.
    EnvInline,
    /// One of the default locations.
    File(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("built-in defaults"),
            ConfigSource::Explicit(path) => write!(f, "{}", path.display()),
            ConfigSource::EnvPath(path) => {
                write!(f, "{} (from {CONFIG_PATH_VAR})", path.display())
            }
            ConfigSource::EnvInline => f.write_str(PIPELINE_JSON_VAR),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Environment-derived configuration values, kept raw until composition so
/// invalid values can be reported as warnings.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub pipeline_json: Option<String>,
    pub redis_url: Option<String>,
    pub redis_host: Option<String>,
    pub redis_port: Option<String>,
    pub redis_prefix: Option<String>,
    pub batch_size: Option<String>,
    pub jitter: Option<String>,
    /// `(queue, variable, raw value)` for every concurrency override found.
    pub concurrency: BTreeMap<String, (String, String)>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Gather from an arbitrary lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_empty(lookup(name));

        let mut concurrency = BTreeMap::new();
        for queue in queues::ALL {
            let mut names = vec![format!(
                "{}_WORKER_CONCURRENCY",
                queue_env_prefix(queue)
            )];
            names.extend(
                QUEUE_ENV_ALIASES
                    .iter()
                    .filter(|(aliased, _)| *aliased == queue)
                    .map(|(_, alias)| format!("{alias}_WORKER_CONCURRENCY")),
            );
            // First name wins when several are set.
            if let Some((name, raw)) = names
                .into_iter()
                .find_map(|name| get(&name).map(|raw| (name, raw)))
            {
                concurrency.insert(queue.to_string(), (name, raw));
            }
        }

        Self {
            config_path: get(CONFIG_PATH_VAR).map(PathBuf::from),
            pipeline_json: get(PIPELINE_JSON_VAR),
            redis_url: get("REDIS_URL"),
            redis_host: get("REDIS_HOST"),
            redis_port: get("REDIS_PORT"),
            redis_prefix: get(REDIS_PREFIX_VAR),
            batch_size: get(BATCH_SIZE_VAR),
            jitter: get(JITTER_VAR),
            concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn concurrency_aliases_are_recognized() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OBJECT_DETECTION_WORKER_CONCURRENCY", "2"),
            ("EXIF_WORKER_CONCURRENCY", " 12 "),
            ("THUMBNAIL_WORKER_CONCURRENCY", "   "),
        ]);
        let env = EnvConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(
            env.concurrency.get(queues::OBJECT_ANALYSIS),
            Some(&(
                "OBJECT_DETECTION_WORKER_CONCURRENCY".to_string(),
                "2".to_string()
            ))
        );
        assert_eq!(
            env.concurrency.get(queues::EXIF).map(|(_, raw)| raw.as_str()),
            Some("12")
        );
        assert!(!env.concurrency.contains_key(queues::THUMBNAIL));
    }
}
