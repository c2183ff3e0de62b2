use std::fs;
use std::path::{Path, PathBuf};

use medman_core::config::PipelineConfig;
use medman_core::priority::JitterPolicy;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::error::ConfigLoadError;
use crate::sources::{
    BATCH_SIZE_VAR, ConfigSource, EnvConfig, JITTER_VAR, PIPELINE_JSON_VAR,
};
use crate::util::{parse_bool, parse_value};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("medman.toml"),
        PathBuf::from("medman.json"),
        PathBuf::from("config/medman.toml"),
        PathBuf::from("config/medman.json"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Result of a load: the effective configuration plus where it came from.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: PipelineConfig,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
    /// Environment values that were present but ignored.
    pub warnings: Vec<String>,
}

/// Loads [`PipelineConfig`].
///
/// Order of precedence, lowest first:
/// 1. built-in defaults,
/// 2. one configuration document: the explicit path, `$MEDMAN_CONFIG_PATH`,
///    inline `$MEDMAN_PIPELINE_JSON`, or the first default location found,
/// 3. environment overrides (`REDIS_URL`, `REDIS_HOST`/`REDIS_PORT`,
///    `<QUEUE>_WORKER_CONCURRENCY`, `BACKFILL_BATCH_SIZE`, ...).
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load the env file (if any) into the process environment, then compose
    /// the configuration from the process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let mut load = self.load_from_env(EnvConfig::gather())?;
        load.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Compose the configuration from already gathered environment values.
    pub fn load_from_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (mut config, source) = self.load_document(&env)?;
        debug!(source = %source, "pipeline configuration document resolved");

        let warnings = apply_env_overrides(&mut config, &env);
        for warning in &warnings {
            warn!("{warning}");
        }

        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded: false,
            warnings,
        })
    }

    fn load_document(
        &self,
        env: &EnvConfig,
    ) -> Result<(PipelineConfig, ConfigSource), ConfigLoadError> {
        if let Some(path) = &self.options.config_path {
            let config = read_required(path)?;
            return Ok((config, ConfigSource::Explicit(path.clone())));
        }

        if let Some(path) = &env.config_path {
            let config = read_required(path)?;
            return Ok((config, ConfigSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &env.pipeline_json {
            let config = serde_json::from_str(raw).map_err(|source| {
                ConfigLoadError::Json {
                    origin: PIPELINE_JSON_VAR.to_string(),
                    source,
                }
            })?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = DEFAULT_CONFIG_LOCATIONS
            .iter()
            .find(|candidate| candidate.exists())
        {
            let config = read_required(path)?;
            return Ok((config, ConfigSource::File(path.clone())));
        }

        Ok((PipelineConfig::default(), ConfigSource::Default))
    }
}

fn read_required(path: &Path) -> Result<PipelineConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&contents).map_err(|source| {
            ConfigLoadError::Parse {
                path: path.to_path_buf(),
                source,
            }
        }),
        Some("json") => serde_json::from_str(&contents).map_err(|source| {
            ConfigLoadError::Json {
                origin: path.display().to_string(),
                source,
            }
        }),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Parse a document of unknown format, trying TOML first, then JSON.
pub fn parse_from_str(
    contents: &str,
    origin: &str,
) -> Result<PipelineConfig, ConfigLoadError> {
    toml::from_str(contents).or_else(|toml| {
        serde_json::from_str(contents).map_err(|json| ConfigLoadError::Format {
            origin: origin.to_string(),
            toml,
            json,
        })
    })
}

/// Apply environment overrides, returning a warning for each value ignored.
fn apply_env_overrides(config: &mut PipelineConfig, env: &EnvConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if let Some(url) = &env.redis_url {
        config.redis.url = url.clone();
    } else if env.redis_host.is_some() || env.redis_port.is_some() {
        let host = env.redis_host.as_deref().unwrap_or("localhost");
        let port = match env.redis_port.as_deref().map(parse_value::<u16>) {
            Some(Ok(port)) => port,
            Some(Err(raw)) => {
                warnings.push(format!("ignoring REDIS_PORT={raw}: not a port number"));
                6379
            }
            None => 6379,
        };
        config.redis.url = format!("redis://{host}:{port}");
    }

    if let Some(prefix) = &env.redis_prefix {
        config.redis.key_prefix = prefix.clone();
    }

    if let Some(raw) = &env.batch_size {
        match parse_value::<usize>(raw) {
            Ok(size) if size > 0 => config.backfill.batch_size = size,
            _ => warnings.push(format!(
                "ignoring {BATCH_SIZE_VAR}={raw}: expected a positive integer"
            )),
        }
    }

    if let Some(raw) = &env.jitter {
        match parse_jitter(raw) {
            Some(policy) => config.jitter = policy,
            None => warnings.push(format!(
                "ignoring {JITTER_VAR}={raw}: expected on, off or a numeric seed"
            )),
        }
    }

    for (queue, (name, raw)) in &env.concurrency {
        match parse_value::<usize>(raw) {
            Ok(concurrency) => config.queue_mut(queue).concurrency = Some(concurrency),
            Err(raw) => warnings.push(format!(
                "ignoring {name}={raw}: expected a non-negative integer"
            )),
        }
    }

    warnings
}

fn parse_jitter(raw: &str) -> Option<JitterPolicy> {
    match parse_bool(raw) {
        Some(true) => return Some(JitterPolicy::Entropy),
        Some(false) => return Some(JitterPolicy::Disabled),
        None => {}
    }
    match raw.trim().to_ascii_lowercase().as_str() {
        "entropy" => Some(JitterPolicy::Entropy),
        "disabled" => Some(JitterPolicy::Disabled),
        other => other.parse::<u64>().ok().map(JitterPolicy::Seeded),
    }
}
