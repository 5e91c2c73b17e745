//! Engine configuration
//!
//! Loaded from TOML (explicit path or the user config dir), then overridden
//! by `STREAMLINE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Prefix for environment overrides
const ENV_PREFIX: &str = "STREAMLINE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    Env { key: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dedup: DedupConfig,
    pub output: OutputConfig,
    pub sessions: SessionConfig,
    pub blocks: BlockConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Number of distinct recent contents kept for comparison
    pub window_size: usize,
    /// Similarity above which two contents count as duplicates
    pub similarity_threshold: f64,
    /// Longest content (chars) the edit-distance check will look at
    pub max_edit_distance_len: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            similarity_threshold: 0.85,
            max_edit_distance_len: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Minimum time between two UI emissions
    pub update_interval_ms: u64,
    /// Minimum number of new chars before an emission
    pub min_chunk_chars: usize,
    /// Hard cap on accumulated chars
    pub max_chars: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 100,
            min_chunk_chars: 10,
            max_chars: 500_000,
        }
    }
}

impl OutputConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tear down the previous session's streams on channel switch
    pub strict_isolation: bool,
    /// Processor cache ceiling before the GC sweep kicks in
    pub max_cached_processors: usize,
    /// How long a finished processor stays around for late UI drains
    pub completed_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strict_isolation: true,
            max_cached_processors: 64,
            completed_grace_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn completed_grace(&self) -> Duration {
        Duration::from_millis(self.completed_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// LaTeX commands per char above which an untagged fence is math
    pub latex_density_threshold: f64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            latex_density_threshold: 0.04,
        }
    }
}

impl EngineConfig {
    /// Default config file location (`<config_dir>/streamline/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("streamline").join("config.toml"))
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path`, or from the default location if it exists, then
    /// apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                info!("Loading config from {:?}", path);
                Self::from_file(path)?
            }
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => {
                    info!("Loading config from {:?}", default);
                    Self::from_file(&default)?
                }
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `STREAMLINE_*` overrides from an iterator of (key, value)
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "DEDUP_WINDOW" => self.dedup.window_size = parse_env(&key, &value)?,
                "SIMILARITY_THRESHOLD" => {
                    self.dedup.similarity_threshold = parse_env(&key, &value)?
                }
                "MAX_EDIT_DISTANCE_LEN" => {
                    self.dedup.max_edit_distance_len = parse_env(&key, &value)?
                }
                "UPDATE_INTERVAL_MS" => self.output.update_interval_ms = parse_env(&key, &value)?,
                "MIN_CHUNK_CHARS" => self.output.min_chunk_chars = parse_env(&key, &value)?,
                "MAX_CHARS" => self.output.max_chars = parse_env(&key, &value)?,
                "STRICT_ISOLATION" => self.sessions.strict_isolation = parse_env(&key, &value)?,
                "MAX_CACHED_PROCESSORS" => {
                    self.sessions.max_cached_processors = parse_env(&key, &value)?
                }
                "COMPLETED_GRACE_MS" => {
                    self.sessions.completed_grace_ms = parse_env(&key, &value)?
                }
                "LATEX_DENSITY_THRESHOLD" => {
                    self.blocks.latex_density_threshold = parse_env(&key, &value)?
                }
                _ => warn!("Ignoring unknown config override {}", key),
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}
