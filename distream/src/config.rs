//! Stream configuration
//!
//! A closed configuration type with explicit defaults. Values can come from
//! code, a TOML document, or `DISTREAM_*` environment variables.
//!
//! ```toml
//! redundancy = 3
//! high_water_mark = 64
//!
//! [distribution]
//! type = "adaptive"
//! size = 50
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default batch size for `chunk` and the history-less `adaptive` fallback.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default output buffering threshold.
pub const DEFAULT_HIGH_WATER_MARK: usize = 100;

/// Error type for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Redundancy must be at least 1, got {0}")]
    InvalidRedundancy(u32),

    #[error("Chunk size must be at least 1, got {0}")]
    InvalidChunkSize(usize),

    #[error("High water mark must be at least 1, got {0}")]
    InvalidHighWaterMark(usize),

    #[error("Invalid distribution type: {0}")]
    InvalidDistribution(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Batch sizing policy used by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Distribution {
    /// One item per batch.
    Single,
    /// A fixed number of items per batch.
    Chunk {
        #[serde(default = "default_chunk_size")]
        size: usize,
    },
    /// Batch size scaled by each worker's speed relative to the fleet.
    /// `size` is used until a worker has completed a batch.
    Adaptive {
        #[serde(default = "default_chunk_size")]
        size: usize,
    },
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Distribution {
    /// Chunk distribution with an explicit size.
    pub fn chunk(size: usize) -> Self {
        Self::Chunk { size }
    }

    /// Adaptive distribution with the default fallback size.
    pub fn adaptive() -> Self {
        Self::Adaptive {
            size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Configured fallback size (1 for `single`).
    pub fn size(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Chunk { size } | Self::Adaptive { size } => *size,
        }
    }

    /// Same policy with a different size. `single` ignores the size.
    pub fn with_size(self, size: usize) -> Self {
        match self {
            Self::Single => Self::Single,
            Self::Chunk { .. } => Self::Chunk { size },
            Self::Adaptive { .. } => Self::Adaptive { size },
        }
    }

    /// Short policy name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Chunk { .. } => "chunk",
            Self::Adaptive { .. } => "adaptive",
        }
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self::Chunk {
            size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Chunk { size } => write!(f, "chunk({size})"),
            Self::Adaptive { size } => write!(f, "adaptive({size})"),
        }
    }
}

impl FromStr for Distribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "chunk" => Ok(Self::default()),
            "adaptive" => Ok(Self::adaptive()),
            other => Err(ConfigError::InvalidDistribution(other.to_string())),
        }
    }
}

/// Configuration for a distributed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Vote margin the leading result needs over the runner-up.
    pub redundancy: u32,
    /// Batch sizing policy.
    pub distribution: Distribution,
    /// Output values buffered before the consumer is considered saturated.
    pub high_water_mark: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            redundancy: 1,
            distribution: Distribution::default(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl StreamConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `DISTREAM_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Overlay `DISTREAM_*` environment variables on this config, then
    /// validate. `DISTREAM_CHUNK_SIZE` applies after `DISTREAM_DISTRIBUTION`.
    pub fn with_env_overrides(self) -> ConfigResult<Self> {
        let mut config = self;

        if let Ok(value) = std::env::var("DISTREAM_REDUNDANCY") {
            config.redundancy = parse_env("DISTREAM_REDUNDANCY", &value)?;
        }
        if let Ok(value) = std::env::var("DISTREAM_DISTRIBUTION") {
            config.distribution = value.parse()?;
        }
        if let Ok(value) = std::env::var("DISTREAM_CHUNK_SIZE") {
            let size = parse_env("DISTREAM_CHUNK_SIZE", &value)?;
            config.distribution = config.distribution.with_size(size);
        }
        if let Ok(value) = std::env::var("DISTREAM_HIGH_WATER_MARK") {
            config.high_water_mark = parse_env("DISTREAM_HIGH_WATER_MARK", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the required vote margin.
    pub fn with_redundancy(mut self, redundancy: u32) -> Self {
        self.redundancy = redundancy;
        self
    }

    /// Set the batch sizing policy.
    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Set the output buffering threshold.
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.redundancy == 0 {
            return Err(ConfigError::InvalidRedundancy(self.redundancy));
        }
        match self.distribution {
            Distribution::Single => {}
            Distribution::Chunk { size } | Distribution::Adaptive { size } => {
                if size == 0 {
                    return Err(ConfigError::InvalidChunkSize(size));
                }
            }
        }
        if self.high_water_mark == 0 {
            return Err(ConfigError::InvalidHighWaterMark(self.high_water_mark));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
