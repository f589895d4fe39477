//! Tagwise Configuration Management
//!
//! Engine settings come from environment variables, TOML files, or both,
//! with defaults that train reasonable models out of the box.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Sequence tagger shape
    pub tagger: TaggerConfig,

    /// Online learner settings shared by every trainer
    pub training: TrainingConfig,

    /// Binary relation detector settings
    pub relation: RelationConfig,

    /// Document categorizer settings
    pub categorizer: CategorizerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Tagger
        if let Some(v) = parse_env("TAGWISE_MAX_SEGMENT_LENGTH")? {
            config.tagger.max_segment_length = v;
        }
        if let Some(v) = parse_env("TAGWISE_CONTEXT_RADIUS")? {
            config.tagger.context_radius = v;
        }
        if let Some(v) = parse_env("TAGWISE_HASH_DIMENSIONS")? {
            config.tagger.hash_dimensions = v;
        }

        // Training
        if let Some(v) = parse_env("TAGWISE_MAX_EPOCHS")? {
            config.training.max_epochs = v;
        }
        if let Some(v) = parse_env("TAGWISE_LEARNING_RATE")? {
            config.training.learning_rate = v;
        }
        if let Some(v) = parse_env("TAGWISE_MARGIN")? {
            config.training.margin = v;
        }
        if let Some(v) = parse_env("TAGWISE_THREADS")? {
            config.training.thread_count = v;
        }
        if let Some(v) = parse_env("TAGWISE_BETA")? {
            config.training.beta = v;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.logging.json_format = format.eq_ignore_ascii_case("json");
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.clone(),
            message: e.to_string(),
        })?;
        config.validate()?;

        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        let env_config = Self::from_env()?;
        let tagger_default = TaggerConfig::default();
        let training_default = TrainingConfig::default();

        // Only override if env values differ from defaults
        if env_config.tagger.max_segment_length != tagger_default.max_segment_length {
            self.tagger.max_segment_length = env_config.tagger.max_segment_length;
        }
        if env_config.tagger.context_radius != tagger_default.context_radius {
            self.tagger.context_radius = env_config.tagger.context_radius;
        }
        if env_config.tagger.hash_dimensions != tagger_default.hash_dimensions {
            self.tagger.hash_dimensions = env_config.tagger.hash_dimensions;
        }
        if env_config.training.max_epochs != training_default.max_epochs {
            self.training.max_epochs = env_config.training.max_epochs;
        }
        if env_config.training.learning_rate != training_default.learning_rate {
            self.training.learning_rate = env_config.training.learning_rate;
        }
        if env_config.training.margin != training_default.margin {
            self.training.margin = env_config.training.margin;
        }
        if env_config.training.thread_count != training_default.thread_count {
            self.training.thread_count = env_config.training.thread_count;
        }
        if env_config.training.beta != training_default.beta {
            self.training.beta = env_config.training.beta;
        }
        if env_config.logging.level != LoggingConfig::default().level {
            self.logging.level = env_config.logging.level;
        }
        if env_config.logging.json_format {
            self.logging.json_format = true;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject settings no trainer or tagger can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, value: impl ToString) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }
        }

        if self.tagger.max_segment_length == 0 {
            return Err(invalid("tagger.max_segment_length", 0));
        }
        if self.tagger.hash_dimensions == 0 {
            return Err(invalid("tagger.hash_dimensions", 0));
        }
        if self.relation.hash_dimensions == 0 {
            return Err(invalid("relation.hash_dimensions", 0));
        }
        if self.categorizer.hash_dimensions == 0 {
            return Err(invalid("categorizer.hash_dimensions", 0));
        }
        if self.training.thread_count == 0 {
            return Err(invalid("training.thread_count", 0));
        }
        if !(self.training.learning_rate > 0.0 && self.training.learning_rate.is_finite()) {
            return Err(invalid(
                "training.learning_rate",
                self.training.learning_rate,
            ));
        }
        if !(self.training.margin >= 0.0 && self.training.margin.is_finite()) {
            return Err(invalid("training.margin", self.training.margin));
        }
        if !(self.training.beta >= 0.0 && self.training.beta.is_finite()) {
            return Err(invalid("training.beta", self.training.beta));
        }
        Ok(())
    }
}

/// Sequence tagger shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggerConfig {
    /// Longest entity span, in tokens, the decoder considers
    pub max_segment_length: usize,

    /// Tokens on each side folded into a token's context features
    pub context_radius: usize,

    /// Buckets for hashed lexical features
    pub hash_dimensions: usize,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            max_segment_length: 6,
            context_radius: 2,
            hash_dimensions: 1 << 16,
        }
    }
}

/// Online learner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Upper bound on passes over the training set
    pub max_epochs: usize,

    /// Step size for perceptron updates
    pub learning_rate: f64,

    /// Loss added to wrong structures during decoding
    pub margin: f64,

    /// Worker count used when a trainer is not given one explicitly
    pub thread_count: usize,

    /// Precision/recall trade-off for the entity tagger: below 1 false
    /// alarms cost more than missed entities, above 1 the reverse
    pub beta: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_epochs: 60,
            learning_rate: 1.0,
            margin: 1.0,
            thread_count: 4,
            beta: 0.5,
        }
    }
}

/// Binary relation detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationConfig {
    pub hash_dimensions: usize,
    pub max_epochs: usize,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            hash_dimensions: 100_000,
            max_epochs: 60,
        }
    }
}

/// Document categorizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizerConfig {
    pub hash_dimensions: usize,
    pub max_epochs: usize,
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            hash_dimensions: 1 << 16,
            max_epochs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
