//! Run configuration.
//!
//! Everything is serde-defaulted so a config file only needs the fields it
//! changes; CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable carrying a worker's credential.
pub const CREDENTIAL_ENV: &str = "LABELER_API_KEY";

/// Error type for configuration problems. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("shard count must be at least 1 (got {0})")]
    InvalidShardCount(usize),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("no credentials found in {0}")]
    NoCredentials(PathBuf),
    #[error("missing credential: set {CREDENTIAL_ENV} or pass --credential")]
    MissingCredential,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Model tiers and call pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub fast_model: String,
    pub pro_model: String,
    /// Records per remote call.
    pub batch_size: usize,
    /// Extra attempts after the first failed call or unparsable response.
    pub max_retries: u32,
    /// Fixed wait between attempts.
    pub retry_delay_ms: u64,
    /// Wait after every remote call.
    pub request_delay_ms: u64,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Prompt template slug; the default template when unset.
    pub prompt: Option<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            fast_model: "google/gemini-2.5-flash".to_string(),
            pro_model: "google/gemini-2.5-pro".to_string(),
            batch_size: 5,
            max_retries: 2,
            retry_delay_ms: 2_000,
            request_delay_ms: 1_000,
            max_output_tokens: 4_096,
            temperature: 0.0,
            prompt: None,
        }
    }
}

/// Thresholds and weights for the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Fast-tier confidence needed to skip the Pro tier.
    pub conf_fast_accept: f64,
    /// Probability that an otherwise fast-accepted record is audited by Pro.
    pub audit_rate: f64,
    /// Minimum vote margin for a soft-voting label.
    pub margin_threshold: f64,
    pub weight_fast: f64,
    pub weight_pro: f64,
    /// Seed for the audit draw; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            conf_fast_accept: 0.985,
            audit_rate: 0.12,
            margin_threshold: 0.2,
            weight_fast: 1.0,
            weight_pro: 2.0,
            seed: None,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |field: &'static str, v: f64| {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::invalid(field, format!("{v} is outside [0, 1]")))
            }
        };
        unit("conf_fast_accept", self.conf_fast_accept)?;
        unit("audit_rate", self.audit_rate)?;
        unit("margin_threshold", self.margin_threshold)?;
        for (field, w) in [("weight_fast", self.weight_fast), ("weight_pro", self.weight_pro)] {
            if !(w.is_finite() && w > 0.0) {
                return Err(ConfigError::invalid(field, format!("{w} must be > 0")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Batches between checkpoint writes.
    pub interval_batches: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            interval_batches: 1,
        }
    }
}

/// Which CSV columns hold the id, the text and the context fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub id_column: String,
    pub text_column: String,
    pub context_columns: Vec<String>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            id_column: "record_id".to_string(),
            text_column: "text".to_string(),
            context_columns: Vec::new(),
        }
    }
}

/// What merge does with rows the engine could not label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HumanReviewPolicy {
    /// Keep the row with an empty label.
    #[default]
    Keep,
    /// Drop the row from the merged dataset.
    Exclude,
    /// Drop the row and write it to a separate review file.
    Queue,
}

// =============================================================================
// Top level
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelerConfig {
    pub classifier: ClassifierConfig,
    pub consensus: ConsensusConfig,
    pub checkpoint: CheckpointConfig,
    pub columns: ColumnConfig,
    pub human_review: HumanReviewPolicy,
}

impl LabelerConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.classifier.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.classifier.fast_model.trim().is_empty() {
            return Err(ConfigError::invalid("fast_model", "must not be empty"));
        }
        if self.classifier.pro_model.trim().is_empty() {
            return Err(ConfigError::invalid("pro_model", "must not be empty"));
        }
        if self.checkpoint.interval_batches == 0 {
            return Err(ConfigError::invalid("interval_batches", "must be at least 1"));
        }
        if self.columns.id_column.is_empty() || self.columns.text_column.is_empty() {
            return Err(ConfigError::invalid("columns", "id and text columns must be named"));
        }
        self.consensus.validate()
    }
}

/// Read a credentials file: one credential per line, blanks and `#` comments skipped.
pub fn read_credentials(path: &Path) -> Result<Vec<String>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let keys: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if keys.is_empty() {
        return Err(ConfigError::NoCredentials(path.to_path_buf()));
    }
    Ok(keys)
}
