//! Configuration types for BART experiments.
//!
//! `ExperimentConfig` is the file-level configuration (YAML), and
//! `TrialConfig` is the immutable per-participant view that every trial of a
//! run reads from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::RetryPolicy;
use crate::schedule::{ScheduleError, ThresholdSchedule};

/// Default chat-completions endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Structural configuration errors. These fail a run before any trial starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("min_threshold must be at least 1 (got {0})")]
    MinThresholdTooLow(u32),

    #[error("max_threshold {max} is below min_threshold {min}")]
    InvertedBounds { min: u32, max: u32 },

    #[error("reward_per_step must be a non-negative number (got {0})")]
    InvalidReward(f64),

    #[error("num_trials must be at least 1")]
    NoTrials,

    #[error("no API credential configured for participant {0}")]
    MissingCredential(String),
}

/// Top-level experiment configuration.
///
/// Legacy `bart_config.yaml` key names (`min_pumps`,
/// `model_list`, ...) are accepted as aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Smallest possible burst threshold (inclusive)
    #[serde(alias = "min_pumps")]
    pub min_threshold: u32,

    /// Largest possible burst threshold (inclusive)
    #[serde(alias = "max_pumps")]
    pub max_threshold: u32,

    /// Money earned per successful step
    #[serde(alias = "reward_per_pump")]
    pub reward_per_step: f64,

    /// Number of trials (balloons) per participant
    #[serde(alias = "num_balloons")]
    pub num_trials: usize,

    /// Model identifiers to evaluate
    #[serde(alias = "model_list")]
    pub participants: Vec<String>,

    /// Bearer credential for the chat endpoint
    #[serde(alias = "openrouter_api_key", skip_serializing)]
    pub api_key: Option<String>,

    /// Chat-completions URL
    pub endpoint: String,

    /// Directory for result files
    pub output_dir: PathBuf,

    /// Seed for the shared threshold schedule (None for random)
    pub seed: Option<u64>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Total HTTP attempts per `send` call
    pub max_request_attempts: u32,

    /// First backoff delay in seconds
    pub backoff_base_secs: u64,

    /// Backoff growth factor per retry
    pub backoff_multiplier: u32,

    /// Longest single wait between attempts, server hints included
    pub max_retry_delay_secs: u64,

    /// Attempts to obtain a parseable decision at one decision point
    pub max_decision_attempts: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            min_threshold: 1,
            max_threshold: 20,
            reward_per_step: 0.10,
            num_trials: 5,
            participants: Vec::new(),
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            output_dir: PathBuf::from("logs"),
            seed: None,
            request_timeout_secs: 60,
            max_request_attempts: 3,
            backoff_base_secs: 5,
            backoff_multiplier: 3,
            max_retry_delay_secs: 120,
            max_decision_attempts: 3,
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file is not an error: defaults are returned and a warning is
    /// logged. An unreadable or malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse configuration from YAML text. Empty text yields defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(text)?;
        Ok(config)
    }

    /// Check the task parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_trials == 0 {
            return Err(ConfigError::NoTrials);
        }
        validate_task(self.min_threshold, self.max_threshold, self.reward_per_step)
    }

    /// Retry policy for HTTP calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_request_attempts.max(1),
            base_delay: Duration::from_secs(self.backoff_base_secs),
            multiplier: self.backoff_multiplier.max(1),
            max_delay: Duration::from_secs(self.max_retry_delay_secs),
        }
    }

    /// Build the shared schedule: explicit thresholds when given, otherwise
    /// `num_trials` draws from the configured bounds.
    ///
    /// Explicit thresholds replace `num_trials` with their count.
    pub fn threshold_schedule(
        &mut self,
        explicit: Option<Vec<u32>>,
    ) -> Result<ThresholdSchedule, ScheduleError> {
        let Some(values) = explicit else {
            return Ok(ThresholdSchedule::generate(
                self.min_threshold,
                self.max_threshold,
                self.num_trials,
                self.seed,
            ));
        };
        let schedule = ThresholdSchedule::from_thresholds(values)?;
        if schedule.len() != self.num_trials {
            warn!(
                configured = self.num_trials,
                explicit = schedule.len(),
                "Explicit thresholds override num_trials"
            );
            self.num_trials = schedule.len();
        }
        Ok(schedule)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn validate_task(min: u32, max: u32, reward: f64) -> Result<(), ConfigError> {
    if min < 1 {
        return Err(ConfigError::MinThresholdTooLow(min));
    }
    if max < min {
        return Err(ConfigError::InvertedBounds { min, max });
    }
    if !reward.is_finite() || reward < 0.0 {
        return Err(ConfigError::InvalidReward(reward));
    }
    Ok(())
}

/// Immutable parameters shared by every trial of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub reward_per_step: f64,
    pub participant_id: String,
}

impl TrialConfig {
    pub fn new(
        min_threshold: u32,
        max_threshold: u32,
        reward_per_step: f64,
        participant_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        validate_task(min_threshold, max_threshold, reward_per_step)?;
        Ok(Self {
            min_threshold,
            max_threshold,
            reward_per_step,
            participant_id: participant_id.into(),
        })
    }

    /// Whether a threshold lies inside the configured bounds.
    pub fn accepts_threshold(&self, threshold: u32) -> bool {
        (self.min_threshold..=self.max_threshold).contains(&threshold)
    }

    /// Earnings after `steps` safe steps, rounded to cents.
    pub fn earnings_for(&self, steps: u32) -> f64 {
        round_cents(steps as f64 * self.reward_per_step)
    }
}

/// Round a monetary amount to two decimals.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
