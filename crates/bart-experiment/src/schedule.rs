//! Shared threshold schedule.
//!
//! One schedule is drawn per experiment and read by every participant, so
//! that trial `i` has the same burst threshold for all models.

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::TrialConfig;

/// Problems with an externally supplied schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("schedule is empty")]
    Empty,

    #[error("threshold {value} at trial {index} is outside [{min}, {max}]")]
    OutOfBounds {
        index: usize,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// Ordered burst thresholds, one per trial index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSchedule {
    thresholds: Vec<u32>,
}

impl ThresholdSchedule {
    /// Draw `num_trials` thresholds uniformly from `[min, max]`.
    ///
    /// With a seed the schedule is reproducible.
    pub fn generate(min: u32, max: u32, num_trials: usize, seed: Option<u64>) -> Self {
        let mut rng: Box<dyn RngCore> = match seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(rand::rng()),
        };
        let (lo, hi) = if max < min { (max, min) } else { (min, max) };
        let thresholds = (0..num_trials).map(|_| rng.random_range(lo..=hi)).collect();
        Self { thresholds }
    }

    /// Wrap an externally supplied sequence.
    pub fn from_thresholds(thresholds: Vec<u32>) -> Result<Self, ScheduleError> {
        if thresholds.is_empty() {
            return Err(ScheduleError::Empty);
        }
        Ok(Self { thresholds })
    }

    /// Check every threshold against a participant's bounds.
    pub fn validate_for(&self, config: &TrialConfig) -> Result<(), ScheduleError> {
        if self.thresholds.is_empty() {
            return Err(ScheduleError::Empty);
        }
        for (index, &value) in self.thresholds.iter().enumerate() {
            if !config.accepts_threshold(value) {
                return Err(ScheduleError::OutOfBounds {
                    index,
                    value,
                    min: config.min_threshold,
                    max: config.max_threshold,
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        self.thresholds.get(index).copied()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.thresholds
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.thresholds.iter().copied()
    }
}
