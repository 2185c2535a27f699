//! Results collection and aggregate statistics for BART experiments.
//!
//! Captures metrics like:
//! - Mean steps, and mean steps on balloons that did not burst ("adjusted")
//! - Burst rate
//! - Mean and total earnings
//! - Per-trial-index trend across participants
//!
//! Summaries are pure functions of an outcome list and are recomputed on
//! demand; nothing here is updated incrementally.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::round_cents;
use crate::schedule::ThresholdSchedule;
use crate::trial::TrialOutcome;

/// Tag of the summary pooled over every participant.
pub const POOLED_TAG: &str = "ALL";

/// Aggregate statistics for one participant (or the pooled set).
///
/// Behavioral statistics cover completed trials only; failed trials are
/// counted in `total_trials` and `failed_trials`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub participant: String,
    pub total_trials: usize,
    pub failed_trials: usize,
    pub avg_steps: f64,
    /// Mean steps over trials that did not burst
    pub adjusted_steps: f64,
    pub burst_rate: f64,
    pub avg_earnings: f64,
    pub total_earnings: f64,
    pub min_steps: u32,
    pub max_steps: u32,
    /// Sample standard deviation of steps
    pub std_steps: f64,
    pub steps_when_burst: f64,
    pub steps_when_stopped: f64,
}

impl ParticipantSummary {
    pub fn completed_trials(&self) -> usize {
        self.total_trials - self.failed_trials
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Summarize a participant's outcomes.
pub fn summarize<'a>(
    participant: &str,
    outcomes: impl IntoIterator<Item = &'a TrialOutcome>,
) -> ParticipantSummary {
    let mut total_trials = 0;
    let mut completed = Vec::new();
    for outcome in outcomes {
        total_trials += 1;
        if !outcome.is_failed() {
            completed.push(outcome);
        }
    }

    let steps: Vec<f64> = completed.iter().map(|o| o.steps_attempted as f64).collect();
    let burst_steps: Vec<f64> = completed
        .iter()
        .filter(|o| o.burst)
        .map(|o| o.steps_attempted as f64)
        .collect();
    let stopped_steps: Vec<f64> = completed
        .iter()
        .filter(|o| !o.burst)
        .map(|o| o.steps_attempted as f64)
        .collect();
    let earnings: Vec<f64> = completed.iter().map(|o| o.earnings).collect();

    let n = steps.len() as f64;
    let avg_steps = mean(&steps);
    let std_steps = if steps.len() > 1 {
        let variance = steps.iter().map(|s| (s - avg_steps).powi(2)).sum::<f64>() / (n - 1.0);
        variance.sqrt()
    } else {
        0.0
    };
    let burst_rate = if completed.is_empty() {
        0.0
    } else {
        burst_steps.len() as f64 / n
    };

    ParticipantSummary {
        participant: participant.to_string(),
        total_trials,
        failed_trials: total_trials - completed.len(),
        avg_steps,
        adjusted_steps: mean(&stopped_steps),
        burst_rate,
        avg_earnings: mean(&earnings),
        total_earnings: round_cents(earnings.iter().sum()),
        min_steps: completed.iter().map(|o| o.steps_attempted).min().unwrap_or(0),
        max_steps: completed.iter().map(|o| o.steps_attempted).max().unwrap_or(0),
        std_steps,
        steps_when_burst: mean(&burst_steps),
        steps_when_stopped: mean(&stopped_steps),
    }
}

/// Behavior at one trial index, averaged over participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub trial_index: usize,
    pub participants: usize,
    pub avg_steps: f64,
    pub burst_rate: f64,
    pub avg_earnings: f64,
}

/// Per-trial-index trend over completed trials.
pub fn learning_trend<'a>(outcomes: impl IntoIterator<Item = &'a TrialOutcome>) -> Vec<TrendPoint> {
    let mut by_index: BTreeMap<usize, Vec<&TrialOutcome>> = BTreeMap::new();
    for outcome in outcomes.into_iter().filter(|o| !o.is_failed()) {
        by_index.entry(outcome.trial_index).or_default().push(outcome);
    }

    by_index
        .into_iter()
        .map(|(trial_index, group)| {
            let n = group.len() as f64;
            TrendPoint {
                trial_index,
                participants: group.len(),
                avg_steps: group.iter().map(|o| o.steps_attempted as f64).sum::<f64>() / n,
                burst_rate: group.iter().filter(|o| o.burst).count() as f64 / n,
                avg_earnings: group.iter().map(|o| o.earnings).sum::<f64>() / n,
            }
        })
        .collect()
}

/// All trials of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRun {
    pub participant: String,
    pub outcomes: Vec<TrialOutcome>,
}

/// A participant excluded from aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantFailure {
    pub participant: String,
    pub reason: String,
}

/// One outcome tagged with its participant.
#[derive(Debug, Clone, Copy)]
pub struct TaggedOutcome<'a> {
    pub participant: &'a str,
    pub outcome: &'a TrialOutcome,
}

/// Results of a multi-participant experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub reward_per_step: f64,
    /// Thresholds every participant ran against
    pub schedule: ThresholdSchedule,
    pub runs: Vec<ParticipantRun>,
    pub failures: Vec<ParticipantFailure>,
    /// Per-participant summaries followed by the pooled `ALL` summary
    #[serde(default)]
    pub summaries: Vec<ParticipantSummary>,
    #[serde(default)]
    pub trend: Vec<TrendPoint>,
}

impl ExperimentResults {
    /// Recompute summaries and trend from the collected runs.
    pub fn compute_summary(&mut self) {
        let mut summaries: Vec<ParticipantSummary> = self
            .runs
            .iter()
            .map(|run| summarize(&run.participant, &run.outcomes))
            .collect();
        summaries.push(summarize(POOLED_TAG, self.rows().map(|row| row.outcome)));
        self.summaries = summaries;
        self.trend = learning_trend(self.rows().map(|row| row.outcome));
    }

    /// Every outcome tagged with its participant, in participant order.
    pub fn rows(&self) -> impl Iterator<Item = TaggedOutcome<'_>> {
        self.runs.iter().flat_map(|run| {
            run.outcomes.iter().map(move |outcome| TaggedOutcome {
                participant: &run.participant,
                outcome,
            })
        })
    }

    pub fn run_for(&self, participant: &str) -> Option<&ParticipantRun> {
        self.runs.iter().find(|r| r.participant == participant)
    }

    pub fn summary_for(&self, participant: &str) -> Option<&ParticipantSummary> {
        self.summaries.iter().find(|s| s.participant == participant)
    }

    pub fn pooled(&self) -> Option<&ParticipantSummary> {
        self.summary_for(POOLED_TAG)
    }

    /// Save results to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load results from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let results = serde_json::from_str(&json)?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;

    fn outcome(index: usize, threshold: u32, steps: u32, burst: bool) -> TrialOutcome {
        let mut decisions = vec![Decision::Continue; steps as usize];
        if !burst {
            decisions.push(Decision::Stop);
        }
        TrialOutcome {
            trial_index: index,
            threshold,
            steps_attempted: steps,
            burst,
            earnings: if burst { 0.0 } else { round_cents(steps as f64 * 0.10) },
            raw_responses: decisions.iter().map(|d| d.label().to_string()).collect(),
            decisions,
            error_reason: None,
            invalid_responses: vec![],
        }
    }

    #[test]
    fn test_summary_statistics() {
        let outcomes = vec![
            outcome(0, 5, 5, true),
            outcome(1, 8, 3, false),
            outcome(2, 9, 1, false),
            TrialOutcome::failed(3, 4, "no valid response after retries", vec![]),
        ];
        let summary = summarize("m", &outcomes);

        assert_eq!(summary.total_trials, 4);
        assert_eq!(summary.failed_trials, 1);
        assert_eq!(summary.completed_trials(), 3);
        assert!((summary.avg_steps - 3.0).abs() < 1e-9);
        assert!((summary.adjusted_steps - 2.0).abs() < 1e-9);
        assert!((summary.burst_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.total_earnings, 0.4);
        assert!((summary.avg_earnings - 0.4 / 3.0).abs() < 1e-9);
        assert_eq!(summary.min_steps, 1);
        assert_eq!(summary.max_steps, 5);
        assert!((summary.std_steps - 2.0).abs() < 1e-9);
        assert!((summary.steps_when_burst - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_is_pure() {
        let outcomes = vec![outcome(0, 5, 2, false), outcome(1, 2, 2, true)];
        assert_eq!(summarize("m", &outcomes), summarize("m", &outcomes));
    }

    #[test]
    fn test_empty_summary() {
        let summary = summarize("m", &[]);
        assert_eq!(summary.total_trials, 0);
        assert_eq!(summary.avg_steps, 0.0);
        assert_eq!(summary.burst_rate, 0.0);
    }

    #[test]
    fn test_learning_trend() {
        let a = vec![outcome(0, 4, 4, true), outcome(1, 6, 2, false)];
        let b = vec![outcome(0, 4, 2, false), outcome(1, 6, 4, false)];
        let trend = learning_trend(a.iter().chain(b.iter()));

        assert_eq!(trend.len(), 2);
        assert_eq!(trend[0].participants, 2);
        assert!((trend[0].avg_steps - 3.0).abs() < 1e-9);
        assert!((trend[0].burst_rate - 0.5).abs() < 1e-9);
        assert!((trend[1].avg_earnings - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_results_pooled_summary() {
        let mut results = ExperimentResults {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            min_threshold: 1,
            max_threshold: 10,
            reward_per_step: 0.10,
            schedule: ThresholdSchedule::from_thresholds(vec![4, 6]).unwrap(),
            runs: vec![
                ParticipantRun {
                    participant: "a".to_string(),
                    outcomes: vec![outcome(0, 4, 4, true), outcome(1, 6, 2, false)],
                },
                ParticipantRun {
                    participant: "b".to_string(),
                    outcomes: vec![outcome(0, 4, 1, false), outcome(1, 6, 3, false)],
                },
            ],
            failures: vec![],
            summaries: vec![],
            trend: vec![],
        };
        results.compute_summary();

        assert_eq!(results.summaries.len(), 3);
        assert_eq!(results.summaries.last().unwrap().participant, POOLED_TAG);
        let pooled = results.pooled().unwrap();
        assert_eq!(pooled.total_trials, 4);
        assert!((pooled.burst_rate - 0.25).abs() < 1e-9);
        assert_eq!(results.summary_for("b").unwrap().total_earnings, 0.4);
        assert_eq!(results.rows().count(), 4);
        assert_eq!(results.trend.len(), 2);
    }
}
