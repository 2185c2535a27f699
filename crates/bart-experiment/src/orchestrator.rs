//! Multi-participant orchestration.
//!
//! Every participant runs its own `ExperimentRunner` concurrently against the
//! one shared threshold schedule. A participant that fails to start or to
//! finish is logged and left out of aggregation; its siblings keep running.
//! Structural problems (no participants, bad schedule, bad task bounds) fail
//! the whole call before anything is scheduled.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info};
use uuid::Uuid;

use crate::client::{DecisionClient, OpenRouterClient};
use crate::config::{ConfigError, ExperimentConfig, TrialConfig};
use crate::experiment::ExperimentRunner;
use crate::results::{ExperimentResults, ParticipantFailure, ParticipantRun};
use crate::schedule::{ScheduleError, ThresholdSchedule};
use crate::status::ExperimentStatus;
use crate::trial::{CancellationFlag, DEFAULT_DECISION_ATTEMPTS, TrialOutcome};

/// Structural errors that stop a run before any work starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no participants to run")]
    NoParticipants,

    #[error("participant {0} listed more than once")]
    DuplicateParticipant(String),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Builds the decision client for a participant.
pub trait ClientFactory: Send + Sync {
    fn build(&self, participant: &str) -> Result<Arc<dyn DecisionClient>>;
}

impl<F> ClientFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn DecisionClient>> + Send + Sync,
{
    fn build(&self, participant: &str) -> Result<Arc<dyn DecisionClient>> {
        self(participant)
    }
}

/// Builds `OpenRouterClient`s from the experiment configuration.
pub struct OpenRouterFactory {
    config: ExperimentConfig,
}

impl OpenRouterFactory {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for OpenRouterFactory {
    fn build(&self, participant: &str) -> Result<Arc<dyn DecisionClient>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(participant.to_string()))?;
        let client = OpenRouterClient::new(
            &self.config.endpoint,
            api_key,
            participant,
            self.config.request_timeout(),
            self.config.retry_policy(),
        )?;
        Ok(Arc::new(client))
    }
}

/// Task parameters common to every participant.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskParameters {
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub reward_per_step: f64,
    pub max_decision_attempts: u32,
}

impl Default for TaskParameters {
    fn default() -> Self {
        Self {
            min_threshold: 1,
            max_threshold: 20,
            reward_per_step: 0.10,
            max_decision_attempts: DEFAULT_DECISION_ATTEMPTS,
        }
    }
}

impl From<&ExperimentConfig> for TaskParameters {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            min_threshold: config.min_threshold,
            max_threshold: config.max_threshold,
            reward_per_step: config.reward_per_step,
            max_decision_attempts: config.max_decision_attempts,
        }
    }
}

/// Runs many participants against one schedule and merges their results.
pub struct MultiSubjectOrchestrator<F: ClientFactory> {
    factory: F,
    params: TaskParameters,
    cancel: CancellationFlag,
    status: ExperimentStatus,
}

impl<F: ClientFactory> MultiSubjectOrchestrator<F> {
    pub fn new(factory: F, params: TaskParameters) -> Self {
        Self {
            factory,
            params,
            cancel: CancellationFlag::new(),
            status: ExperimentStatus::new(),
        }
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Publish progress into a caller-owned status handle.
    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> &ExperimentStatus {
        &self.status
    }

    fn validate(
        &self,
        participants: &[String],
        schedule: &ThresholdSchedule,
    ) -> Result<(), OrchestratorError> {
        if participants.is_empty() {
            return Err(OrchestratorError::NoParticipants);
        }
        let mut seen = HashSet::new();
        for participant in participants {
            if !seen.insert(participant.as_str()) {
                return Err(OrchestratorError::DuplicateParticipant(participant.clone()));
            }
        }
        let probe = TrialConfig::new(
            self.params.min_threshold,
            self.params.max_threshold,
            self.params.reward_per_step,
            "",
        )?;
        schedule.validate_for(&probe)?;
        Ok(())
    }

    async fn run_participant(
        &self,
        participant: &str,
        schedule: &ThresholdSchedule,
    ) -> Result<Vec<TrialOutcome>> {
        self.status.participant_started(participant).await;
        let config = Arc::new(TrialConfig::new(
            self.params.min_threshold,
            self.params.max_threshold,
            self.params.reward_per_step,
            participant,
        )?);
        let client = self.factory.build(participant)?;

        info!(participant = %participant, trials = schedule.len(), "Starting participant");
        ExperimentRunner::new(config, client)
            .with_max_decision_attempts(self.params.max_decision_attempts)
            .with_cancellation(self.cancel.clone())
            .with_status(self.status.clone())
            .run(schedule)
            .await
    }

    /// Run every participant concurrently and aggregate.
    pub async fn run(
        &self,
        participants: &[String],
        schedule: &ThresholdSchedule,
    ) -> Result<ExperimentResults, OrchestratorError> {
        self.validate(participants, schedule)?;

        let started_at = Utc::now();
        info!(
            participants = participants.len(),
            thresholds = ?schedule.as_slice(),
            "Shared thresholds for all participants"
        );
        self.status.begin(participants, schedule.len()).await;

        let futures = participants.iter().map(|participant| async move {
            let result = self.run_participant(participant, schedule).await;
            let error = result.as_ref().err().map(|e| format!("{e:#}"));
            self.status.participant_finished(participant, error).await;
            (participant.clone(), result)
        });
        let finished = join_all(futures).await;

        let mut runs = Vec::new();
        let mut failures = Vec::new();
        for (participant, result) in finished {
            match result {
                Ok(outcomes) => {
                    info!(participant = %participant, "Done running participant");
                    runs.push(ParticipantRun {
                        participant,
                        outcomes,
                    });
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    error!(participant = %participant, error = %reason, "Participant failed");
                    failures.push(ParticipantFailure {
                        participant,
                        reason,
                    });
                }
            }
        }

        self.status.finish().await;

        let mut results = ExperimentResults {
            run_id: Uuid::new_v4(),
            started_at,
            ended_at: Utc::now(),
            min_threshold: self.params.min_threshold,
            max_threshold: self.params.max_threshold,
            reward_per_step: self.params.reward_per_step,
            schedule: schedule.clone(),
            runs,
            failures,
            summaries: Vec::new(),
            trend: Vec::new(),
        };
        results.compute_summary();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_requires_credential() {
        let factory = OpenRouterFactory::new(ExperimentConfig::default());
        let err = factory.build("openai/gpt-4o").err().unwrap();
        assert!(err.to_string().contains("openai/gpt-4o"));

        let factory = OpenRouterFactory::new(ExperimentConfig {
            api_key: Some("key".to_string()),
            ..Default::default()
        });
        assert!(factory.build("openai/gpt-4o").is_ok());
    }

    #[test]
    fn test_parameters_from_config() {
        let config = ExperimentConfig {
            min_threshold: 2,
            max_threshold: 4,
            reward_per_step: 0.5,
            ..Default::default()
        };
        let params = TaskParameters::from(&config);
        assert_eq!(params.min_threshold, 2);
        assert_eq!(params.max_threshold, 4);
        assert_eq!(params.max_decision_attempts, 3);
    }
}
