//! Experiment runner for one participant.
//!
//! Runs one trial per schedule slot, strictly in order. A failed trial is
//! recorded and the run moves on; only structural problems (a schedule that
//! does not fit the configured bounds) abort the run.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::client::DecisionClient;
use crate::config::TrialConfig;
use crate::schedule::ThresholdSchedule;
use crate::status::ExperimentStatus;
use crate::trial::{CancellationFlag, DEFAULT_DECISION_ATTEMPTS, TrialEngine, TrialOutcome};

/// Sequential trial driver for a single participant.
pub struct ExperimentRunner {
    config: Arc<TrialConfig>,
    client: Arc<dyn DecisionClient>,
    max_decision_attempts: u32,
    cancel: CancellationFlag,
    status: Option<ExperimentStatus>,
}

impl ExperimentRunner {
    pub fn new(config: Arc<TrialConfig>, client: Arc<dyn DecisionClient>) -> Self {
        Self {
            config,
            client,
            max_decision_attempts: DEFAULT_DECISION_ATTEMPTS,
            cancel: CancellationFlag::new(),
            status: None,
        }
    }

    pub fn with_max_decision_attempts(mut self, attempts: u32) -> Self {
        self.max_decision_attempts = attempts;
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Report per-trial progress into a shared status handle.
    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn participant(&self) -> &str {
        &self.config.participant_id
    }

    /// Run every trial of the schedule and return the outcomes in order.
    pub async fn run(&self, schedule: &ThresholdSchedule) -> Result<Vec<TrialOutcome>> {
        schedule.validate_for(&self.config)?;

        let participant = self.participant();
        let total = schedule.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, threshold) in schedule.iter().enumerate() {
            let outcome = if self.cancel.is_cancelled() {
                TrialOutcome::cancelled(index, threshold)
            } else {
                info!(
                    participant = %participant,
                    trial = index + 1,
                    total = total,
                    threshold = threshold,
                    "Starting trial"
                );
                TrialEngine::new(&self.config, self.client.as_ref(), index, threshold)
                    .with_max_decision_attempts(self.max_decision_attempts)
                    .with_cancellation(self.cancel.clone())
                    .run()
                    .await
            };

            let result = match (&outcome.error_reason, outcome.burst) {
                (Some(reason), _) => format!("FAILED ({reason})"),
                (None, true) => "BURST".to_string(),
                (None, false) => "CASH OUT".to_string(),
            };
            info!(
                participant = %participant,
                trial = index + 1,
                result = %result,
                steps = outcome.steps_attempted,
                earnings = format!("{:.2}", outcome.earnings),
                "Trial complete"
            );

            if let Some(status) = &self.status {
                status.record_trial(participant, &outcome).await;
            }
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}
