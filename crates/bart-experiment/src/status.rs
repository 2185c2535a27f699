//! Live experiment status.
//!
//! The caller owns an `ExperimentStatus` and hands clones of it to the
//! orchestrator; any other task (a progress printer, a web view) can take a
//! `snapshot()` at any time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::trial::TrialOutcome;

/// Overall run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Finished,
}

/// Per-participant lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Progress of one participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProgress {
    pub state: ParticipantState,
    pub completed_trials: usize,
    pub total_trials: usize,
    pub bursts: usize,
    pub failed_trials: usize,
    pub earnings: f64,
    pub error: Option<String>,
}

/// Point-in-time copy of the status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub phase: RunPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub participants: BTreeMap<String, ParticipantProgress>,
}

impl StatusSnapshot {
    pub fn is_running(&self) -> bool {
        self.phase == RunPhase::Running
    }

    /// Trials finished across all participants.
    pub fn completed_trials(&self) -> usize {
        self.participants.values().map(|p| p.completed_trials).sum()
    }
}

/// Shared, synchronized status handle.
#[derive(Debug, Clone, Default)]
pub struct ExperimentStatus {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl ExperimentStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset and mark a run as started.
    pub async fn begin(&self, participants: &[String], total_trials: usize) {
        let mut status = self.inner.write().await;
        *status = StatusSnapshot {
            phase: RunPhase::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
            participants: participants
                .iter()
                .map(|p| {
                    (
                        p.clone(),
                        ParticipantProgress {
                            total_trials,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        };
    }

    pub async fn participant_started(&self, participant: &str) {
        let mut status = self.inner.write().await;
        status
            .participants
            .entry(participant.to_string())
            .or_default()
            .state = ParticipantState::Running;
    }

    pub async fn record_trial(&self, participant: &str, outcome: &TrialOutcome) {
        let mut status = self.inner.write().await;
        let progress = status
            .participants
            .entry(participant.to_string())
            .or_default();
        progress.completed_trials += 1;
        if outcome.burst {
            progress.bursts += 1;
        }
        if outcome.is_failed() {
            progress.failed_trials += 1;
        }
        progress.earnings += outcome.earnings;
    }

    pub async fn participant_finished(&self, participant: &str, error: Option<String>) {
        let mut status = self.inner.write().await;
        let progress = status
            .participants
            .entry(participant.to_string())
            .or_default();
        progress.state = if error.is_some() {
            ParticipantState::Failed
        } else {
            ParticipantState::Completed
        };
        progress.error = error;
    }

    pub async fn finish(&self) {
        let mut status = self.inner.write().await;
        status.phase = RunPhase::Finished;
        status.finished_at = Some(Utc::now());
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().await.clone()
    }
}
