//! Single-trial state machine.
//!
//! ```text
//! Intro -> AwaitingDecision -> Stopped | Burst | Failed
//!                ^                 |
//!                +-- Continued <---+
//! ```
//!
//! Each trial owns a private conversation. At every decision point the
//! engine asks the client for a reply, classifies it, and re-asks (with the
//! same transcript) until a valid decision arrives or the attempt budget is
//! spent. An exhausted budget fails the trial; the failure is recorded in the
//! outcome rather than returned as an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{DecisionClient, Role};
use crate::config::TrialConfig;
use crate::conversation::{ConversationState, PromptTemplates};
use crate::decision::{Decision, classify};

/// Reason recorded when no parseable decision could be obtained.
pub const NO_VALID_RESPONSE: &str = "no valid response after retries";

/// Reason recorded when a trial is aborted by cancellation.
pub const CANCELLED: &str = "cancelled";

/// Default attempts per decision point.
pub const DEFAULT_DECISION_ATTEMPTS: u32 = 3;

/// Shared stop signal, checked only between decision points.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// States of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Intro,
    AwaitingDecision,
    Continued,
    Stopped,
    Burst,
    Failed,
}

impl TrialState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Burst | Self::Failed)
    }
}

/// Immutable record of a finished trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    /// Position in the threshold schedule (0-based)
    pub trial_index: usize,
    /// Burst threshold used for this trial
    pub threshold: u32,
    pub steps_attempted: u32,
    pub burst: bool,
    /// Zero when burst, otherwise steps * reward rounded to cents
    pub earnings: f64,
    /// Normalized decisions, one per decision point traversed
    pub decisions: Vec<Decision>,
    /// Verbatim accepted replies, parallel to `decisions`
    pub raw_responses: Vec<String>,
    /// Present only when the trial failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Replies that could not be classified
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_responses: Vec<String>,
}

impl TrialOutcome {
    /// A failed trial: every behavioral field zeroed.
    pub fn failed(
        trial_index: usize,
        threshold: u32,
        reason: impl Into<String>,
        invalid_responses: Vec<String>,
    ) -> Self {
        Self {
            trial_index,
            threshold,
            steps_attempted: 0,
            burst: false,
            earnings: 0.0,
            decisions: Vec::new(),
            raw_responses: Vec::new(),
            error_reason: Some(reason.into()),
            invalid_responses,
        }
    }

    pub fn cancelled(trial_index: usize, threshold: u32) -> Self {
        Self::failed(trial_index, threshold, CANCELLED, Vec::new())
    }

    pub fn is_failed(&self) -> bool {
        self.error_reason.is_some()
    }

    /// Ended by a STOP decision.
    pub fn is_stopped(&self) -> bool {
        !self.burst && !self.is_failed()
    }

    /// Decision labels, e.g. for flat exports.
    pub fn decision_labels(&self) -> Vec<&'static str> {
        self.decisions.iter().map(Decision::label).collect()
    }
}

/// A classified reply that moves the trial forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accepted {
    Continue,
    Stop,
}

impl From<Accepted> for Decision {
    fn from(accepted: Accepted) -> Self {
        match accepted {
            Accepted::Continue => Decision::Continue,
            Accepted::Stop => Decision::Stop,
        }
    }
}

/// Drives one trial against a decision client.
pub struct TrialEngine<'a> {
    config: &'a TrialConfig,
    client: &'a dyn DecisionClient,
    trial_index: usize,
    threshold: u32,
    max_decision_attempts: u32,
    cancel: Option<CancellationFlag>,

    state: TrialState,
    conversation: ConversationState,
    steps: u32,
    decisions: Vec<Decision>,
    raw_responses: Vec<String>,
    invalid_responses: Vec<String>,
}

impl<'a> TrialEngine<'a> {
    pub fn new(
        config: &'a TrialConfig,
        client: &'a dyn DecisionClient,
        trial_index: usize,
        threshold: u32,
    ) -> Self {
        Self {
            config,
            client,
            trial_index,
            threshold,
            max_decision_attempts: DEFAULT_DECISION_ATTEMPTS,
            cancel: None,
            state: TrialState::Intro,
            conversation: ConversationState::new(),
            steps: 0,
            decisions: Vec::new(),
            raw_responses: Vec::new(),
            invalid_responses: Vec::new(),
        }
    }

    pub fn with_max_decision_attempts(mut self, attempts: u32) -> Self {
        self.max_decision_attempts = attempts.max(1);
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    /// Run the trial to a terminal state.
    pub async fn run(mut self) -> TrialOutcome {
        loop {
            match self.state {
                TrialState::Intro => {
                    self.conversation = ConversationState::opening(self.config);
                    self.transition(TrialState::AwaitingDecision);
                }
                TrialState::AwaitingDecision => {
                    if self.is_cancelled() {
                        return self.fail(CANCELLED);
                    }
                    let Some((decision, raw)) = self.extract_decision().await else {
                        return self.fail(NO_VALID_RESPONSE);
                    };
                    self.apply(decision, raw);
                }
                TrialState::Continued => self.transition(TrialState::AwaitingDecision),
                TrialState::Stopped | TrialState::Burst | TrialState::Failed => break,
            }
        }
        self.finish()
    }

    fn transition(&mut self, next: TrialState) {
        debug!(
            participant = %self.config.participant_id,
            trial = self.trial_index,
            from = ?self.state,
            to = ?next,
            steps = self.steps,
            "Trial transition"
        );
        self.state = next;
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationFlag::is_cancelled)
    }

    /// Ask until a valid decision arrives or the attempt budget is spent.
    async fn extract_decision(&mut self) -> Option<(Accepted, String)> {
        for attempt in 1..=self.max_decision_attempts {
            let outcome = self.client.send(self.conversation.messages()).await;
            let raw = outcome.text().to_string();
            match classify(&raw) {
                Decision::Continue => return Some((Accepted::Continue, raw)),
                Decision::Stop => return Some((Accepted::Stop, raw)),
                Decision::Invalid => {}
            }
            warn!(
                participant = %self.config.participant_id,
                trial = self.trial_index,
                attempt = attempt,
                delivered = outcome.is_ok(),
                response = %raw,
                "Unrecognized decision, asking again"
            );
            self.invalid_responses.push(raw);
        }
        None
    }

    fn apply(&mut self, accepted: Accepted, raw: String) {
        self.conversation.push(Role::Assistant, raw.clone());
        self.decisions.push(accepted.into());
        self.raw_responses.push(raw);

        match accepted {
            Accepted::Stop => self.transition(TrialState::Stopped),
            Accepted::Continue => {
                self.steps += 1;
                if self.steps >= self.threshold {
                    self.conversation.push(Role::User, PromptTemplates::burst());
                    self.transition(TrialState::Burst);
                } else {
                    let earnings = self.config.earnings_for(self.steps);
                    self.conversation
                        .push(Role::User, PromptTemplates::still_safe(self.steps, earnings));
                    self.transition(TrialState::Continued);
                }
            }
        }
    }

    fn fail(mut self, reason: &str) -> TrialOutcome {
        self.transition(TrialState::Failed);
        warn!(
            participant = %self.config.participant_id,
            trial = self.trial_index,
            reason = reason,
            "Trial failed"
        );
        TrialOutcome::failed(
            self.trial_index,
            self.threshold,
            reason,
            self.invalid_responses,
        )
    }

    /// Outcome of a trial that ended in `Stopped` or `Burst`.
    fn finish(self) -> TrialOutcome {
        let burst = self.state == TrialState::Burst;
        let earnings = if burst {
            0.0
        } else {
            self.config.earnings_for(self.steps)
        };
        debug!(
            participant = %self.config.participant_id,
            trial = self.trial_index,
            transcript = %self.conversation.format_history(),
            "Trial transcript"
        );
        TrialOutcome {
            trial_index: self.trial_index,
            threshold: self.threshold,
            steps_attempted: self.steps,
            burst,
            earnings,
            decisions: self.decisions,
            raw_responses: self.raw_responses,
            error_reason: None,
            invalid_responses: self.invalid_responses,
        }
    }
}
