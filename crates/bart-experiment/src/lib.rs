//! BART experiment: the Balloon Analogue Risk Task played by chat models.
//!
//! Each participant (a model identifier) plays a series of balloons. For each
//! balloon the model repeatedly chooses to pump (earn one more step of
//! reward) or cash out, and the balloon bursts once the number of pumps
//! reaches a hidden threshold. All participants see the same threshold
//! schedule so their behavior can be compared directly.
//!
//! - `trial`: per-balloon conversation state machine
//! - `experiment`: sequential trials for one participant
//! - `orchestrator`: concurrent participants and pooled statistics
//! - `client`: chat-completions calls with retry and backoff

pub mod client;
pub mod config;
pub mod conversation;
pub mod decision;
pub mod experiment;
pub mod orchestrator;
pub mod results;
pub mod schedule;
pub mod sink;
pub mod status;
pub mod trial;

pub use client::{ChatMessage, DecisionClient, OpenRouterClient, RetryPolicy, Role, SendOutcome};
pub use config::{ConfigError, ExperimentConfig, TrialConfig};
pub use decision::{Decision, classify};
pub use experiment::ExperimentRunner;
pub use orchestrator::{
    ClientFactory, MultiSubjectOrchestrator, OpenRouterFactory, OrchestratorError, TaskParameters,
};
pub use results::{ExperimentResults, ParticipantSummary, summarize};
pub use schedule::ThresholdSchedule;
pub use status::ExperimentStatus;
pub use trial::{CancellationFlag, TrialEngine, TrialOutcome};
