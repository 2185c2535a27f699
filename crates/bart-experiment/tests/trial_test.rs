//! Trial engine tests through the public API, using a scripted client that
//! replays a fixed list of replies.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use bart_experiment::client::{ChatMessage, DecisionClient, SendOutcome};
use bart_experiment::config::TrialConfig;
use bart_experiment::decision::Decision;
use bart_experiment::experiment::ExperimentRunner;
use bart_experiment::schedule::ThresholdSchedule;
use bart_experiment::trial::{NO_VALID_RESPONSE, TrialEngine};

struct Replay(Mutex<VecDeque<SendOutcome>>);

impl Replay {
    fn new(replies: Vec<SendOutcome>) -> Self {
        Self(Mutex::new(replies.into()))
    }

    fn texts(replies: &[&str]) -> Self {
        Self::new(
            replies
                .iter()
                .map(|r| SendOutcome::Delivered(r.to_string()))
                .collect(),
        )
    }
}

#[async_trait]
impl DecisionClient for Replay {
    async fn send(&self, _conversation: &[ChatMessage]) -> SendOutcome {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SendOutcome::Failed("exhausted".to_string()))
    }
}

#[tokio::test]
async fn test_question_marks_three_times_fail_trial() {
    let config = TrialConfig::new(1, 20, 0.10, "m").unwrap();
    let client = Replay::texts(&["???", "???", "???"]);
    let outcome = TrialEngine::new(&config, &client, 0, 10).run().await;

    assert_eq!(outcome.error_reason.as_deref(), Some(NO_VALID_RESPONSE));
    assert!(outcome.decisions.is_empty());
    assert!(outcome.raw_responses.is_empty());
}

#[tokio::test]
async fn test_endpoint_failure_then_valid_reply() {
    let config = TrialConfig::new(1, 20, 0.10, "m").unwrap();
    let client = Replay::new(vec![
        SendOutcome::Failed("status 503".to_string()),
        SendOutcome::Delivered("pump pump pump".to_string()),
        SendOutcome::Delivered("cashout now".to_string()),
    ]);
    let outcome = TrialEngine::new(&config, &client, 0, 10).run().await;

    assert!(outcome.error_reason.is_none());
    assert_eq!(outcome.decisions, vec![Decision::Continue, Decision::Stop]);
    assert_eq!(outcome.steps_attempted, 1);
    assert_eq!(outcome.earnings, 0.1);
}

#[tokio::test]
async fn test_runner_continues_after_failed_trial() {
    let config = Arc::new(TrialConfig::new(1, 5, 0.25, "m").unwrap());
    let client = Arc::new(Replay::texts(&[
        // trial 0 fails
        "no idea", "what?", "hm",
        // trial 1: pump twice, cash out
        "Pump", "Pump", "Cash Out",
    ]));
    let schedule = ThresholdSchedule::from_thresholds(vec![4, 4]).unwrap();
    let outcomes = ExperimentRunner::new(config, client)
        .run(&schedule)
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].is_failed());
    assert!(outcomes[1].is_stopped());
    assert_eq!(outcomes[1].earnings, 0.5);
}

#[tokio::test]
async fn test_runner_rejects_out_of_bounds_schedule() {
    let config = Arc::new(TrialConfig::new(1, 5, 0.25, "m").unwrap());
    let client = Arc::new(Replay::texts(&[]));
    let schedule = ThresholdSchedule::from_thresholds(vec![6]).unwrap();
    assert!(ExperimentRunner::new(config, client).run(&schedule).await.is_err());
}
