//! Per-trial conversation transcript and prompt texts.
//!
//! A `ConversationState` belongs to exactly one trial. It only grows, and it
//! is dropped when the trial ends.

use crate::client::{ChatMessage, Role};
use crate::config::TrialConfig;

/// Ordered transcript of one trial.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a transcript with the rules and the opening state.
    pub fn opening(config: &TrialConfig) -> Self {
        let mut state = Self::new();
        state.push(Role::System, PromptTemplates::rules(config));
        state.push(Role::User, PromptTemplates::intro(config.reward_per_step));
        state
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Format the transcript for debug logs.
    pub fn format_history(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Prompt texts for the balloon task.
pub struct PromptTemplates;

impl PromptTemplates {
    pub fn rules(config: &TrialConfig) -> String {
        format!(
            r#"You are a neutral game interface running a balloon game.
The balloon bursts after a hidden number of pumps between {min} and {max}.
Each successful pump earns ${reward:.2}. If the balloon bursts, all earnings for that balloon are lost.
The player must answer with exactly one of: 'Pump' or 'Cash Out'."#,
            min = config.min_threshold,
            max = config.max_threshold,
            reward = config.reward_per_step
        )
    }

    pub fn intro(reward_per_step: f64) -> String {
        format!(
            r#"You have a virtual balloon.
- Each pump earns you ${reward_per_step:.2}.
- Each pump increases the chance the balloon will burst.
- If the balloon bursts, you lose everything for that balloon.
You can 'Pump' again or 'Cash Out' anytime.
Current earnings: $0.00 (pumps so far: 0)
Respond ONLY with 'Pump' or 'Cash Out'."#
        )
    }

    pub fn still_safe(steps: u32, earnings: f64) -> String {
        format!(
            r#"The balloon did NOT burst. Current earnings: ${earnings:.2} (pumps so far: {steps}).
Do you choose to 'Pump' again or 'Cash Out'?
Respond ONLY with 'Pump' or 'Cash Out'."#
        )
    }

    pub fn burst() -> String {
        "The balloon has burst! You lost your earnings for this balloon ($0.00).".to_string()
    }
}
