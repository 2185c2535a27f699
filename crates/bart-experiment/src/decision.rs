//! Free-text decision classification.
//!
//! A model reply is lower-cased and matched against fixed keywords:
//! a stop phrase ("cash out", "cashout") means STOP, otherwise "pump" means
//! CONTINUE, otherwise the reply is INVALID and must be asked again.
//!
//! A reply mentioning "pump" alongside other text (including a bare "cash")
//! counts as CONTINUE. This tilts ambiguous replies toward risk-taking rather
//! than hiding model confusion as caution. It is kept deliberately and is
//! pending confirmation; do not change it without re-running the affected
//! experiments.

use serde::{Deserialize, Serialize};

const CONTINUE_KEYWORD: &str = "pump";
const STOP_PHRASES: [&str; 2] = ["cash out", "cashout"];

/// Classified participant reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Continue,
    Stop,
    Invalid,
}

impl Decision {
    /// Normalized label stored in trial outcomes.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Stop => "STOP",
            Self::Invalid => "INVALID",
        }
    }

    /// Inverse of `label`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "CONTINUE" => Some(Self::Continue),
            "STOP" => Some(Self::Stop),
            "INVALID" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify a raw model reply.
pub fn classify(raw: &str) -> Decision {
    let text = raw.trim().to_lowercase();
    if STOP_PHRASES.iter().any(|phrase| text.contains(phrase)) {
        Decision::Stop
    } else if text.contains(CONTINUE_KEYWORD) {
        Decision::Continue
    } else {
        Decision::Invalid
    }
}
