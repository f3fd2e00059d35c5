//! Shared types for the email decision pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Observed email ──────────────────────────────────────────────────

/// Immutable per-message facts produced by the ingestion side.
///
/// The pipeline never mutates this; it is cloned into retry payloads
/// so a failed message can be replayed from the queue alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedEmail {
    /// Provider-native message identifier.
    pub email_id: String,
    /// Subject line (may be empty).
    #[serde(default)]
    pub subject: String,
    /// Decoded plain-text body.
    #[serde(default)]
    pub content: String,
    /// Raw sender address, e.g. `"Alice <alice@example.com>"`.
    #[serde(default)]
    pub sender: String,
    /// Lower-cased sender domain, e.g. `"example.com"`.
    #[serde(default)]
    pub sender_domain: String,
}

// ── Action vocabulary ───────────────────────────────────────────────

/// The fixed five-element action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ignore,
    DraftReply,
    CreateTask,
    FlagHighUrgency,
    EscalateHumanReview,
}

impl Action {
    /// Every allowed action, in vocabulary order.
    pub const ALL: [Action; 5] = [
        Action::Ignore,
        Action::DraftReply,
        Action::CreateTask,
        Action::FlagHighUrgency,
        Action::EscalateHumanReview,
    ];

    /// Wire/storage tag for this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::DraftReply => "draft_reply",
            Self::CreateTask => "create_task",
            Self::FlagHighUrgency => "flag_high_urgency",
            Self::EscalateHumanReview => "escalate_human_review",
        }
    }

    /// Default action implied by the reply requirement alone.
    pub fn from_reply_requirement(requires_reply: Option<bool>) -> Self {
        match requires_reply {
            Some(true) => Self::DraftReply,
            Some(false) => Self::Ignore,
            None => Self::EscalateHumanReview,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a tag is not in the action vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported action: '{0}'")]
pub struct UnsupportedAction(pub String);

impl FromStr for Action {
    type Err = UnsupportedAction;

    /// Strict parse: trimmed, case-insensitive, no aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| UnsupportedAction(s.to_string()))
    }
}

// ── Urgency ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
}

// ── Model judgments ─────────────────────────────────────────────────

/// Normalized model judgment about one email.
///
/// `next_action` is always a vocabulary member and `confidence` is
/// always within [0, 1]; the normalizer guarantees both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalysisResult {
    pub intent: String,
    pub requires_reply: Option<bool>,
    pub requires_action: Option<bool>,
    pub next_action: Action,
    pub action_reason: String,
    pub urgency: Urgency,
    pub reasoning: String,
    pub confidence: f64,
}

/// Normalized reply draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplyDraft {
    pub draft_reply: String,
    pub reasoning: String,
    pub confidence: f64,
}

impl ReplyDraft {
    /// Placeholder reported when the chosen action produces no draft.
    pub fn not_generated() -> Self {
        Self {
            draft_reply: String::new(),
            reasoning: "No draft generated for this action.".into(),
            confidence: 1.0,
        }
    }
}

/// Result of defensively parsing untrusted model output.
///
/// Consumers match on the variant instead of assuming success. A
/// `Fallback` still carries a structurally valid record.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Valid(T),
    Fallback { record: T, error: String },
}

impl<T> ParseOutcome<T> {
    /// The ok-flag: `false` means the caller should schedule a retry.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn record(&self) -> &T {
        match self {
            Self::Valid(record) | Self::Fallback { record, .. } => record,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Valid(_) => None,
            Self::Fallback { error, .. } => Some(error),
        }
    }

    /// Split into `(record, ok)`.
    pub fn into_parts(self) -> (T, bool) {
        match self {
            Self::Valid(record) => (record, true),
            Self::Fallback { record, .. } => (record, false),
        }
    }
}

// ── Behavior ────────────────────────────────────────────────────────

/// Summary of historical user behavior for an (intent, sender-domain) pair.
///
/// Computed fresh per decision; the router only reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub sample_size: u32,
    pub importance_score: f64,
    pub reply_rate_by_sender: Option<f64>,
    pub reply_rate_by_intent: Option<f64>,
    pub open_rate: Option<f64>,
    pub manual_override_rate: Option<f64>,
}

// ── Decision ────────────────────────────────────────────────────────

/// Output of the action router. Built once per decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionDecision {
    pub proposed_action: Action,
    pub final_action: Action,
    pub reason: String,
    pub llm_confidence: f64,
    pub importance_score: f64,
    pub behavior_weight: f64,
    pub sample_size: u32,
    pub final_score: f64,
    pub behavior: BehaviorProfile,
}

impl ActionDecision {
    /// Whether adaptive routing overrode the model's proposal.
    pub fn diverged(&self) -> bool {
        self.proposed_action != self.final_action
    }
}
