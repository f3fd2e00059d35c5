//! Behavior signal: how the user has historically treated similar mail.
//!
//! Profiles are computed from recorded behavior events whose sender domain
//! or intent matches the email being routed. Only events with user feedback
//! count toward the sample size and reply rates.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::pipeline::normalize::clamp_score;
use crate::pipeline::types::{Action, BehaviorProfile};
use crate::store::traits::{BehaviorEvent, Database};

const SENDER_WEIGHT: f64 = 0.4;
const INTENT_WEIGHT: f64 = 0.4;
const OPEN_WEIGHT: f64 = 0.2;

/// Intent label the normalizer uses when the model gave none.
const UNKNOWN_INTENT: &str = "Unknown";

/// Source of behavior profiles for the router.
#[async_trait]
pub trait BehaviorSignal: Send + Sync {
    /// Profile for an (intent, sender domain) pair. Never fails; an
    /// unavailable history yields an empty profile.
    async fn profile(&self, intent: &str, sender_domain: &str) -> BehaviorProfile;
}

/// Behavior signal backed by the event history in the database.
pub struct StoreBehaviorSignal {
    db: Arc<dyn Database>,
}

impl StoreBehaviorSignal {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BehaviorSignal for StoreBehaviorSignal {
    async fn profile(&self, intent: &str, sender_domain: &str) -> BehaviorProfile {
        let intent = usable_intent(intent);
        let domain = sender_domain.trim();
        if intent.is_empty() && domain.is_empty() {
            return BehaviorProfile::default();
        }

        match self.db.behavior_events_for(intent, domain).await {
            Ok(events) => {
                let profile = profile_from_events(&events, intent, domain);
                debug!(
                    intent,
                    sender_domain = domain,
                    samples = profile.sample_size,
                    importance = profile.importance_score,
                    "Behavior profile computed"
                );
                profile
            }
            Err(e) => {
                warn!(error = %e, "Behavior history unavailable, using empty profile");
                BehaviorProfile::default()
            }
        }
    }
}

fn usable_intent(intent: &str) -> &str {
    let intent = intent.trim();
    if intent.eq_ignore_ascii_case(UNKNOWN_INTENT) {
        ""
    } else {
        intent
    }
}

fn matches_sender(event: &BehaviorEvent, domain: &str) -> bool {
    !domain.is_empty() && event.sender_domain.eq_ignore_ascii_case(domain)
}

fn matches_intent(event: &BehaviorEvent, intent: &str) -> bool {
    !intent.is_empty() && event.intent.trim().eq_ignore_ascii_case(intent)
}

fn user_replied(event: &BehaviorEvent) -> bool {
    matches!(
        event.user_final_action.as_deref(),
        Some(a) if a == FeedbackAction::SentReply.as_str() || a == FeedbackAction::EditedDraft.as_str()
    )
}

/// The user did the opposite of what the agent chose.
fn user_overrode(event: &BehaviorEvent) -> bool {
    let Some(user) = event.user_final_action.as_deref() else {
        return false;
    };
    let agent = event.agent_action.as_str();
    (agent == Action::Ignore.as_str() && user_replied(event))
        || (agent == Action::DraftReply.as_str() && user == FeedbackAction::Ignored.as_str())
}

fn rate<'a, I>(events: I, pred: fn(&BehaviorEvent) -> bool) -> Option<f64>
where
    I: IntoIterator<Item = &'a BehaviorEvent>,
{
    let (hits, total) = events
        .into_iter()
        .fold((0u32, 0u32), |(h, t), e| (h + u32::from(pred(e)), t + 1));
    (total > 0).then(|| f64::from(hits) / f64::from(total))
}

/// Compute a profile from already-fetched events.
///
/// Events matching neither the domain nor the intent are ignored, so the
/// caller may pass a superset.
pub fn profile_from_events(events: &[BehaviorEvent], intent: &str, domain: &str) -> BehaviorProfile {
    let intent = usable_intent(intent);
    let domain = domain.trim();

    let with_feedback = |e: &&BehaviorEvent| e.user_final_action.is_some();

    let sender_events: Vec<&BehaviorEvent> =
        events.iter().filter(|e| matches_sender(e, domain)).collect();
    let relevant: Vec<&BehaviorEvent> = events
        .iter()
        .filter(|e| matches_sender(e, domain) || matches_intent(e, intent))
        .filter(with_feedback)
        .collect();

    let reply_rate_by_sender = rate(
        sender_events.iter().copied().filter(with_feedback),
        user_replied,
    );
    let reply_rate_by_intent = rate(
        relevant.iter().copied().filter(|e| matches_intent(e, intent)),
        user_replied,
    );
    let open_rate = rate(sender_events.iter().copied(), |e| {
        e.user_final_action.is_some()
    });
    let manual_override_rate = rate(relevant.iter().copied(), user_overrode);

    let components = [
        (reply_rate_by_sender, SENDER_WEIGHT),
        (reply_rate_by_intent, INTENT_WEIGHT),
        (open_rate, OPEN_WEIGHT),
    ];
    let (weighted, weight_total) = components
        .iter()
        .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
        .fold((0.0, 0.0), |(s, w), (v, wt)| (s + v, w + wt));
    let importance_score = if weight_total > 0.0 {
        clamp_score(weighted / weight_total)
    } else {
        0.0
    };

    BehaviorProfile {
        sample_size: u32::try_from(relevant.len()).unwrap_or(u32::MAX),
        importance_score,
        reply_rate_by_sender,
        reply_rate_by_intent,
        open_rate,
        manual_override_rate,
    }
}

// ── Feedback ────────────────────────────────────────────────────────

/// What the user ultimately did with an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackAction {
    SentReply,
    EditedDraft,
    Ignored,
}

impl FeedbackAction {
    /// Editing a draft implies a reply was sent, so it takes precedence.
    pub fn from_flags(replied: bool, edited: bool) -> Self {
        match (replied, edited) {
            (_, true) => Self::EditedDraft,
            (true, false) => Self::SentReply,
            (false, false) => Self::Ignored,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SentReply => "sent_reply",
            Self::EditedDraft => "edited_draft",
            Self::Ignored => "ignored",
        }
    }
}

/// Attach user feedback to the logged event for `email_id`.
///
/// Returns `false` when no event exists for that email.
pub async fn record_feedback(
    db: &dyn Database,
    email_id: &str,
    replied: bool,
    edited: bool,
) -> Result<bool, DatabaseError> {
    let action = FeedbackAction::from_flags(replied, edited);
    let updated = db.record_user_final_action(email_id, action.as_str()).await?;
    if updated {
        debug!(email_id, action = action.as_str(), "Feedback recorded");
    } else {
        warn!(email_id, "No behavior event to attach feedback to");
    }
    Ok(updated)
}
