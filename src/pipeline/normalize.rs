//! Defensive normalization of model output.
//!
//! The model is asked for a fixed JSON key set but nothing about its
//! output is trusted. Every field is coerced independently; anything
//! that is not a JSON object degrades to a deterministic fallback record
//! tagged as [`ParseOutcome::Fallback`].

use serde_json::{Map, Value};
use tracing::debug;

use crate::pipeline::types::{Action, AnalysisResult, ParseOutcome, ReplyDraft, Urgency};

/// Confidence used when the model gives none we can read.
pub const FALLBACK_CONFIDENCE: f64 = 0.2;

const NO_REASONING: &str = "No reasoning provided.";
const UNKNOWN_INTENT: &str = "Unknown";
const FALLBACK_ACTION_REASON: &str = "Analysis is uncertain; routing to human review.";

/// Accepted spellings that map onto the action vocabulary.
const ACTION_ALIASES: &[(&str, Action)] = &[
    ("draft", Action::DraftReply),
    ("reply", Action::DraftReply),
    ("create task", Action::CreateTask),
    ("task", Action::CreateTask),
    ("flag high urgency", Action::FlagHighUrgency),
    ("high_urgency", Action::FlagHighUrgency),
    ("escalate", Action::EscalateHumanReview),
    ("human_review", Action::EscalateHumanReview),
];

// ── Analysis ────────────────────────────────────────────────────────

/// Normalize a raw analysis payload. Never fails.
pub fn normalize_analysis(raw: &str) -> ParseOutcome<AnalysisResult> {
    match parse_object(raw) {
        Ok(object) => ParseOutcome::Valid(coerce_analysis(&object)),
        Err(error) => {
            debug!(error = %error, "Analysis payload rejected, using fallback");
            let reasoning = format!("Model response could not be parsed reliably: {error}");
            ParseOutcome::Fallback {
                record: fallback_analysis(&reasoning),
                error,
            }
        }
    }
}

/// The deterministic record substituted for an unusable analysis.
pub fn fallback_analysis(reasoning: &str) -> AnalysisResult {
    AnalysisResult {
        intent: UNKNOWN_INTENT.into(),
        requires_reply: None,
        requires_action: None,
        next_action: Action::EscalateHumanReview,
        action_reason: FALLBACK_ACTION_REASON.into(),
        urgency: Urgency::Low,
        reasoning: reasoning.into(),
        confidence: FALLBACK_CONFIDENCE,
    }
}

fn coerce_analysis(object: &Map<String, Value>) -> AnalysisResult {
    let intent = text(object.get("Intent"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_INTENT.into());
    let requires_reply = tri_state(object.get("RequiresReply"));
    let requires_action = tri_state(object.get("RequiresAction"));
    let next_action = normalize_next_action(object.get("NextAction"), requires_reply);
    let reasoning = text(object.get("Reasoning"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_REASONING.into());
    let action_reason = text(object.get("ActionReason"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| reasoning.clone());
    let urgency = urgency(object.get("Urgency"));

    AnalysisResult {
        intent,
        requires_reply,
        requires_action,
        next_action,
        action_reason,
        urgency,
        reasoning,
        confidence: confidence(object.get("Confidence")),
    }
}

/// Resolve a model-supplied action, falling back on the reply requirement.
pub fn normalize_next_action(value: Option<&Value>, requires_reply: Option<bool>) -> Action {
    if let Some(Value::String(raw)) = value {
        let normalized = raw.trim().to_lowercase();
        let resolved = ACTION_ALIASES
            .iter()
            .find(|(alias, _)| *alias == normalized)
            .map(|(_, action)| *action)
            .or_else(|| normalized.parse().ok());
        if let Some(action) = resolved {
            return action;
        }
    }
    Action::from_reply_requirement(requires_reply)
}

// ── Reply ───────────────────────────────────────────────────────────

/// Normalize a raw reply-draft payload. Never fails.
pub fn normalize_reply(raw: &str) -> ParseOutcome<ReplyDraft> {
    match parse_object(raw) {
        Ok(object) => ParseOutcome::Valid(ReplyDraft {
            draft_reply: text(object.get("DraftReply")).unwrap_or_default(),
            reasoning: text(object.get("Reasoning"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| NO_REASONING.into()),
            confidence: confidence(object.get("Confidence")),
        }),
        Err(error) => {
            debug!(error = %error, "Reply payload rejected, using fallback");
            let reasoning = format!("Reply draft could not be generated reliably: {error}");
            ParseOutcome::Fallback {
                record: fallback_reply(&reasoning),
                error,
            }
        }
    }
}

pub fn fallback_reply(reasoning: &str) -> ReplyDraft {
    ReplyDraft {
        draft_reply: String::new(),
        reasoning: reasoning.into(),
        confidence: FALLBACK_CONFIDENCE,
    }
}

// ── Coercion helpers ────────────────────────────────────────────────

/// Clamp a score into [0, 1]. NaN maps to 0.0.
pub fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(strip_code_fence(raw)) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err("response is not an object".into()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

/// Strip a surrounding markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => trimmed,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn tri_state(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn urgency(value: Option<&Value>) -> Urgency {
    match text(value).map(|s| s.to_lowercase()).as_deref() {
        Some("medium") => Urgency::Medium,
        Some("high") => Urgency::High,
        _ => Urgency::Low,
    }
}

fn confidence(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    clamp_score(
        parsed
            .filter(|c| c.is_finite())
            .unwrap_or(FALLBACK_CONFIDENCE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(raw: &str) -> AnalysisResult {
        match normalize_analysis(raw) {
            ParseOutcome::Valid(record) => record,
            other => panic!("Expected Valid, got {:?}", other),
        }
    }

    // ── Fallback paths ──────────────────────────────────────────────

    #[test]
    fn malformed_payloads_fall_back_to_escalation() {
        for raw in ["", "not json at all", "[1, 2, 3]", "42", "\"text\"", "null", "{\"Intent\":"] {
            let outcome = normalize_analysis(raw);
            assert!(!outcome.is_ok(), "payload {raw:?} should not be ok");
            let record = outcome.record();
            assert_eq!(record.next_action, Action::EscalateHumanReview);
            assert_eq!(record.intent, "Unknown");
            assert_eq!(record.requires_reply, None);
            assert_eq!(record.requires_action, None);
            assert_eq!(record.urgency, Urgency::Low);
            assert!((record.confidence - 0.2).abs() < f64::EPSILON);
            assert!(record.reasoning.contains("could not be parsed"));
        }
    }

    #[test]
    fn array_of_objects_is_still_rejected() {
        let outcome = normalize_analysis(r#"[{"Intent": "x", "NextAction": "ignore"}]"#);
        assert_eq!(outcome.error(), Some("response is not an object"));
    }

    #[test]
    fn empty_object_is_valid_with_defaults() {
        let record = valid("{}");
        assert_eq!(record.intent, "Unknown");
        assert_eq!(record.next_action, Action::EscalateHumanReview);
        assert_eq!(record.reasoning, "No reasoning provided.");
        assert_eq!(record.action_reason, "No reasoning provided.");
        assert!((record.confidence - 0.2).abs() < f64::EPSILON);
    }

    // ── Field coercion ──────────────────────────────────────────────

    #[test]
    fn full_payload_is_coerced() {
        let record = valid(
            r#"{"Intent": " Schedule meeting ", "RequiresReply": true, "RequiresAction": "FALSE",
                "NextAction": "Draft_Reply", "ActionReason": "Asks for a slot", "Urgency": "HIGH",
                "Reasoning": "Direct question", "Confidence": 0.85}"#,
        );
        assert_eq!(record.intent, "Schedule meeting");
        assert_eq!(record.requires_reply, Some(true));
        assert_eq!(record.requires_action, Some(false));
        assert_eq!(record.next_action, Action::DraftReply);
        assert_eq!(record.action_reason, "Asks for a slot");
        assert_eq!(record.urgency, Urgency::High);
        assert!((record.confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn code_fenced_payload_is_accepted() {
        let record = valid("```json\n{\"NextAction\": \"ignore\", \"Confidence\": 0.9}\n```");
        assert_eq!(record.next_action, Action::Ignore);
    }

    #[test]
    fn tri_state_rejects_other_values() {
        let record = valid(r#"{"RequiresReply": "yes", "RequiresAction": 1}"#);
        assert_eq!(record.requires_reply, None);
        assert_eq!(record.requires_action, None);
    }

    #[test]
    fn action_aliases_resolve() {
        let cases = [
            ("draft", Action::DraftReply),
            ("reply", Action::DraftReply),
            ("Create Task", Action::CreateTask),
            ("task", Action::CreateTask),
            ("flag high urgency", Action::FlagHighUrgency),
            ("high_urgency", Action::FlagHighUrgency),
            ("escalate", Action::EscalateHumanReview),
            ("human_review", Action::EscalateHumanReview),
        ];
        for (alias, expected) in cases {
            let value = Value::String(alias.into());
            assert_eq!(normalize_next_action(Some(&value), None), expected, "{alias}");
        }
    }

    #[test]
    fn unknown_action_falls_back_on_reply_requirement() {
        let value = Value::String("call them".into());
        assert_eq!(normalize_next_action(Some(&value), Some(true)), Action::DraftReply);
        assert_eq!(normalize_next_action(Some(&value), Some(false)), Action::Ignore);
        assert_eq!(
            normalize_next_action(Some(&value), None),
            Action::EscalateHumanReview
        );
        let numeric = Value::from(3);
        assert_eq!(normalize_next_action(Some(&numeric), Some(false)), Action::Ignore);
    }

    #[test]
    fn urgency_outside_vocabulary_defaults_low() {
        assert_eq!(valid(r#"{"Urgency": "critical"}"#).urgency, Urgency::Low);
        assert_eq!(valid(r#"{"Urgency": " Medium "}"#).urgency, Urgency::Medium);
        assert_eq!(valid(r#"{"Urgency": 5}"#).urgency, Urgency::Low);
    }

    #[test]
    fn action_reason_backfilled_from_reasoning() {
        let record = valid(r#"{"ActionReason": "   ", "Reasoning": "Newsletter"}"#);
        assert_eq!(record.action_reason, "Newsletter");
    }

    #[test]
    fn confidence_always_within_unit_interval() {
        let cases = [
            (r#"{"Confidence": 1.7}"#, 1.0),
            (r#"{"Confidence": -3}"#, 0.0),
            (r#"{"Confidence": "0.4"}"#, 0.4),
            (r#"{"Confidence": "high"}"#, 0.2),
            (r#"{"Confidence": null}"#, 0.2),
            (r#"{"Confidence": [0.9]}"#, 0.2),
            (r#"{"Confidence": true}"#, 1.0),
            (r#"{"Confidence": "inf"}"#, 0.2),
            (r#"{"Confidence": "-infinity"}"#, 0.2),
            (r#"{"Confidence": "NaN"}"#, 0.2),
        ];
        for (raw, expected) in cases {
            let c = valid(raw).confidence;
            assert!((0.0..=1.0).contains(&c));
            assert!((c - expected).abs() < 1e-9, "{raw} -> {c}");
        }
    }

    #[test]
    fn clamp_score_maps_nan_to_zero() {
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(f64::INFINITY), 1.0);
        assert_eq!(clamp_score(0.5), 0.5);
    }

    // ── Reply ───────────────────────────────────────────────────────

    #[test]
    fn reply_payload_is_trimmed() {
        let outcome = normalize_reply(
            r#"{"DraftReply": "  Thanks, Tuesday works.  ", "Reasoning": "", "Confidence": "0.7"}"#,
        );
        assert!(outcome.is_ok());
        let draft = outcome.record();
        assert_eq!(draft.draft_reply, "Thanks, Tuesday works.");
        assert_eq!(draft.reasoning, "No reasoning provided.");
        assert!((draft.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn malformed_reply_falls_back() {
        for raw in ["", "Sure! Here's a draft", "[\"a\"]"] {
            let outcome = normalize_reply(raw);
            assert!(!outcome.is_ok());
            let draft = outcome.record();
            assert!(draft.draft_reply.is_empty());
            assert!((draft.confidence - 0.2).abs() < f64::EPSILON);
            assert!(draft.reasoning.contains("could not be generated"));
        }
    }
}
