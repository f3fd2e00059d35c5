//! Adaptive action router.
//!
//! Blends the model's confidence with the behavioral importance score and
//! maps the proposed action onto a final one:
//!
//! 1. `behavior_weight = min(MAX, MAX * samples / FULL_AT)`
//! 2. `final_score = (1 - w) * llm_confidence + w * importance`
//! 3. Stability invariant: a confident ignore on a cold-start profile stays ignore
//! 4. Ordered rule list, first match wins; unmatched proposals pass through
//!
//! The rule list is evaluated in order and deliberately not collapsed into
//! ranges: the `draft_reply` bands overlap, and the order decides the
//! outcome at the edges.

use tracing::debug;

use crate::config::RoutingPolicy;
use crate::pipeline::normalize::clamp_score;
use crate::pipeline::types::{Action, ActionDecision, AnalysisResult, BehaviorProfile};

/// Predicate a routing rule applies to the final score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    ScoreAtLeast(f64),
    /// Score threshold that also requires `RequiresAction == Some(true)`.
    ScoreAtLeastRequiringAction(f64),
    ScoreBelow(f64),
}

impl Condition {
    fn matches(&self, final_score: f64, requires_action: bool) -> bool {
        match *self {
            Self::ScoreAtLeast(t) => final_score >= t,
            Self::ScoreAtLeastRequiringAction(t) => final_score >= t && requires_action,
            Self::ScoreBelow(t) => final_score < t,
        }
    }
}

/// One row of the routing table.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRule {
    pub proposed: Action,
    pub condition: Condition,
    pub outcome: Action,
}

/// Pure, deterministic router. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct ActionRouter {
    policy: RoutingPolicy,
    rules: Vec<RoutingRule>,
}

impl ActionRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        let rules = routing_table(&policy);
        Self { policy, rules }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// The ordered routing table in effect.
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Share of the final score attributed to behavior history.
    pub fn behavior_weight(&self, sample_size: u32) -> f64 {
        let max = self.policy.max_behavior_influence;
        let full = f64::from(self.policy.full_behavior_at_samples.max(1));
        (max * (f64::from(sample_size) / full)).min(max)
    }

    /// Linear blend of model confidence and behavioral importance.
    pub fn final_score(&self, llm_confidence: f64, importance_score: f64, weight: f64) -> f64 {
        clamp_score((1.0 - weight) * llm_confidence + weight * importance_score)
    }

    /// Decide the final action for one analyzed email.
    pub fn route(&self, analysis: &AnalysisResult, behavior: &BehaviorProfile) -> ActionDecision {
        let proposed_action = analysis.next_action;
        let llm_confidence = clamp_score(analysis.confidence);
        let importance_score = clamp_score(behavior.importance_score);
        let sample_size = behavior.sample_size;
        let behavior_weight = self.behavior_weight(sample_size);
        let final_score = self.final_score(llm_confidence, importance_score, behavior_weight);
        let requires_action = analysis.requires_action == Some(true);

        let final_action = if self.stability_holds(proposed_action, llm_confidence, sample_size) {
            debug!(
                llm_confidence,
                sample_size, "Stability invariant pinned confident ignore"
            );
            Action::Ignore
        } else {
            self.rules
                .iter()
                .find(|rule| {
                    rule.proposed == proposed_action
                        && rule.condition.matches(final_score, requires_action)
                })
                .map(|rule| rule.outcome)
                .unwrap_or(proposed_action)
        };

        let base_reason = if analysis.action_reason.trim().is_empty() {
            analysis.reasoning.trim()
        } else {
            analysis.action_reason.trim()
        };
        let reason = if proposed_action != final_action {
            format!(
                "{base_reason} Adaptive routing changed action from {proposed_action} \
                 to {final_action} because unified final score was {final_score:.2} \
                 (behavior weight {behavior_weight:.2}, samples {sample_size})."
            )
            .trim()
            .to_string()
        } else {
            base_reason.to_string()
        };

        debug!(
            proposed = %proposed_action,
            final_action = %final_action,
            final_score,
            behavior_weight,
            sample_size,
            "Routed action"
        );

        ActionDecision {
            proposed_action,
            final_action,
            reason,
            llm_confidence,
            importance_score,
            behavior_weight,
            sample_size,
            final_score,
            behavior: behavior.clone(),
        }
    }

    fn stability_holds(&self, proposed: Action, llm_confidence: f64, sample_size: u32) -> bool {
        proposed == Action::Ignore
            && llm_confidence >= self.policy.clear_ignore_confidence
            && sample_size < self.policy.low_sample_invariant_limit
    }
}

impl Default for ActionRouter {
    fn default() -> Self {
        Self::new(RoutingPolicy::default())
    }
}

/// Build the ordered routing table from the policy thresholds.
fn routing_table(p: &RoutingPolicy) -> Vec<RoutingRule> {
    use Action::*;
    use Condition::*;

    let rule = |proposed, condition, outcome| RoutingRule {
        proposed,
        condition,
        outcome,
    };

    vec![
        rule(DraftReply, ScoreAtLeast(p.draft_auto_threshold), DraftReply),
        rule(
            DraftReply,
            ScoreAtLeastRequiringAction(p.review_task_threshold),
            CreateTask,
        ),
        rule(DraftReply, ScoreAtLeast(p.review_threshold), EscalateHumanReview),
        rule(DraftReply, ScoreBelow(p.draft_min_final_score), EscalateHumanReview),
        rule(
            Ignore,
            ScoreAtLeastRequiringAction(p.review_task_threshold),
            CreateTask,
        ),
        rule(Ignore, ScoreAtLeast(p.review_threshold), EscalateHumanReview),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalize::{fallback_analysis, normalize_analysis};
    use crate::pipeline::types::Urgency;

    fn analysis(action: Action, confidence: f64, requires_action: Option<bool>) -> AnalysisResult {
        AnalysisResult {
            intent: "Request".into(),
            requires_reply: None,
            requires_action,
            next_action: action,
            action_reason: "Model reason.".into(),
            urgency: Urgency::Low,
            reasoning: "Model reasoning.".into(),
            confidence,
        }
    }

    fn profile(sample_size: u32, importance_score: f64) -> BehaviorProfile {
        BehaviorProfile {
            sample_size,
            importance_score,
            ..Default::default()
        }
    }

    fn route(action: Action, confidence: f64, samples: u32, importance: f64, ra: bool) -> ActionDecision {
        ActionRouter::default().route(
            &analysis(action, confidence, Some(ra)),
            &profile(samples, importance),
        )
    }

    // ── Blend weight ────────────────────────────────────────────────

    #[test]
    fn weight_is_zero_without_history() {
        let router = ActionRouter::default();
        assert_eq!(router.behavior_weight(0), 0.0);
        let decision = route(Action::DraftReply, 0.73, 0, 1.0, false);
        assert_eq!(decision.final_score, 0.73);
    }

    #[test]
    fn weight_is_monotonic_and_saturates() {
        let router = ActionRouter::default();
        let mut previous = 0.0;
        for n in 0..100 {
            let w = router.behavior_weight(n);
            assert!(w >= previous, "weight decreased at n={n}");
            assert!(w <= 0.40 + f64::EPSILON);
            previous = w;
        }
        assert!((router.behavior_weight(25) - 0.40).abs() < 1e-12);
        assert!((router.behavior_weight(1000) - 0.40).abs() < 1e-12);
        assert!((router.behavior_weight(10) - 0.16).abs() < 1e-12);
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[test]
    fn stability_invariant_keeps_confident_ignore() {
        for importance in [0.0, 0.5, 1.0] {
            let decision = route(Action::Ignore, 0.95, 3, importance, true);
            assert_eq!(decision.final_action, Action::Ignore);
            assert!(!decision.diverged());
        }
    }

    #[test]
    fn stability_invariant_releases_at_sample_limit() {
        // 8 samples: weight 0.128, score = 0.872*0.95 + 0.128*1.0 ≈ 0.956
        let decision = route(Action::Ignore, 0.95, 8, 1.0, false);
        assert_eq!(decision.final_action, Action::EscalateHumanReview);
    }

    #[test]
    fn confident_draft_with_full_history_is_kept() {
        let decision = route(Action::DraftReply, 0.8, 25, 0.8, false);
        assert!((decision.behavior_weight - 0.40).abs() < 1e-12);
        assert!((decision.final_score - 0.8).abs() < 1e-9);
        assert_eq!(decision.final_action, Action::DraftReply);
        assert_eq!(decision.reason, "Model reason.");
    }

    #[test]
    fn actionable_draft_in_task_band_becomes_task() {
        // 0.6*0.5 + 0.4*0.8 = 0.62
        let decision = route(Action::DraftReply, 0.5, 25, 0.8, true);
        assert!((decision.final_score - 0.62).abs() < 1e-9);
        assert_eq!(decision.final_action, Action::CreateTask);
    }

    #[test]
    fn task_band_without_requires_action_escalates() {
        let decision = route(Action::DraftReply, 0.5, 25, 0.8, false);
        assert_eq!(decision.final_action, Action::EscalateHumanReview);
    }

    #[test]
    fn low_score_ignore_passes_through() {
        // 0.6*0.5 + 0.4*0.0 = 0.30, below every ignore rule
        let decision = route(Action::Ignore, 0.5, 25, 0.0, false);
        assert!((decision.final_score - 0.30).abs() < 1e-9);
        assert_eq!(decision.final_action, Action::Ignore);
    }

    #[test]
    fn mid_score_ignore_escalates() {
        let decision = route(Action::Ignore, 0.5, 25, 0.5, false);
        assert_eq!(decision.final_action, Action::EscalateHumanReview);
    }

    #[test]
    fn actionable_ignore_becomes_task() {
        let decision = route(Action::Ignore, 0.7, 0, 0.0, true);
        assert_eq!(decision.final_action, Action::CreateTask);
    }

    #[test]
    fn other_actions_pass_through() {
        for action in [Action::CreateTask, Action::FlagHighUrgency, Action::EscalateHumanReview] {
            for confidence in [0.0, 0.5, 1.0] {
                let decision = route(action, confidence, 25, 0.0, true);
                assert_eq!(decision.final_action, action);
            }
        }
    }

    // ── Threshold edges (sample_size 0 makes final_score exact) ────

    #[test]
    fn actionable_draft_with_moderate_history_escalates() {
        // 0.6 * 0.5 + 0.4 * 0.7 = 0.58: below the task band, above review.
        let decision = route(Action::DraftReply, 0.5, 25, 0.7, true);
        assert!((decision.behavior_weight - 0.40).abs() < 1e-9);
        assert!((decision.final_score - 0.58).abs() < 1e-9);
        assert_eq!(decision.final_action, Action::EscalateHumanReview);
    }

    #[test]
    fn draft_reply_band_edges() {
        let cases = [
            (0.65, false, Action::DraftReply),
            (0.6499, false, Action::EscalateHumanReview),
            (0.60, true, Action::CreateTask),
            (0.5999, true, Action::EscalateHumanReview),
            (0.60, false, Action::EscalateHumanReview),
            (0.55, false, Action::EscalateHumanReview),
            (0.45, false, Action::EscalateHumanReview),
            (0.4499, false, Action::EscalateHumanReview),
            (0.0, true, Action::EscalateHumanReview),
        ];
        for (score, ra, expected) in cases {
            let decision = route(Action::DraftReply, score, 0, 0.0, ra);
            assert_eq!(decision.final_action, expected, "score={score} ra={ra}");
        }
    }

    #[test]
    fn ignore_band_edges() {
        let cases = [
            (0.89, true, Action::CreateTask),
            (0.60, true, Action::CreateTask),
            (0.5999, true, Action::EscalateHumanReview),
            (0.60, false, Action::EscalateHumanReview),
            (0.45, false, Action::EscalateHumanReview),
            (0.4499, true, Action::Ignore),
            (0.90, true, Action::Ignore),
        ];
        for (score, ra, expected) in cases {
            let decision = route(Action::Ignore, score, 0, 0.0, ra);
            assert_eq!(decision.final_action, expected, "score={score} ra={ra}");
        }
    }

    #[test]
    fn rule_order_matches_table() {
        let router = ActionRouter::default();
        let rules = router.rules();
        assert_eq!(rules.len(), 6);
        assert_eq!(rules[0].condition, Condition::ScoreAtLeast(0.65));
        assert_eq!(rules[3].condition, Condition::ScoreBelow(0.55));
        assert_eq!(rules[4].proposed, Action::Ignore);
    }

    // ── Reasons and invariants ──────────────────────────────────────

    #[test]
    fn divergent_decision_appends_explanation() {
        let decision = route(Action::DraftReply, 0.5, 25, 0.8, true);
        assert!(decision.reason.starts_with("Model reason. "));
        assert!(decision.reason.contains("from draft_reply to create_task"));
        assert!(decision.reason.contains("final score was 0.62"));
        assert!(decision.reason.contains("behavior weight 0.40"));
        assert!(decision.reason.contains("samples 25"));
    }

    #[test]
    fn empty_action_reason_uses_reasoning() {
        let mut input = analysis(Action::CreateTask, 0.5, None);
        input.action_reason = String::new();
        let decision = ActionRouter::default().route(&input, &profile(0, 0.0));
        assert_eq!(decision.reason, "Model reasoning.");
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let decision = ActionRouter::default().route(
            &analysis(Action::DraftReply, 7.0, None),
            &profile(25, -2.0),
        );
        assert_eq!(decision.llm_confidence, 1.0);
        assert_eq!(decision.importance_score, 0.0);
        assert!((0.0..=1.0).contains(&decision.final_score));

        let nan = ActionRouter::default().route(
            &analysis(Action::DraftReply, f64::NAN, None),
            &profile(0, f64::NAN),
        );
        assert_eq!(nan.llm_confidence, 0.0);
        assert_eq!(nan.final_action, Action::EscalateHumanReview);
    }

    #[test]
    fn fallback_analysis_always_escalates() {
        let router = ActionRouter::default();
        let parsed = normalize_analysis("garbage");
        for behavior in [profile(0, 0.0), profile(25, 1.0), profile(3, 0.5)] {
            let decision = router.route(parsed.record(), &behavior);
            assert_eq!(decision.final_action, Action::EscalateHumanReview);
            let decision = router.route(&fallback_analysis("timeout"), &behavior);
            assert_eq!(decision.final_action, Action::EscalateHumanReview);
        }
    }

    #[test]
    fn routing_is_deterministic() {
        let router = ActionRouter::default();
        let input = analysis(Action::DraftReply, 0.61, Some(true));
        let behavior = profile(12, 0.4);
        assert_eq!(router.route(&input, &behavior), router.route(&input, &behavior));
    }

    #[test]
    fn custom_policy_moves_thresholds() {
        let router = ActionRouter::new(RoutingPolicy {
            draft_auto_threshold: 0.5,
            ..RoutingPolicy::default()
        });
        let decision = router.route(&analysis(Action::DraftReply, 0.55, None), &profile(0, 0.0));
        assert_eq!(decision.final_action, Action::DraftReply);
    }
}
