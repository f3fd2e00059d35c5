//! Configuration types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Thresholds and weights used by the action router.
///
/// Injected into [`ActionRouter`](crate::pipeline::router::ActionRouter)
/// so scenarios can be exercised without touching routing code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Cap on the share of the final score taken from behavior history.
    pub max_behavior_influence: f64,
    /// Sample count at which behavior reaches its full influence.
    pub full_behavior_at_samples: u32,
    /// Below this many samples a confident ignore is never overridden.
    pub low_sample_invariant_limit: u32,
    /// Model confidence at which an ignore counts as clear.
    pub clear_ignore_confidence: f64,
    /// Final score at or above which a proposed draft is kept.
    pub draft_auto_threshold: f64,
    /// Final score at or above which an actionable email becomes a task.
    pub review_task_threshold: f64,
    /// Final score at or above which the email goes to human review.
    pub review_threshold: f64,
    /// Final score below which a proposed draft is escalated.
    pub draft_min_final_score: f64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_behavior_influence: 0.40,
            full_behavior_at_samples: 25,
            low_sample_invariant_limit: 8,
            clear_ignore_confidence: 0.90,
            draft_auto_threshold: 0.65,
            review_task_threshold: 0.60,
            review_threshold: 0.45,
            draft_min_final_score: 0.55,
        }
    }
}

impl RoutingPolicy {
    /// Load a policy override from a JSON file. Missing keys keep defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let policy: Self = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.max_behavior_influence) {
            return Err(ConfigError::InvalidValue {
                key: "max_behavior_influence".into(),
                message: format!("{} is outside [0, 1]", self.max_behavior_influence),
            });
        }
        if self.full_behavior_at_samples == 0 {
            return Err(ConfigError::InvalidValue {
                key: "full_behavior_at_samples".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Runtime configuration for the agent binary.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Model identifier passed to the LLM provider.
    pub model: String,
    /// Routing thresholds.
    pub routing: RoutingPolicy,
    /// Retry entries replayed at the start of each batch.
    pub retry_drain_limit: usize,
    /// Attempts after which a retry entry is marked failed.
    pub max_retry_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/inbox-agent.db"),
            model: "claude-sonnet-4-20250514".to_string(),
            routing: RoutingPolicy::default(),
            retry_drain_limit: 10,
            max_retry_attempts: 5,
        }
    }
}

impl AgentConfig {
    /// Build configuration from `INBOX_AGENT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("INBOX_AGENT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let model = std::env::var("INBOX_AGENT_MODEL").unwrap_or(defaults.model);

        let routing = match std::env::var("INBOX_AGENT_ROUTING_POLICY") {
            Ok(path) => RoutingPolicy::from_file(Path::new(&path))?,
            Err(_) => defaults.routing,
        };

        let retry_drain_limit = std::env::var("INBOX_AGENT_RETRY_DRAIN_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.retry_drain_limit);

        let max_retry_attempts = std::env::var("INBOX_AGENT_MAX_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_retry_attempts);

        Ok(Self {
            db_path,
            model,
            routing,
            retry_drain_limit,
            max_retry_attempts,
        })
    }
}
