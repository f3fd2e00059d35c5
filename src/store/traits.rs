//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every write is an upsert keyed by email id (or email id + operation for
//! retries), so replaying a message never duplicates side effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::ObservedEmail;

/// A follow-up task created for an email.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub email_id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The recorded outcome of acting on an email.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionState {
    pub email_id: String,
    pub action: String,
    pub reason: String,
    /// `None` when the action does not touch the task queue.
    pub task_status: Option<String>,
    pub urgent_flag: bool,
    pub needs_human_review: bool,
    /// Serialized `ReplyDraft`, for draft actions.
    pub reply_json: Option<String>,
}

impl ActionState {
    pub fn new(email_id: &str, action: &str, reason: &str) -> Self {
        Self {
            email_id: email_id.to_string(),
            action: action.to_string(),
            reason: reason.to_string(),
            task_status: None,
            urgent_flag: false,
            needs_human_review: false,
            reply_json: None,
        }
    }

    pub fn with_task_status(mut self, status: &str) -> Self {
        self.task_status = Some(status.to_string());
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent_flag = true;
        self
    }

    pub fn needs_review(mut self) -> Self {
        self.needs_human_review = true;
        self
    }

    pub fn with_reply(mut self, reply_json: String) -> Self {
        self.reply_json = Some(reply_json);
        self
    }
}

/// Lifecycle of a retry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    Pending,
    Done,
    /// Gave up after the maximum number of attempts.
    Failed,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A failed operation waiting to be replayed.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub id: Uuid,
    pub email: ObservedEmail,
    pub operation: String,
    pub error: String,
    pub attempts: u32,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One routing decision, later annotated with what the user did.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorEvent {
    pub email_id: String,
    pub intent: String,
    pub sender_domain: String,
    pub requires_reply: Option<bool>,
    pub proposed_action: String,
    pub agent_action: String,
    pub llm_confidence: f64,
    pub behavior_match_score: f64,
    pub final_decision_score: f64,
    /// `None` until feedback is recorded.
    pub user_final_action: Option<String>,
}

/// Backend-agnostic persistence for observations, tasks, action state,
/// retries, and behavior history.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Observations ────────────────────────────────────────────────

    /// Whether this email has already been observed.
    async fn has_observation(&self, email_id: &str) -> Result<bool, DatabaseError>;

    /// Record an observed email. Re-recording the same id is a no-op.
    async fn record_observation(&self, email: &ObservedEmail) -> Result<(), DatabaseError>;

    // ── Task queue ──────────────────────────────────────────────────

    /// Insert or refresh the task for `email_id`.
    ///
    /// On conflict only title, description and `updated_at` change; a
    /// non-empty status is left untouched.
    async fn upsert_task(
        &self,
        email_id: &str,
        title: &str,
        description: &str,
    ) -> Result<(), DatabaseError>;

    async fn get_task(&self, email_id: &str) -> Result<Option<TaskRecord>, DatabaseError>;

    /// All tasks, oldest first.
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError>;

    // ── Action state ────────────────────────────────────────────────

    /// Insert or replace the action state for an email.
    async fn store_action_state(&self, state: &ActionState) -> Result<(), DatabaseError>;

    async fn get_action_state(&self, email_id: &str) -> Result<Option<ActionState>, DatabaseError>;

    // ── Retry queue ─────────────────────────────────────────────────

    /// Queue an operation for replay. Keyed by (email id, operation):
    /// re-enqueueing refreshes the error and resets the entry to pending.
    async fn enqueue_retry(
        &self,
        email: &ObservedEmail,
        operation: &str,
        error: &str,
    ) -> Result<Uuid, DatabaseError>;

    /// Pending entries, oldest first.
    async fn pending_retries(&self, limit: usize) -> Result<Vec<RetryEntry>, DatabaseError>;

    async fn mark_retry_done(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Count a failed attempt. Returns the resulting status, which is
    /// `Failed` once `max_attempts` is reached.
    async fn record_retry_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<RetryStatus, DatabaseError>;

    // ── Behavior history ────────────────────────────────────────────

    /// Insert or refresh the event for an email, preserving recorded feedback.
    async fn log_behavior_event(&self, event: &BehaviorEvent) -> Result<(), DatabaseError>;

    /// Attach the user's final action. Returns `false` if no event exists.
    async fn record_user_final_action(
        &self,
        email_id: &str,
        action: &str,
    ) -> Result<bool, DatabaseError>;

    /// Events whose sender domain matches, or whose intent matches
    /// case-insensitively.
    async fn behavior_events_for(
        &self,
        intent: &str,
        sender_domain: &str,
    ) -> Result<Vec<BehaviorEvent>, DatabaseError>;
}
