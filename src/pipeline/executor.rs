//! Action executor: applies a routing decision as side effects.
//!
//! Every path writes an action state keyed by email id, so executing the
//! same decision twice converges on the same stored state. Nothing here
//! returns `Err`; failures are reported through [`ExecutionOutcome`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{
    Action, ActionDecision, AnalysisResult, ObservedEmail, ParseOutcome, ReplyDraft,
};
use crate::store::traits::{ActionState, Database};

/// Body characters copied into a task description.
const TASK_EXCERPT_CHARS: usize = 1500;

const DEFAULT_TASK_TITLE: &str = "Email follow-up task";
const DEFAULT_TASK_DESCRIPTION: &str = "Follow up required based on email analysis.";

/// Status given to newly created tasks.
pub const TASK_STATUS_OPEN: &str = "open";

/// Produces reply drafts for the `draft_reply` action.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, email: &ObservedEmail, analysis: &AnalysisResult)
    -> ParseOutcome<ReplyDraft>;
}

/// Result of executing one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub error: Option<String>,
    /// The draft, for `draft_reply`; otherwise the not-generated placeholder.
    pub draft: Option<ReplyDraft>,
}

impl ExecutionOutcome {
    fn success(draft: ReplyDraft) -> Self {
        Self {
            ok: true,
            error: None,
            draft: Some(draft),
        }
    }

    fn failure(error: impl Into<String>, draft: Option<ReplyDraft>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            draft,
        }
    }
}

/// Applies actions against the task queue and action-state store.
pub struct ActionExecutor {
    db: Arc<dyn Database>,
    replies: Arc<dyn ReplyGenerator>,
}

impl ActionExecutor {
    pub fn new(db: Arc<dyn Database>, replies: Arc<dyn ReplyGenerator>) -> Self {
        Self { db, replies }
    }

    /// Execute the decision's final action.
    pub async fn execute(
        &self,
        email: &ObservedEmail,
        analysis: &AnalysisResult,
        decision: &ActionDecision,
    ) -> ExecutionOutcome {
        let action = decision.final_action;
        let reason = decision.reason.as_str();

        let outcome = self.run(email, action, analysis, reason).await;

        if outcome.ok {
            info!(email_id = %email.email_id, action = %action, "Action executed");
        } else {
            warn!(
                email_id = %email.email_id,
                action = %action,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Action execution failed"
            );
        }
        outcome
    }

    /// Execute an action given by its textual tag, e.g. one read back from
    /// storage. Unknown tags are reported as not ok.
    ///
    /// `draft_reply` needs an analysis, so one is synthesized from `reason`.
    pub async fn execute_named(
        &self,
        email: &ObservedEmail,
        tag: &str,
        reason: &str,
    ) -> ExecutionOutcome {
        let Ok(action) = tag.parse::<Action>() else {
            warn!(email_id = %email.email_id, tag, "Unsupported action tag");
            return ExecutionOutcome::failure("unsupported action", None);
        };

        let mut analysis = crate::pipeline::normalize::fallback_analysis(reason);
        analysis.next_action = action;
        analysis.action_reason = reason.to_string();
        self.run(email, action, &analysis, reason).await
    }

    async fn run(
        &self,
        email: &ObservedEmail,
        action: Action,
        analysis: &AnalysisResult,
        reason: &str,
    ) -> ExecutionOutcome {
        let id = email.email_id.as_str();
        let result = match action {
            Action::DraftReply => return self.draft_reply(email, analysis, reason).await,
            Action::Ignore => self.store(ActionState::new(id, action.as_str(), reason)).await,
            Action::CreateTask => self.create_task(email, reason).await,
            Action::FlagHighUrgency => {
                self.store(ActionState::new(id, action.as_str(), reason).urgent())
                    .await
            }
            Action::EscalateHumanReview => {
                self.store(ActionState::new(id, action.as_str(), reason).needs_review())
                    .await
            }
        };

        match result {
            Ok(()) => ExecutionOutcome::success(ReplyDraft::not_generated()),
            Err(e) => ExecutionOutcome::failure(e.to_string(), None),
        }
    }

    async fn draft_reply(
        &self,
        email: &ObservedEmail,
        analysis: &AnalysisResult,
        reason: &str,
    ) -> ExecutionOutcome {
        let draft = match self.replies.generate(email, analysis).await {
            ParseOutcome::Valid(draft) => draft,
            ParseOutcome::Fallback { record, error } => {
                return ExecutionOutcome::failure(error, Some(record));
            }
        };

        let reply_json = match serde_json::to_string(&draft) {
            Ok(json) => json,
            Err(e) => return ExecutionOutcome::failure(format!("draft serialization: {e}"), None),
        };

        let state = ActionState::new(&email.email_id, Action::DraftReply.as_str(), reason)
            .with_reply(reply_json);
        match self.db.store_action_state(&state).await {
            Ok(()) => ExecutionOutcome::success(draft),
            Err(e) => ExecutionOutcome::failure(e.to_string(), Some(draft)),
        }
    }

    async fn create_task(&self, email: &ObservedEmail, reason: &str) -> Result<(), DatabaseError> {
        if email.email_id.is_empty() {
            debug!("Email has no id, skipping task creation");
        } else {
            let (title, description) = task_fields(email, reason);
            self.db.upsert_task(&email.email_id, &title, &description).await?;
        }
        self.store(
            ActionState::new(&email.email_id, Action::CreateTask.as_str(), reason)
                .with_task_status(TASK_STATUS_OPEN),
        )
        .await
    }

    async fn store(&self, state: ActionState) -> Result<(), DatabaseError> {
        self.db.store_action_state(&state).await
    }
}

/// Title and description for the task created from an email.
pub fn task_fields(email: &ObservedEmail, reason: &str) -> (String, String) {
    let title = match email.subject.trim() {
        "" => DEFAULT_TASK_TITLE.to_string(),
        subject => subject.to_string(),
    };
    let base = match reason.trim() {
        "" => DEFAULT_TASK_DESCRIPTION,
        reason => reason,
    };
    let excerpt: String = email.content.trim().chars().take(TASK_EXCERPT_CHARS).collect();
    let description = if excerpt.is_empty() {
        base.to_string()
    } else {
        format!("{base}\n\nEmail excerpt:\n{excerpt}")
    };
    (title, description)
}
