//! Email processor: drives observed emails through the decision pipeline.
//!
//! Flow per email:
//! 1. Skip if already observed
//! 2. Analyze with the model → normalized `AnalysisResult`
//! 3. Behavior profile → adaptive routing → `ActionDecision`
//! 4. Execute, and queue a retry if analysis or execution was not ok
//! 5. Record the observation
//! 6. Log the behavior event (advisory)
//! 7. Replay one pending retry
//!
//! Emails are processed sequentially; each step completes before the next
//! email is considered.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::behavior::{BehaviorSignal, StoreBehaviorSignal};
use crate::config::AgentConfig;
use crate::error::PipelineError;
use crate::llm::provider::LlmProvider;
use crate::pipeline::analyzer::Analyzer;
use crate::pipeline::executor::{ActionExecutor, ExecutionOutcome};
use crate::pipeline::router::ActionRouter;
use crate::pipeline::types::{ActionDecision, AnalysisResult, ObservedEmail, ReplyDraft};
use crate::store::traits::{BehaviorEvent, Database, RetryEntry, RetryStatus};

/// Operation tag for retry entries produced by this processor.
pub const ANALYZE_AND_EXECUTE: &str = "analyze_and_execute";

/// Per-email report emitted by the processor.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedEmail {
    pub email_id: String,
    pub analysis: AnalysisResult,
    pub analysis_ok: bool,
    pub decision: ActionDecision,
    pub execution_ok: bool,
    pub execution_error: Option<String>,
    pub draft: Option<ReplyDraft>,
    /// Whether this email was placed on the retry queue.
    pub retry_queued: bool,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedEmail {
    /// Both the analysis and its execution succeeded.
    pub fn succeeded(&self) -> bool {
        self.analysis_ok && self.execution_ok
    }

    /// Error text recorded against the retry entry.
    ///
    /// An analysis fallback reports its reasoning; an execution failure
    /// reports the executor's error.
    pub fn retry_error(&self) -> Option<String> {
        if !self.analysis_ok {
            Some(self.analysis.reasoning.clone())
        } else if !self.execution_ok {
            Some(
                self.execution_error
                    .clone()
                    .unwrap_or_else(|| "execution failed".to_string()),
            )
        } else {
            None
        }
    }
}

/// Counts from one retry drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub gave_up: usize,
}

/// Runs the analysis → routing → execution pipeline with retry bookkeeping.
pub struct EmailProcessor {
    db: Arc<dyn Database>,
    analyzer: Arc<Analyzer>,
    router: ActionRouter,
    executor: ActionExecutor,
    behavior: Arc<dyn BehaviorSignal>,
    retry_drain_limit: usize,
    max_retry_attempts: u32,
}

impl EmailProcessor {
    /// Wire the pipeline from a model provider and a storage handle.
    pub fn new(db: Arc<dyn Database>, llm: Arc<dyn LlmProvider>, config: &AgentConfig) -> Self {
        let analyzer = Arc::new(Analyzer::new(llm));
        Self {
            executor: ActionExecutor::new(db.clone(), analyzer.clone()),
            behavior: Arc::new(StoreBehaviorSignal::new(db.clone())),
            router: ActionRouter::new(config.routing.clone()),
            analyzer,
            db,
            retry_drain_limit: config.retry_drain_limit,
            max_retry_attempts: config.max_retry_attempts,
        }
    }

    /// Process a single email.
    ///
    /// Returns `Ok(None)` when the email was already observed.
    pub async fn process(
        &self,
        email: &ObservedEmail,
    ) -> Result<Option<ProcessedEmail>, PipelineError> {
        if !email.email_id.is_empty() && self.db.has_observation(&email.email_id).await? {
            debug!(email_id = %email.email_id, "Already observed, skipping");
            return Ok(None);
        }

        info!(
            email_id = %email.email_id,
            sender = %email.sender,
            "Processing observed email"
        );

        let mut processed = self.analyze_and_execute(email).await;

        if let Some(error) = processed.retry_error() {
            self.db
                .enqueue_retry(email, ANALYZE_AND_EXECUTE, &error)
                .await
                .map_err(|e| PipelineError::RetryQueue(e.to_string()))?;
            processed.retry_queued = true;
            info!(email_id = %email.email_id, error = %error, "Queued for retry");
        }

        // Only after retry bookkeeping, so a failed enqueue leaves the email
        // eligible for the next run.
        self.db
            .record_observation(email)
            .await
            .map_err(|e| PipelineError::Observation(e.to_string()))?;

        self.log_behavior(email, &processed).await;

        if let Err(e) = self.drain_retries(1).await {
            warn!(error = %e, "Retry drain after email failed");
        }

        Ok(Some(processed))
    }

    /// Analyze, route, and execute one email. Never fails; the report says
    /// whether a retry is warranted.
    pub async fn analyze_and_execute(&self, email: &ObservedEmail) -> ProcessedEmail {
        let (analysis, analysis_ok) = self.analyzer.analyze(email).await.into_parts();

        let profile = self
            .behavior
            .profile(&analysis.intent, &email.sender_domain)
            .await;
        let decision = self.router.route(&analysis, &profile);

        if decision.diverged() {
            info!(
                email_id = %email.email_id,
                proposed = %decision.proposed_action,
                chosen = %decision.final_action,
                score = decision.final_score,
                "Adaptive routing changed action"
            );
        }

        let ExecutionOutcome { ok, error, draft } =
            self.executor.execute(email, &analysis, &decision).await;

        ProcessedEmail {
            email_id: email.email_id.clone(),
            analysis,
            analysis_ok,
            decision,
            execution_ok: ok,
            execution_error: error,
            draft,
            retry_queued: false,
            processed_at: Utc::now(),
        }
    }

    /// Replay up to `limit` pending retries, oldest first.
    pub async fn drain_retries(&self, limit: usize) -> Result<DrainSummary, PipelineError> {
        let entries = self
            .db
            .pending_retries(limit)
            .await
            .map_err(|e| PipelineError::RetryQueue(e.to_string()))?;

        let mut summary = DrainSummary::default();
        for entry in entries {
            summary.attempted += 1;
            match self.replay(&entry).await? {
                RetryStatus::Done => summary.succeeded += 1,
                RetryStatus::Failed => summary.gave_up += 1,
                RetryStatus::Pending => {}
            }
        }

        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                gave_up = summary.gave_up,
                "Retry drain complete"
            );
        }
        Ok(summary)
    }

    async fn replay(&self, entry: &RetryEntry) -> Result<RetryStatus, PipelineError> {
        if entry.operation != ANALYZE_AND_EXECUTE {
            warn!(id = %entry.id, operation = %entry.operation, "Unknown retry operation");
            return self
                .db
                .record_retry_failure(entry.id, "unsupported operation", self.max_retry_attempts)
                .await
                .map_err(|e| PipelineError::RetryQueue(e.to_string()));
        }

        let processed = self.analyze_and_execute(&entry.email).await;
        let status = match processed.retry_error() {
            None => {
                self.log_behavior(&entry.email, &processed).await;
                self.db.mark_retry_done(entry.id).await.map(|()| RetryStatus::Done)
            }
            Some(error) => {
                self.db
                    .record_retry_failure(entry.id, &error, self.max_retry_attempts)
                    .await
            }
        }
        .map_err(|e| PipelineError::RetryQueue(e.to_string()))?;

        match status {
            RetryStatus::Failed => error!(
                id = %entry.id,
                email_id = %entry.email.email_id,
                attempts = entry.attempts + 1,
                "Retry gave up"
            ),
            _ => debug!(id = %entry.id, status = status.as_str(), "Retry replayed"),
        }
        Ok(status)
    }

    /// Failures here are logged and never affect the outcome.
    async fn log_behavior(&self, email: &ObservedEmail, processed: &ProcessedEmail) {
        let decision = &processed.decision;
        let event = BehaviorEvent {
            email_id: email.email_id.clone(),
            intent: processed.analysis.intent.clone(),
            sender_domain: email.sender_domain.clone(),
            requires_reply: processed.analysis.requires_reply,
            proposed_action: decision.proposed_action.as_str().to_string(),
            agent_action: decision.final_action.as_str().to_string(),
            llm_confidence: decision.llm_confidence,
            behavior_match_score: decision.importance_score,
            final_decision_score: decision.final_score,
            user_final_action: None,
        };
        if let Err(e) = self.db.log_behavior_event(&event).await {
            warn!(email_id = %email.email_id, error = %e, "Failed to log behavior event");
        }
    }

    /// Process a batch after draining the retry queue.
    ///
    /// Failures on individual emails are logged but don't fail the batch.
    pub async fn run_batch(&self, emails: &[ObservedEmail]) -> Vec<ProcessedEmail> {
        if let Err(e) = self.drain_retries(self.retry_drain_limit).await {
            warn!(error = %e, "Initial retry drain failed");
        }

        let count = emails.len();
        info!(count, "Processing email batch");

        let mut results = Vec::with_capacity(count);
        for email in emails {
            match self.process(email).await {
                Ok(Some(processed)) => results.push(processed),
                Ok(None) => {}
                Err(e) => error!(email_id = %email.email_id, error = %e, "Failed to process email"),
            }
        }

        info!(processed = results.len(), total = count, "Batch processing complete");
        results
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason};
    use crate::pipeline::types::Action;
    use crate::store::LibSqlBackend;

    /// Replays scripted responses in order; `None` is a transport failure.
    struct ScriptedLlm {
        script: Mutex<VecDeque<Option<String>>>,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Option<&str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().map(|s| s.map(String::from)).collect()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            match self.script.lock().unwrap().pop_front().flatten() {
                Some(content) => Ok(CompletionResponse {
                    content,
                    input_tokens: 1,
                    output_tokens: 1,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "offline".into(),
                }),
            }
        }
    }

    const TASK_ANALYSIS: &str = r#"{"Intent": "Request", "RequiresReply": false, "RequiresAction": true,
        "NextAction": "create_task", "ActionReason": "Needs doing.", "Urgency": "medium",
        "Reasoning": "Action item", "Confidence": 0.9}"#;

    fn email(id: &str) -> ObservedEmail {
        ObservedEmail {
            email_id: id.into(),
            subject: "Ship the release".into(),
            content: "Please ship v2 today.".into(),
            sender: "lead@acme.io".into(),
            sender_domain: "acme.io".into(),
        }
    }

    async fn processor(llm: Arc<ScriptedLlm>) -> (Arc<dyn Database>, EmailProcessor) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let processor = EmailProcessor::new(db.clone(), llm, &AgentConfig::default());
        (db, processor)
    }

    #[tokio::test]
    async fn processes_email_and_logs_behavior() {
        let (db, processor) = processor(ScriptedLlm::new(vec![Some(TASK_ANALYSIS)])).await;

        let processed = processor.process(&email("m-1")).await.unwrap().unwrap();
        assert!(processed.succeeded());
        assert!(!processed.retry_queued);
        assert_eq!(processed.decision.final_action, Action::CreateTask);
        assert_eq!(db.list_tasks().await.unwrap().len(), 1);

        let events = db.behavior_events_for("Request", "acme.io").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_action, "create_task");
        assert!((events[0].llm_confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn already_observed_is_skipped() {
        let (_db, processor) = processor(ScriptedLlm::new(vec![Some(TASK_ANALYSIS)])).await;
        assert!(processor.process(&email("m-1")).await.unwrap().is_some());
        assert!(processor.process(&email("m-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn analysis_failure_escalates_and_queues_retry() {
        // First call fails; the post-email drain replays and fails again.
        let (db, processor) = processor(ScriptedLlm::new(vec![None, None])).await;

        let processed = processor.process(&email("m-1")).await.unwrap().unwrap();
        assert!(!processed.analysis_ok);
        assert!(processed.retry_queued);
        assert_eq!(processed.decision.final_action, Action::EscalateHumanReview);

        let pending = db.pending_retries(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, ANALYZE_AND_EXECUTE);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].error, "analysis unavailable: RequestFailed");
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_email_unobserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());

        let raw = libsql::Builder::new_local(&path).build().await.unwrap();
        raw.connect()
            .unwrap()
            .execute("DROP TABLE retry_queue", ())
            .await
            .unwrap();

        let processor = EmailProcessor::new(db.clone(), ScriptedLlm::new(vec![None]), &AgentConfig::default());
        let result = processor.process(&email("m-1")).await;
        assert!(matches!(result, Err(PipelineError::RetryQueue(_))));
        assert!(!db.has_observation("m-1").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_reply_keeps_fallback_draft_without_retry() {
        let draft_analysis = r#"{"Intent": "Question", "RequiresReply": true, "RequiresAction": false,
            "NextAction": "draft_reply", "ActionReason": "Direct question.", "Urgency": "low",
            "Reasoning": "Asks for a reply", "Confidence": 0.9}"#;
        let llm = ScriptedLlm::new(vec![Some(draft_analysis), Some("Sure, here is a draft: Hi!")]);
        let (db, processor) = processor(llm).await;

        let processed = processor.process(&email("m-1")).await.unwrap().unwrap();
        assert!(processed.succeeded());
        assert!(!processed.retry_queued);
        assert_eq!(processed.decision.final_action, Action::DraftReply);
        assert!(db.pending_retries(10).await.unwrap().is_empty());

        let state = db.get_action_state("m-1").await.unwrap().unwrap();
        let stored: ReplyDraft = serde_json::from_str(state.reply_json.as_deref().unwrap()).unwrap();
        assert!(stored.draft_reply.is_empty());
        assert!((stored.confidence - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retry_succeeds_on_replay() {
        let (db, processor) = processor(ScriptedLlm::new(vec![None, Some(TASK_ANALYSIS)])).await;

        let processed = processor.process(&email("m-1")).await.unwrap().unwrap();
        assert!(processed.retry_queued);
        assert!(db.pending_retries(10).await.unwrap().is_empty());
        assert_eq!(db.list_tasks().await.unwrap().len(), 1);

        let events = db.behavior_events_for("Request", "").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let (db, processor) = processor(ScriptedLlm::new(vec![])).await;
        let id = db
            .enqueue_retry(&email("m-9"), ANALYZE_AND_EXECUTE, "boom")
            .await
            .unwrap();

        for _ in 0..4 {
            let summary = processor.drain_retries(10).await.unwrap();
            assert_eq!(summary.attempted, 1);
            assert_eq!(summary.gave_up, 0);
        }
        let summary = processor.drain_retries(10).await.unwrap();
        assert_eq!(summary.gave_up, 1);
        assert!(db.pending_retries(10).await.unwrap().iter().all(|e| e.id != id));
        assert_eq!(processor.drain_retries(10).await.unwrap().attempted, 0);
    }

    #[tokio::test]
    async fn run_batch_reports_each_new_email() {
        let llm = ScriptedLlm::new(vec![Some(TASK_ANALYSIS), Some(TASK_ANALYSIS)]);
        let (_db, processor) = processor(llm).await;

        let batch = vec![email("a"), email("b"), email("a")];
        let results = processor.run_batch(&batch).await;
        let ids: Vec<&str> = results.iter().map(|p| p.email_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let json = serde_json::to_value(&results[0]).unwrap();
        assert_eq!(json["decision"]["final_action"], "create_task");
    }
}
