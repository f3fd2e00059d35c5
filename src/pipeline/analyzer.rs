//! Model-backed email analysis and reply drafting.
//!
//! Both calls go through the same path: build prompt → call the model →
//! normalize. A transport failure never escapes; it becomes a fallback
//! record tagged not-ok so the caller can schedule a retry. An unparseable
//! reply draft is not retried: the low-confidence fallback draft is kept.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::executor::ReplyGenerator;
use crate::pipeline::normalize::{
    fallback_analysis, fallback_reply, normalize_analysis, normalize_reply,
};
use crate::pipeline::types::{AnalysisResult, ObservedEmail, ParseOutcome, ReplyDraft};

/// Temperature for analysis (near-deterministic classification).
const ANALYSIS_TEMPERATURE: f32 = 0.1;

/// Temperature for reply drafting.
const REPLY_TEMPERATURE: f32 = 0.2;

const ANALYSIS_MAX_TOKENS: u32 = 512;
const REPLY_MAX_TOKENS: u32 = 1024;

/// Body characters sent to the model.
const CONTENT_PREVIEW_CHARS: usize = 4000;

const ANALYSIS_SYSTEM_PROMPT: &str = "\
You are an executive email assistant. Read the email and judge what the recipient should do.

Decide:
1. Intent: the main purpose of the email.
2. RequiresReply: does the sender expect a response? (true/false)
3. RequiresAction: must the recipient do something beyond replying? (true/false)
4. NextAction: exactly one of ignore, draft_reply, create_task, flag_high_urgency, escalate_human_review.
5. ActionReason: one sentence on why NextAction fits.
6. Urgency: low, medium, or high.
7. Reasoning: a brief explanation.
8. Confidence: a number from 0.0 to 1.0.

Guidance:
- Judge social and professional expectations; do not rely on keywords.
- Newsletters, automated notifications and marketing rarely need replies.
- Direct questions, requests, proposals and confirmations usually do.

Respond with ONLY a JSON object using exactly these keys:
Intent, RequiresReply, RequiresAction, NextAction, ActionReason, Urgency, Reasoning, Confidence.
No markdown, no extra keys.";

const REPLY_SYSTEM_PROMPT: &str = "\
You are an executive email assistant that writes concise, professional reply drafts.

You receive the original email content and a structured analysis of it.
Write a reply that fits the analysis. If no reply is needed, set DraftReply to an
empty string and say why. Never invent facts or commitments absent from the email.

Respond with ONLY a JSON object using exactly these keys: DraftReply, Reasoning, Confidence.
Confidence is a number from 0.0 to 1.0. No markdown, no extra keys.";

/// Runs the analysis and reply prompts against a model provider.
pub struct Analyzer {
    llm: Arc<dyn LlmProvider>,
}

impl Analyzer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Analyze one email. Never fails; check `is_ok()` for retry routing.
    pub async fn analyze(&self, email: &ObservedEmail) -> ParseOutcome<AnalysisResult> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(ANALYSIS_SYSTEM_PROMPT),
            ChatMessage::user(build_analysis_user_prompt(email)),
        ])
        .with_temperature(ANALYSIS_TEMPERATURE)
        .with_max_tokens(ANALYSIS_MAX_TOKENS);

        match self.llm.complete(request).await {
            Ok(response) => {
                let outcome = normalize_analysis(&response.content);
                if let Some(error) = outcome.error() {
                    warn!(
                        email_id = %email.email_id,
                        raw_response = %response.content,
                        error = %error,
                        "Analysis response unusable, falling back to human review"
                    );
                }
                outcome
            }
            Err(e) => {
                warn!(email_id = %email.email_id, error = %e, "Analysis call failed");
                let reasoning = format!("analysis unavailable: {}", e.kind());
                ParseOutcome::Fallback {
                    record: fallback_analysis(&reasoning),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Draft a reply for an analyzed email.
    pub async fn draft_reply(
        &self,
        email: &ObservedEmail,
        analysis: &AnalysisResult,
    ) -> ParseOutcome<ReplyDraft> {
        let payload = serde_json::json!({
            "email_content": email.content,
            "analysis": analysis,
        });

        let request = CompletionRequest::new(vec![
            ChatMessage::system(REPLY_SYSTEM_PROMPT),
            ChatMessage::user(payload.to_string()),
        ])
        .with_temperature(REPLY_TEMPERATURE)
        .with_max_tokens(REPLY_MAX_TOKENS);

        match self.llm.complete(request).await {
            Ok(response) => match normalize_reply(&response.content) {
                ParseOutcome::Valid(draft) => {
                    debug!(email_id = %email.email_id, "Reply draft normalized");
                    ParseOutcome::Valid(draft)
                }
                ParseOutcome::Fallback { record, error } => {
                    warn!(
                        email_id = %email.email_id,
                        error = %error,
                        "Reply payload unusable, keeping low-confidence draft"
                    );
                    ParseOutcome::Valid(record)
                }
            },
            Err(e) => {
                warn!(email_id = %email.email_id, error = %e, "Reply call failed");
                let reasoning = format!("draft unavailable: {}", e.kind());
                ParseOutcome::Fallback {
                    record: fallback_reply(&reasoning),
                    error: e.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl ReplyGenerator for Analyzer {
    async fn generate(
        &self,
        email: &ObservedEmail,
        analysis: &AnalysisResult,
    ) -> ParseOutcome<ReplyDraft> {
        self.draft_reply(email, analysis).await
    }
}

fn build_analysis_user_prompt(email: &ObservedEmail) -> String {
    let mut prompt = String::with_capacity(512);
    if !email.sender.is_empty() {
        prompt.push_str(&format!("From: {}\n", email.sender));
    }
    if !email.subject.is_empty() {
        prompt.push_str(&format!("Subject: {}\n", email.subject));
    }
    let content_preview: String = email.content.chars().take(CONTENT_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nEmail:\n{}", content_preview));
    prompt
}
