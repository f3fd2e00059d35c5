//! Observed-email source: loads emails produced by the ingestion side.
//!
//! Accepts either a JSON array of emails or one JSON object per line.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::types::ObservedEmail;

/// Domain part after the last `@`, ignoring a trailing `>`.
static SENDER_DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([^@\s<>]+)\s*>?\s*$").unwrap());

/// Lower-cased domain of a sender address, or empty if there is none.
///
/// `"Alice <alice@Example.com>"` → `"example.com"`.
pub fn sender_domain_from_address(sender: &str) -> String {
    SENDER_DOMAIN
        .captures(sender.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default()
}

/// Parse emails from JSON array or JSON-lines text.
///
/// Unparseable lines in JSON-lines input are skipped with a warning.
pub fn parse_observed(text: &str) -> Result<Vec<ObservedEmail>, PipelineError> {
    let trimmed = text.trim_start();
    let mut emails: Vec<ObservedEmail> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| PipelineError::Source(format!("invalid JSON array: {e}")))?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str(line) {
                Ok(email) => Some(email),
                Err(e) => {
                    warn!(line = n + 1, error = %e, "Skipping malformed email line");
                    None
                }
            })
            .collect()
    };

    for email in &mut emails {
        if email.sender_domain.trim().is_empty() {
            email.sender_domain = sender_domain_from_address(&email.sender);
        } else {
            email.sender_domain = email.sender_domain.trim().to_lowercase();
        }
    }
    Ok(emails)
}

/// Read observed emails from a file.
pub async fn load_observed(path: &Path) -> Result<Vec<ObservedEmail>, PipelineError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::Source(format!("{}: {e}", path.display())))?;
    let emails = parse_observed(&text)?;
    debug!(path = %path.display(), count = emails.len(), "Loaded observed emails");
    Ok(emails)
}
