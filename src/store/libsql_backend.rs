//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::ObservedEmail;
use crate::store::migrations;
use crate::store::traits::{
    ActionState, BehaviorEvent, Database, RetryEntry, RetryStatus, TaskRecord,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_bool(b: Option<bool>) -> libsql::Value {
    match b {
        Some(b) => libsql::Value::Integer(i64::from(b)),
        None => libsql::Value::Null,
    }
}

const TASK_COLUMNS: &str = "email_id, title, description, status, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, libsql::Error> {
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;
    Ok(TaskRecord {
        email_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const RETRY_COLUMNS: &str = "id, payload, operation, error, attempts, status, created_at, updated_at";

fn row_to_retry(row: &libsql::Row) -> Result<RetryEntry, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("retry row: {e}"));
    let id_str: String = row.get(0).map_err(read)?;
    let payload: String = row.get(1).map_err(read)?;
    let attempts: i64 = row.get(4).map_err(read)?;
    let status_str: String = row.get(5).map_err(read)?;
    let created_str: String = row.get(6).map_err(read)?;
    let updated_str: String = row.get(7).map_err(read)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("retry id '{id_str}': {e}")))?;
    let email: ObservedEmail = serde_json::from_str(&payload)
        .map_err(|e| DatabaseError::Serialization(format!("retry payload {id}: {e}")))?;

    Ok(RetryEntry {
        id,
        email,
        operation: row.get(2).map_err(read)?,
        error: row.get(3).map_err(read)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        status: RetryStatus::parse(&status_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const BEHAVIOR_COLUMNS: &str = "email_id, intent, sender_domain, requires_reply, proposed_action, \
     agent_action, llm_confidence, behavior_match_score, final_decision_score, user_final_action";

fn row_to_behavior(row: &libsql::Row) -> Result<BehaviorEvent, libsql::Error> {
    let requires_reply: Option<i64> = row.get(3).ok();
    Ok(BehaviorEvent {
        email_id: row.get(0)?,
        intent: row.get(1)?,
        sender_domain: row.get(2)?,
        requires_reply: requires_reply.map(|v| v != 0),
        proposed_action: row.get(4)?,
        agent_action: row.get(5)?,
        llm_confidence: row.get(6)?,
        behavior_match_score: row.get(7)?,
        final_decision_score: row.get(8)?,
        user_final_action: row.get::<String>(9).ok().filter(|s| !s.is_empty()),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Observations ────────────────────────────────────────────────

    async fn has_observation(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM observed_emails WHERE email_id = ?1 LIMIT 1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_observation: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("has_observation: {e}")))?;
        Ok(row.is_some())
    }

    async fn record_observation(&self, email: &ObservedEmail) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO observed_emails
                    (email_id, subject, content, sender, sender_domain, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    email.email_id.as_str(),
                    email.subject.as_str(),
                    email.content.as_str(),
                    email.sender.as_str(),
                    email.sender_domain.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_observation: {e}")))?;
        Ok(())
    }

    // ── Task queue ──────────────────────────────────────────────────

    async fn upsert_task(
        &self,
        email_id: &str,
        title: &str,
        description: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO task_queue (email_id, title, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'open', ?4, ?4)
                 ON CONFLICT (email_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    status = CASE WHEN task_queue.status = '' THEN 'open' ELSE task_queue.status END,
                    updated_at = excluded.updated_at",
                params![email_id, title, description, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_task: {e}")))?;
        debug!(email_id, "Task upserted");
        Ok(())
    }

    async fn get_task(&self, email_id: &str) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?
        {
            Some(row) => Ok(Some(
                row_to_task(&row).map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue ORDER BY created_at, rowid"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    // ── Action state ────────────────────────────────────────────────

    async fn store_action_state(&self, state: &ActionState) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO action_states
                    (email_id, action, reason, task_status, urgent_flag, needs_human_review,
                     reply_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (email_id) DO UPDATE SET
                    action = excluded.action,
                    reason = excluded.reason,
                    task_status = excluded.task_status,
                    urgent_flag = excluded.urgent_flag,
                    needs_human_review = excluded.needs_human_review,
                    reply_json = excluded.reply_json,
                    updated_at = excluded.updated_at",
                params![
                    state.email_id.as_str(),
                    state.action.as_str(),
                    state.reason.as_str(),
                    opt_text(state.task_status.as_deref()),
                    i64::from(state.urgent_flag),
                    i64::from(state.needs_human_review),
                    opt_text(state.reply_json.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_action_state: {e}")))?;
        debug!(email_id = %state.email_id, action = %state.action, "Action state stored");
        Ok(())
    }

    async fn get_action_state(&self, email_id: &str) -> Result<Option<ActionState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT email_id, action, reason, task_status, urgent_flag, needs_human_review,
                        reply_json
                 FROM action_states WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_action_state: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_action_state: {e}")))?
        else {
            return Ok(None);
        };

        let read = |e: libsql::Error| DatabaseError::Query(format!("get_action_state: {e}"));
        let urgent: i64 = row.get(4).map_err(read)?;
        let review: i64 = row.get(5).map_err(read)?;
        Ok(Some(ActionState {
            email_id: row.get(0).map_err(read)?,
            action: row.get(1).map_err(read)?,
            reason: row.get(2).map_err(read)?,
            task_status: row.get(3).ok(),
            urgent_flag: urgent != 0,
            needs_human_review: review != 0,
            reply_json: row.get(6).ok(),
        }))
    }

    // ── Retry queue ─────────────────────────────────────────────────

    async fn enqueue_retry(
        &self,
        email: &ObservedEmail,
        operation: &str,
        error: &str,
    ) -> Result<Uuid, DatabaseError> {
        let payload = serde_json::to_string(email)
            .map_err(|e| DatabaseError::Serialization(format!("retry payload: {e}")))?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();

        conn.execute(
            "INSERT INTO retry_queue
                (id, email_id, payload, operation, error, attempts, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending', ?6, ?6)
             ON CONFLICT (email_id, operation) DO UPDATE SET
                payload = excluded.payload,
                error = excluded.error,
                status = 'pending',
                updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                email.email_id.as_str(),
                payload,
                operation,
                error,
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("enqueue_retry: {e}")))?;

        let mut rows = conn
            .query(
                "SELECT id FROM retry_queue WHERE email_id = ?1 AND operation = ?2",
                params![email.email_id.as_str(), operation],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_retry: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_retry: {e}")))?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "retry_queue".into(),
                id: email.email_id.clone(),
            })?;
        let id_str: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("enqueue_retry: {e}")))?;
        let id = Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("retry id '{id_str}': {e}")))?;

        debug!(id = %id, email_id = %email.email_id, operation, "Retry enqueued");
        Ok(id)
    }

    async fn pending_retries(&self, limit: usize) -> Result<Vec<RetryEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RETRY_COLUMNS} FROM retry_queue
                     WHERE status = 'pending'
                     ORDER BY created_at, rowid
                     LIMIT ?1"
                ),
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_retries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_retry(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping retry row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn mark_retry_done(&self, id: Uuid) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE retry_queue SET status = 'done', updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_retry_done: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "retry_queue".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_retry_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<RetryStatus, DatabaseError> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE retry_queue SET
                    attempts = attempts + 1,
                    error = ?2,
                    status = CASE WHEN attempts + 1 >= ?3 THEN 'failed' ELSE 'pending' END,
                    updated_at = ?4
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    error,
                    i64::from(max_attempts),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_retry_failure: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "retry_queue".into(),
                id: id.to_string(),
            });
        }

        let mut rows = conn
            .query(
                "SELECT status FROM retry_queue WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_retry_failure: {e}")))?;
        let status: String = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or_default(),
            _ => String::new(),
        };
        Ok(RetryStatus::parse(&status))
    }

    // ── Behavior history ────────────────────────────────────────────

    async fn log_behavior_event(&self, event: &BehaviorEvent) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO behavior_events
                    (email_id, intent, sender_domain, requires_reply, proposed_action, agent_action,
                     llm_confidence, behavior_match_score, final_decision_score, user_final_action,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT (email_id) DO UPDATE SET
                    intent = excluded.intent,
                    sender_domain = excluded.sender_domain,
                    requires_reply = excluded.requires_reply,
                    proposed_action = excluded.proposed_action,
                    agent_action = excluded.agent_action,
                    llm_confidence = excluded.llm_confidence,
                    behavior_match_score = excluded.behavior_match_score,
                    final_decision_score = excluded.final_decision_score,
                    user_final_action = COALESCE(behavior_events.user_final_action,
                                                 excluded.user_final_action),
                    updated_at = excluded.updated_at",
                params![
                    event.email_id.as_str(),
                    event.intent.as_str(),
                    event.sender_domain.as_str(),
                    opt_bool(event.requires_reply),
                    event.proposed_action.as_str(),
                    event.agent_action.as_str(),
                    event.llm_confidence,
                    event.behavior_match_score,
                    event.final_decision_score,
                    opt_text(event.user_final_action.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_behavior_event: {e}")))?;
        Ok(())
    }

    async fn record_user_final_action(
        &self,
        email_id: &str,
        action: &str,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE behavior_events SET user_final_action = ?2, updated_at = ?3
                 WHERE email_id = ?1",
                params![email_id, action, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_user_final_action: {e}")))?;
        Ok(updated > 0)
    }

    async fn behavior_events_for(
        &self,
        intent: &str,
        sender_domain: &str,
    ) -> Result<Vec<BehaviorEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BEHAVIOR_COLUMNS} FROM behavior_events
                     WHERE (?2 != '' AND sender_domain = ?2)
                        OR (?1 != '' AND intent = ?1 COLLATE NOCASE)
                     ORDER BY created_at, rowid"
                ),
                params![intent, sender_domain],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("behavior_events_for: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_behavior(&row) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping behavior row: {e}"),
            }
        }
        Ok(events)
    }
}
