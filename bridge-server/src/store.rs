//! SQLite persistence for the bridge.
//!
//! Three independent tables, each with its own invariant:
//! `issue_threads` (issue ↔ token ↔ requester, last writer wins),
//! `processed_messages` (insert-only dedup set), and `retry_jobs`
//! (the durable outbound retry queue). No mutation spans two tables.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

/// Longest error text persisted on a retry job.
const MAX_LAST_ERROR_LEN: usize = 2000;

/// Outbound side-effect kinds the retry queue can replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOperation {
    SendMail,
    CreateIssueComment,
}

impl JobOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOperation::SendMail => "send_mail",
            JobOperation::CreateIssueComment => "create_issue_comment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "send_mail" => Some(JobOperation::SendMail),
            "create_issue_comment" => Some(JobOperation::CreateIssueComment),
            _ => None,
        }
    }
}

/// One pending outbound side-effect, as read back from the queue.
#[derive(Debug, Clone)]
pub struct RetryJob {
    pub job_id: i64,
    pub operation: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: String,
    pub last_error: String,
    pub created_at: String,
}

/// An issue's email-thread mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueThread {
    pub issue_number: u64,
    pub requester_email: String,
}

/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// Every public method is a single statement (or a single-row upsert), so
/// each mutation is atomic on its own.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS issue_threads (
                issue_number INTEGER PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                requester_email TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS processed_messages (
                internet_message_id TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS retry_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                next_attempt_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                last_error TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Insert or overwrite the thread mapping for an issue.
    /// Re-upserting the same issue number replaces token and requester.
    pub fn upsert_issue_thread(
        &self,
        issue_number: u64,
        token: &str,
        requester_email: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO issue_threads(issue_number, token, requester_email, updated_at)
            VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
            ON CONFLICT(issue_number) DO UPDATE SET
                token = excluded.token,
                requester_email = excluded.requester_email,
                updated_at = CURRENT_TIMESTAMP
            "#,
            rusqlite::params![issue_number, token, requester_email],
        )
        .context("Failed to upsert issue thread")?;

        Ok(())
    }

    /// Look up a thread by its correlation token. The requester address is
    /// returned lowercased, ready for case-insensitive sender comparison.
    pub fn get_issue_thread_by_token(&self, token: &str) -> Result<Option<IssueThread>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT issue_number, requester_email FROM issue_threads WHERE token = ?1")
            .context("Failed to prepare thread lookup")?;

        let result = stmt.query_row(rusqlite::params![token], |row| {
            Ok(IssueThread {
                issue_number: row.get::<_, i64>(0)? as u64,
                requester_email: row.get::<_, String>(1)?,
            })
        });

        match result {
            Ok(mut thread) => {
                thread.requester_email = thread.requester_email.to_lowercase();
                Ok(Some(thread))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to look up issue thread"),
        }
    }

    pub fn is_processed(&self, internet_message_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT 1 FROM processed_messages WHERE internet_message_id = ?1")
            .context("Failed to prepare dedup lookup")?;
        let found = stmt
            .exists(rusqlite::params![internet_message_id])
            .context("Failed to query processed messages")?;
        Ok(found)
    }

    /// Record a message id in the dedup set. Insert-or-ignore, so a
    /// redelivered notification racing another is still a no-op.
    pub fn mark_processed(&self, internet_message_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO processed_messages(internet_message_id) VALUES (?1)",
            rusqlite::params![internet_message_id],
        )
        .context("Failed to mark message processed")?;
        Ok(())
    }

    /// Enqueue a retry job. The first in-line attempt has already failed
    /// by the time a job lands here, so it is immediately due.
    pub fn enqueue_retry_job(
        &self,
        operation: JobOperation,
        payload: &Value,
        max_attempts: u32,
        last_error: &str,
    ) -> Result<i64> {
        let payload_text =
            serde_json::to_string(payload).context("Failed to serialize job payload")?;
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO retry_jobs(operation, payload, max_attempts, last_error)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            rusqlite::params![
                operation.as_str(),
                payload_text,
                max_attempts.max(1),
                truncate_error(last_error),
            ],
        )
        .context("Failed to enqueue retry job")?;

        Ok(conn.last_insert_rowid())
    }

    /// Fetch jobs eligible to run now, ordered by next_attempt_at then id
    /// (FIFO among equally due jobs). Never returns a job scheduled in the
    /// future or one that has exhausted its attempts.
    pub fn get_due_retry_jobs(&self, limit: usize) -> Result<Vec<RetryJob>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, operation, payload, attempts, max_attempts,
                       next_attempt_at, last_error, created_at
                FROM retry_jobs
                WHERE attempts < max_attempts
                  AND datetime(next_attempt_at) <= datetime('now')
                ORDER BY datetime(next_attempt_at) ASC, id ASC
                LIMIT ?1
                "#,
            )
            .context("Failed to prepare due-jobs query")?;

        let rows = stmt
            .query_map(rusqlite::params![limit.max(1) as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query due retry jobs")?;

        let mut jobs = Vec::new();
        for row in rows {
            let (job_id, operation, raw_payload, attempts, max_attempts, next_attempt_at, last_error, created_at) =
                row.context("Failed to read retry job row")?;
            let payload = serde_json::from_str(&raw_payload)
                .unwrap_or_else(|_| serde_json::json!({ "raw_payload": raw_payload }));
            jobs.push(RetryJob {
                job_id,
                operation,
                payload,
                attempts,
                max_attempts,
                next_attempt_at,
                last_error,
                created_at,
            });
        }

        Ok(jobs)
    }

    /// Remove a job after its operation succeeded.
    pub fn mark_retry_job_succeeded(&self, job_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM retry_jobs WHERE id = ?1",
            rusqlite::params![job_id],
        )
        .context("Failed to delete succeeded retry job")?;
        Ok(())
    }

    /// Record a failed attempt and reschedule. `next_attempt_at` only ever
    /// moves forward for a given job.
    pub fn mark_retry_job_failed(
        &self,
        job_id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        let formatted = next_attempt_at.format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            UPDATE retry_jobs
            SET attempts = ?1, next_attempt_at = ?2, last_error = ?3,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?4
            "#,
            rusqlite::params![attempts, formatted, truncate_error(last_error), job_id],
        )
        .context("Failed to reschedule retry job")?;
        Ok(())
    }

    /// Remove a dead-lettered job from the active queue.
    pub fn delete_retry_job(&self, job_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM retry_jobs WHERE id = ?1",
            rusqlite::params![job_id],
        )
        .context("Failed to delete retry job")?;
        Ok(())
    }

    /// Number of jobs still waiting for an attempt.
    pub fn count_retry_jobs(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM retry_jobs WHERE attempts < max_attempts",
                [],
                |row| row.get(0),
            )
            .context("Failed to count retry jobs")?;
        Ok(count as u64)
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_LAST_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_LAST_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> Store {
        Store::new_in_memory().expect("should create in-memory store")
    }

    #[test]
    fn test_upsert_and_lookup_thread() {
        let store = store();
        store
            .upsert_issue_thread(42, "HD-42-abcdefabcdef", "Requester@Example.org")
            .expect("should upsert");

        let thread = store
            .get_issue_thread_by_token("HD-42-abcdefabcdef")
            .expect("should look up")
            .expect("thread exists");
        assert_eq!(thread.issue_number, 42);
        // Requester address comes back lowercased.
        assert_eq!(thread.requester_email, "requester@example.org");

        assert!(store
            .get_issue_thread_by_token("HD-43-abcdefabcdef")
            .expect("should look up")
            .is_none());
    }

    #[test]
    fn test_reupsert_overwrites_thread() {
        let store = store();
        store
            .upsert_issue_thread(42, "HD-42-aaaaaaaaaaaa", "first@example.org")
            .expect("should upsert");
        store
            .upsert_issue_thread(42, "HD-42-bbbbbbbbbbbb", "second@example.org")
            .expect("should upsert");

        assert!(store
            .get_issue_thread_by_token("HD-42-aaaaaaaaaaaa")
            .expect("should look up")
            .is_none());
        let thread = store
            .get_issue_thread_by_token("HD-42-bbbbbbbbbbbb")
            .expect("should look up")
            .expect("thread exists");
        assert_eq!(thread.requester_email, "second@example.org");
    }

    #[test]
    fn test_processed_set_is_idempotent() {
        let store = store();
        assert!(!store.is_processed("<m1@example.org>").unwrap());

        store.mark_processed("<m1@example.org>").expect("first insert");
        store.mark_processed("<m1@example.org>").expect("redelivery is a no-op");

        assert!(store.is_processed("<m1@example.org>").unwrap());
        assert!(!store.is_processed("<m2@example.org>").unwrap());
    }

    #[test]
    fn test_retry_queue_enqueue_and_fetch_due() {
        let store = store();
        let job_id = store
            .enqueue_retry_job(
                JobOperation::SendMail,
                &serde_json::json!({ "recipient": "operator@example.org" }),
                5,
                "boom",
            )
            .expect("should enqueue");

        let jobs = store.get_due_retry_jobs(10).expect("should fetch");
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.operation, "send_mail");
        assert_eq!(job.payload["recipient"], "operator@example.org");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 5);
    }

    #[test]
    fn test_retry_queue_mark_failed_and_success() {
        let store = store();
        let job_id = store
            .enqueue_retry_job(
                JobOperation::CreateIssueComment,
                &serde_json::json!({ "issue_number": 42 }),
                2,
                "first",
            )
            .expect("should enqueue");

        let next_attempt = Utc::now() + Duration::minutes(5);
        store
            .mark_retry_job_failed(job_id, 1, next_attempt, "second")
            .expect("should reschedule");

        // Not due because next attempt is in the future.
        assert!(store.get_due_retry_jobs(10).unwrap().is_empty());
        assert_eq!(store.count_retry_jobs().unwrap(), 1);

        store.mark_retry_job_succeeded(job_id).expect("should delete");
        assert_eq!(store.count_retry_jobs().unwrap(), 0);
    }

    #[test]
    fn test_due_jobs_ordered_by_next_attempt_then_id() {
        let store = store();
        let a = store
            .enqueue_retry_job(JobOperation::SendMail, &serde_json::json!({}), 5, "")
            .unwrap();
        let b = store
            .enqueue_retry_job(JobOperation::SendMail, &serde_json::json!({}), 5, "")
            .unwrap();
        let c = store
            .enqueue_retry_job(JobOperation::SendMail, &serde_json::json!({}), 5, "")
            .unwrap();

        // Reschedule all into the past with distinct due times: c earliest,
        // then a and b sharing an instant (id breaks the tie).
        let now = Utc::now();
        store
            .mark_retry_job_failed(a, 1, now - Duration::minutes(5), "e")
            .unwrap();
        store
            .mark_retry_job_failed(b, 1, now - Duration::minutes(5), "e")
            .unwrap();
        store
            .mark_retry_job_failed(c, 1, now - Duration::minutes(10), "e")
            .unwrap();

        let ids: Vec<i64> = store
            .get_due_retry_jobs(10)
            .unwrap()
            .iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, vec![c, a, b]);
    }

    #[test]
    fn test_exhausted_jobs_are_not_due() {
        let store = store();
        let job_id = store
            .enqueue_retry_job(JobOperation::SendMail, &serde_json::json!({}), 2, "")
            .unwrap();
        store
            .mark_retry_job_failed(job_id, 2, Utc::now() - Duration::minutes(1), "final")
            .unwrap();

        assert!(store.get_due_retry_jobs(10).unwrap().is_empty());
        assert_eq!(store.count_retry_jobs().unwrap(), 0);
    }

    #[test]
    fn test_last_error_is_truncated() {
        let store = store();
        let long_error = "x".repeat(5000);
        let job_id = store
            .enqueue_retry_job(JobOperation::SendMail, &serde_json::json!({}), 5, &long_error)
            .unwrap();

        let jobs = store.get_due_retry_jobs(10).unwrap();
        assert_eq!(jobs[0].job_id, job_id);
        assert_eq!(jobs[0].last_error.len(), MAX_LAST_ERROR_LEN);
    }

    #[test]
    fn test_job_operation_round_trip() {
        for op in [JobOperation::SendMail, JobOperation::CreateIssueComment] {
            assert_eq!(JobOperation::parse(op.as_str()), Some(op));
        }
        assert_eq!(JobOperation::parse("delete_everything"), None);
    }
}
