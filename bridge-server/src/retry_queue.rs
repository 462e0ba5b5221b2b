//! Durable retry queue engine.
//!
//! Each pass drains a bounded batch of due jobs, dispatching by operation
//! kind. A job leaves the queue exactly once: deleted on success, or
//! deleted with a dead-letter alert when it exhausts its attempt budget.
//! Backoff is computed from the job's own attempt count, so passes are
//! deterministic and testable.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::github::CommentCreator;
use crate::graph::MailSender;
use crate::alerts::AlertSink;
use crate::store::{JobOperation, RetryJob, Store};

/// Aggregate result of one processing pass. A nonzero `dead_letter`
/// signals an operational problem to the caller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RetryPassSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub rescheduled: u64,
    pub dead_letter: u64,
    pub pending: u64,
}

pub struct RetryProcessor {
    base_delay_seconds: f64,
    max_delay_seconds: f64,
    batch_size: usize,
    store: Arc<Store>,
    mailer: Arc<dyn MailSender>,
    commenter: Arc<dyn CommentCreator>,
    alerts: Arc<dyn AlertSink>,
}

impl RetryProcessor {
    pub fn new(
        base_delay_seconds: f64,
        max_delay_seconds: f64,
        batch_size: usize,
        store: Arc<Store>,
        mailer: Arc<dyn MailSender>,
        commenter: Arc<dyn CommentCreator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            base_delay_seconds,
            max_delay_seconds,
            batch_size,
            store,
            mailer,
            commenter,
            alerts,
        }
    }

    /// Backoff before the next attempt, from the failed attempt count:
    /// `min(max_delay, base_delay * 2^(attempts-1))`.
    fn next_backoff_seconds(&self, attempts: u32) -> f64 {
        let base = self.base_delay_seconds.max(1.0);
        let max_delay = self.max_delay_seconds.max(base);
        let factor = 2f64.powi(attempts.saturating_sub(1) as i32);
        (base * factor).min(max_delay)
    }

    async fn execute_job(&self, job: &RetryJob) -> Result<()> {
        let operation = JobOperation::parse(&job.operation)
            .ok_or_else(|| anyhow!("unsupported retry operation '{}'", job.operation))?;

        match operation {
            JobOperation::SendMail => {
                self.mailer
                    .send_mail(
                        payload_str(&job.payload, "mailbox")?,
                        payload_str(&job.payload, "recipient")?,
                        payload_str(&job.payload, "subject")?,
                        payload_str(&job.payload, "body_text")?,
                    )
                    .await
            }
            JobOperation::CreateIssueComment => {
                self.commenter
                    .create_issue_comment(
                        payload_str(&job.payload, "owner")?,
                        payload_str(&job.payload, "repo")?,
                        payload_u64(&job.payload, "issue_number")?,
                        payload_str(&job.payload, "body")?,
                    )
                    .await
            }
        }
    }

    /// Run one pass over the due jobs. `limit` overrides the configured
    /// batch size when given.
    pub async fn process_due_jobs(&self, limit: Option<usize>) -> Result<RetryPassSummary> {
        let batch_size = limit.unwrap_or(self.batch_size).max(1);
        let jobs = self.store.get_due_retry_jobs(batch_size)?;

        let mut processed = 0u64;
        let mut succeeded = 0u64;
        let mut rescheduled = 0u64;
        let mut dead_letter = 0u64;

        for job in &jobs {
            processed += 1;
            match self.execute_job(job).await {
                Ok(()) => {
                    self.store.mark_retry_job_succeeded(job.job_id)?;
                    succeeded += 1;
                    info!(
                        job_id = job.job_id,
                        operation = %job.operation,
                        attempts = job.attempts + 1,
                        "Retry job succeeded"
                    );
                }
                Err(e) => {
                    let attempts = job.attempts + 1;
                    let error_text = format!("{:#}", e);

                    if attempts >= job.max_attempts {
                        // Terminal: remove from the active queue and alert.
                        self.store.delete_retry_job(job.job_id)?;
                        dead_letter += 1;
                        error!(
                            job_id = job.job_id,
                            operation = %job.operation,
                            attempts,
                            max_attempts = job.max_attempts,
                            error = %error_text,
                            "Retry job moved to dead-letter state"
                        );
                        self.alerts
                            .notify(
                                "retry_dead_letter",
                                "Retry job reached max attempts",
                                json!({
                                    "job_id": job.job_id,
                                    "operation": job.operation,
                                    "attempts": attempts,
                                    "max_attempts": job.max_attempts,
                                }),
                                Some(&error_text),
                            )
                            .await;
                    } else {
                        let delay = self.next_backoff_seconds(attempts);
                        let next_attempt =
                            Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
                        self.store.mark_retry_job_failed(
                            job.job_id,
                            attempts,
                            next_attempt,
                            &error_text,
                        )?;
                        rescheduled += 1;
                        warn!(
                            job_id = job.job_id,
                            operation = %job.operation,
                            attempts,
                            max_attempts = job.max_attempts,
                            delay_seconds = delay,
                            error = %error_text,
                            "Retry job failed and was rescheduled"
                        );
                    }
                }
            }
        }

        Ok(RetryPassSummary {
            processed,
            succeeded,
            rescheduled,
            dead_letter,
            pending: self.store.count_retry_jobs()?,
        })
    }
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("retry payload missing field '{}'", key))
}

fn payload_u64(payload: &Value, key: &str) -> Result<u64> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("retry payload missing field '{}'", key))
}
