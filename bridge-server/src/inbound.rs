//! Inbound path: Graph change notification to GitHub issue comment.
//!
//! Every skip reason marks the message processed first (except the two
//! checks that run before the message is fetched), so a redelivered
//! notification can never re-run a decision already made. A comment that
//! cannot be posted right now is queued for durable retry and the message
//! is still marked processed; the queue owns delivery from then on.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::alerts::AlertSink;
use crate::config::Config;
use crate::email::{extract_reply_text, html_to_text};
use crate::github::CommentCreator;
use crate::graph::MessageFetcher;
use crate::store::{JobOperation, Store};
use crate::token::parse_subject;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNotificationBatch {
    #[serde(default)]
    pub value: Vec<GraphNotification>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNotification {
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub resource_data: Option<ResourceData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceData {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboundSummary {
    pub processed: usize,
    pub skipped: usize,
}

pub struct InboundProcessor {
    support_mailbox: String,
    client_state: String,
    token_secret: String,
    comment_marker: String,
    github_owner: String,
    github_repo: String,
    retry_max_attempts: u32,
    store: Arc<Store>,
    fetcher: Arc<dyn MessageFetcher>,
    commenter: Arc<dyn CommentCreator>,
    alerts: Arc<dyn AlertSink>,
}

impl InboundProcessor {
    pub fn new(
        config: &Config,
        store: Arc<Store>,
        fetcher: Arc<dyn MessageFetcher>,
        commenter: Arc<dyn CommentCreator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            support_mailbox: config.graph_support_mailbox.clone(),
            client_state: config.graph_client_state.clone(),
            token_secret: config.bridge_token_secret.clone(),
            comment_marker: config.bridge_comment_marker.clone(),
            github_owner: config.github_owner.clone(),
            github_repo: config.github_repo.clone(),
            retry_max_attempts: config.retry_queue_max_attempts,
            store,
            fetcher,
            commenter,
            alerts,
        }
    }

    pub async fn handle_notification(
        &self,
        batch: &GraphNotificationBatch,
    ) -> Result<InboundSummary> {
        let mut summary = InboundSummary::default();

        for notification in &batch.value {
            if self.handle_one(notification).await? {
                summary.processed += 1;
            } else {
                summary.skipped += 1;
            }
        }

        Ok(summary)
    }

    /// Process a single notification. `Ok(true)` means a comment was
    /// posted; `Ok(false)` means the notification was skipped (which may
    /// include queueing the comment for retry).
    async fn handle_one(&self, notification: &GraphNotification) -> Result<bool> {
        let Some(message_id) = notification
            .resource_data
            .as_ref()
            .and_then(|data| data.id.as_deref())
            .filter(|id| !id.is_empty())
        else {
            return Ok(false);
        };

        // Reject before touching the mailbox: an empty expected state
        // fails closed, and a mismatched one is a forged notification.
        let incoming_state = notification.client_state.as_deref().unwrap_or("");
        if self.client_state.is_empty() || incoming_state != self.client_state {
            return Ok(false);
        }

        let message = self
            .fetcher
            .get_message(&self.support_mailbox, message_id)
            .await
            .context("Failed to fetch notified message")?;
        let internet_message_id = message
            .internet_message_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(message_id)
            .to_string();

        if self.store.is_processed(&internet_message_id)? {
            return Ok(false);
        }

        let sender = message.sender_address().unwrap_or("unknown");
        let sender_normalized = sender.trim().to_lowercase();
        if !sender_normalized.is_empty()
            && sender_normalized == self.support_mailbox.trim().to_lowercase()
        {
            // Our own outbound mail looping back through the inbox.
            self.store.mark_processed(&internet_message_id)?;
            return Ok(false);
        }

        let subject = message.subject.as_deref().unwrap_or("");
        let Some((token, _issue_number)) = parse_subject(subject, &self.token_secret) else {
            self.store.mark_processed(&internet_message_id)?;
            return Ok(false);
        };

        let Some(thread) = self.store.get_issue_thread_by_token(&token)? else {
            self.store.mark_processed(&internet_message_id)?;
            return Ok(false);
        };

        if sender_normalized != thread.requester_email {
            warn!(
                sender = %sender_normalized,
                issue_number = thread.issue_number,
                expected = %thread.requester_email,
                "Skipping unauthorized inbound sender"
            );
            self.store.mark_processed(&internet_message_id)?;
            return Ok(false);
        }

        let body_type = message
            .body
            .as_ref()
            .and_then(|body| body.content_type.as_deref())
            .unwrap_or("")
            .to_lowercase();
        let raw_body = message
            .body
            .as_ref()
            .and_then(|body| body.content.as_deref())
            .unwrap_or("");
        let plain = if body_type == "html" {
            html_to_text(raw_body)
        } else {
            raw_body.to_string()
        };
        let reply_text = extract_reply_text(&plain);

        if reply_text.trim().is_empty() {
            self.store.mark_processed(&internet_message_id)?;
            return Ok(false);
        }

        let comment = format!(
            "Email reply from `{}`:\n\n{}\n\n<!-- {} message-id:{} -->",
            sender, reply_text, self.comment_marker, internet_message_id
        );

        let result = self
            .commenter
            .create_issue_comment(
                &self.github_owner,
                &self.github_repo,
                thread.issue_number,
                &comment,
            )
            .await;

        if let Err(e) = result {
            let error_text = format!("{:#}", e);
            let job_id = self.store.enqueue_retry_job(
                JobOperation::CreateIssueComment,
                &json!({
                    "owner": self.github_owner,
                    "repo": self.github_repo,
                    "issue_number": thread.issue_number,
                    "body": comment,
                    "source_event": "graph_reply_comment",
                    "message_id": internet_message_id,
                }),
                self.retry_max_attempts,
                &error_text,
            )?;
            tracing::error!(
                job_id,
                issue_number = thread.issue_number,
                message_id = %internet_message_id,
                error = %error_text,
                "Queued issue-comment retry after inbound processing failure"
            );
            self.alerts
                .notify(
                    "inbound_comment_failed",
                    "Failed to create issue comment from inbound email; queued for retry",
                    json!({
                        "job_id": job_id,
                        "issue_number": thread.issue_number,
                        "message_id": internet_message_id,
                    }),
                    Some(&error_text),
                )
                .await;
            self.store.mark_processed(&internet_message_id)?;
            return Ok(false);
        }

        self.store.mark_processed(&internet_message_id)?;
        info!(
            issue_number = thread.issue_number,
            message_id = %internet_message_id,
            sender = %sender_normalized,
            "Processed Graph inbound notification"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::graph::MailMessage;
    use crate::token::build_subject;

    struct FakeMessageFetcher {
        message: Mutex<Option<MailMessage>>,
        calls: AtomicUsize,
    }

    impl FakeMessageFetcher {
        fn returning(message: MailMessage) -> Self {
            Self {
                message: Mutex::new(Some(message)),
                calls: AtomicUsize::new(0),
            }
        }

        fn unreachable() -> Self {
            Self {
                message: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageFetcher for FakeMessageFetcher {
        async fn get_message(&self, _mailbox: &str, _message_id: &str) -> Result<MailMessage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.message
                .lock()
                .expect("mutex poisoned")
                .clone()
                .ok_or_else(|| anyhow::anyhow!("unexpected message fetch"))
        }
    }

    struct FakeCommentCreator {
        fail: AtomicBool,
        comments: Mutex<Vec<(u64, String)>>,
    }

    impl FakeCommentCreator {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                comments: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommentCreator for FakeCommentCreator {
        async fn create_issue_comment(
            &self,
            _owner: &str,
            _repo: &str,
            issue_number: u64,
            body: &str,
        ) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("github unavailable");
            }
            self.comments
                .lock()
                .expect("mutex poisoned")
                .push((issue_number, body.to_string()));
            Ok(())
        }
    }

    struct FakeAlertSink {
        alerts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertSink for FakeAlertSink {
        async fn notify(&self, alert_type: &str, _: &str, _: Value, _: Option<&str>) {
            self.alerts
                .lock()
                .expect("mutex poisoned")
                .push(alert_type.to_string());
        }
    }

    struct Fixture {
        store: Arc<Store>,
        fetcher: Arc<FakeMessageFetcher>,
        commenter: Arc<FakeCommentCreator>,
        alerts: Arc<FakeAlertSink>,
        processor: InboundProcessor,
    }

    fn fixture(fetcher: FakeMessageFetcher) -> Fixture {
        let config = Config::for_tests();
        let store = Arc::new(Store::new_in_memory().unwrap());
        let fetcher = Arc::new(fetcher);
        let commenter = Arc::new(FakeCommentCreator::new());
        let alerts = Arc::new(FakeAlertSink {
            alerts: Mutex::new(Vec::new()),
        });
        let processor = InboundProcessor::new(
            &config,
            store.clone(),
            fetcher.clone(),
            commenter.clone(),
            alerts.clone(),
        );
        Fixture {
            store,
            fetcher,
            commenter,
            alerts,
            processor,
        }
    }

    fn notification(message_id: &str, client_state: &str) -> GraphNotificationBatch {
        GraphNotificationBatch {
            value: vec![GraphNotification {
                client_state: Some(client_state.to_string()),
                resource_data: Some(ResourceData {
                    id: Some(message_id.to_string()),
                }),
            }],
        }
    }

    fn reply_message(sender: &str, issue_number: u64, body: &str) -> MailMessage {
        let subject = build_subject(issue_number, "Broken build", "super-secret");
        serde_json::from_value(json!({
            "internetMessageId": "<m1@example.org>",
            "subject": subject,
            "from": { "emailAddress": { "address": sender } },
            "body": { "contentType": "text", "content": body },
        }))
        .unwrap()
    }

    fn seed_thread(store: &Store, issue_number: u64, requester: &str) {
        let token = crate::token::build_issue_token(issue_number, "super-secret");
        store
            .upsert_issue_thread(issue_number, &token, requester)
            .unwrap();
    }

    #[tokio::test]
    async fn test_valid_reply_creates_comment_and_marks_processed() {
        let message = reply_message("requester@example.org", 42, "Thanks, that fixed it.");
        let f = fixture(FakeMessageFetcher::returning(message));
        seed_thread(&f.store, 42, "requester@example.org");

        let summary = f
            .processor
            .handle_notification(&notification("graph-id-1", "expected-state"))
            .await
            .unwrap();

        assert_eq!(summary, InboundSummary { processed: 1, skipped: 0 });
        let comments = f.commenter.comments.lock().unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].0, 42);
        assert!(comments[0].1.starts_with("Email reply from `requester@example.org`:"));
        assert!(comments[0].1.contains("Thanks, that fixed it."));
        assert!(comments[0]
            .1
            .contains("<!-- via-issue-email-bridge message-id:<m1@example.org> -->"));
        assert!(f.store.is_processed("<m1@example.org>").unwrap());
    }

    #[tokio::test]
    async fn test_client_state_mismatch_skips_without_fetching() {
        let f = fixture(FakeMessageFetcher::unreachable());

        let summary = f
            .processor
            .handle_notification(&notification("graph-id-1", "wrong-state"))
            .await
            .unwrap();

        assert_eq!(summary, InboundSummary { processed: 0, skipped: 1 });
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_resource_id_skips_without_fetching() {
        let f = fixture(FakeMessageFetcher::unreachable());

        let batch = GraphNotificationBatch {
            value: vec![GraphNotification {
                client_state: Some("expected-state".to_string()),
                resource_data: None,
            }],
        };
        let summary = f.processor.handle_notification(&batch).await.unwrap();

        assert_eq!(summary, InboundSummary { processed: 0, skipped: 1 });
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_message_is_skipped() {
        let message = reply_message("requester@example.org", 42, "Thanks!");
        let f = fixture(FakeMessageFetcher::returning(message));
        seed_thread(&f.store, 42, "requester@example.org");

        let batch = notification("graph-id-1", "expected-state");
        let first = f.processor.handle_notification(&batch).await.unwrap();
        let second = f.processor.handle_notification(&batch).await.unwrap();

        assert_eq!(first.processed, 1);
        assert_eq!(second, InboundSummary { processed: 0, skipped: 1 });
        assert_eq!(f.commenter.comments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_self_loop_sender_is_skipped_and_marked() {
        let message = reply_message("Support@Example.org", 42, "auto-reply");
        let f = fixture(FakeMessageFetcher::returning(message));
        seed_thread(&f.store, 42, "requester@example.org");

        let summary = f
            .processor
            .handle_notification(&notification("graph-id-1", "expected-state"))
            .await
            .unwrap();

        assert_eq!(summary, InboundSummary { processed: 0, skipped: 1 });
        assert!(f.commenter.comments.lock().unwrap().is_empty());
        assert!(f.store.is_processed("<m1@example.org>").unwrap());
    }

    #[tokio::test]
    async fn test_unauthorized_sender_is_skipped() {
        let message = reply_message("attacker@example.org", 42, "let me in");
        let f = fixture(FakeMessageFetcher::returning(message));
        seed_thread(&f.store, 42, "requester@example.org");

        let summary = f
            .processor
            .handle_notification(&notification("graph-id-1", "expected-state"))
            .await
            .unwrap();

        assert_eq!(summary, InboundSummary { processed: 0, skipped: 1 });
        assert!(f.commenter.comments.lock().unwrap().is_empty());
        // Marked processed so the forged message is not re-evaluated.
        assert!(f.store.is_processed("<m1@example.org>").unwrap());
    }

    #[tokio::test]
    async fn test_invalid_subject_token_is_skipped() {
        let message: MailMessage = serde_json::from_value(json!({
            "internetMessageId": "<m1@example.org>",
            "subject": "Re: [HD-42-000000000000] Issue #42: Broken build",
            "from": { "emailAddress": { "address": "requester@example.org" } },
            "body": { "contentType": "text", "content": "hello" },
        }))
        .unwrap();
        let f = fixture(FakeMessageFetcher::returning(message));
        seed_thread(&f.store, 42, "requester@example.org");

        let summary = f
            .processor
            .handle_notification(&notification("graph-id-1", "expected-state"))
            .await
            .unwrap();

        assert_eq!(summary, InboundSummary { processed: 0, skipped: 1 });
        assert!(f.store.is_processed("<m1@example.org>").unwrap());
    }

    #[tokio::test]
    async fn test_empty_reply_after_quote_stripping_is_skipped() {
        let body = "\nOn Mon, Jan 5 2026 support@example.org wrote:\n> old text\n";
        let message = reply_message("requester@example.org", 42, body);
        let f = fixture(FakeMessageFetcher::returning(message));
        seed_thread(&f.store, 42, "requester@example.org");

        let summary = f
            .processor
            .handle_notification(&notification("graph-id-1", "expected-state"))
            .await
            .unwrap();

        assert_eq!(summary, InboundSummary { processed: 0, skipped: 1 });
        assert!(f.commenter.comments.lock().unwrap().is_empty());
        assert!(f.store.is_processed("<m1@example.org>").unwrap());
    }

    #[tokio::test]
    async fn test_comment_failure_queues_retry_and_alerts() {
        let message = reply_message("requester@example.org", 42, "Thanks!");
        let f = fixture(FakeMessageFetcher::returning(message));
        seed_thread(&f.store, 42, "requester@example.org");
        f.commenter.fail.store(true, Ordering::SeqCst);

        let summary = f
            .processor
            .handle_notification(&notification("graph-id-1", "expected-state"))
            .await
            .unwrap();

        assert_eq!(summary, InboundSummary { processed: 0, skipped: 1 });
        assert!(f.store.is_processed("<m1@example.org>").unwrap());

        let jobs = f.store.get_due_retry_jobs(10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].operation, "create_issue_comment");
        assert_eq!(jobs[0].payload["issue_number"], 42);
        assert_eq!(jobs[0].payload["source_event"], "graph_reply_comment");
        assert_eq!(
            f.alerts.alerts.lock().unwrap().as_slice(),
            ["inbound_comment_failed"]
        );
    }
}
