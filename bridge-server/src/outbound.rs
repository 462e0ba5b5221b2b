//! Outbound path: GitHub webhook event to requester email.
//!
//! The thread mapping is upserted before the send is attempted, so the
//! inbound path can correlate a reply even if this notification email
//! ends up delivered later through the retry queue.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::alerts::AlertSink;
use crate::config::Config;
use crate::email::extract_reply_text;
use crate::graph::MailSender;
use crate::issue_body::extract_requester_contact;
use crate::store::{JobOperation, Store};
use crate::token::{build_issue_token, build_subject};

const ISSUE_ACTIONS: [&str; 4] = ["opened", "edited", "reopened", "closed"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssuePayload {
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentPayload {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SenderPayload {
    #[serde(default)]
    pub login: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubEventPayload {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub issue: Option<IssuePayload>,
    #[serde(default)]
    pub comment: Option<CommentPayload>,
    #[serde(default)]
    pub sender: Option<SenderPayload>,
}

/// What happened to one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutboundOutcome {
    Ignored { reason: String },
    Sent { event: String, issue_number: u64, recipient: String },
    Queued {
        event: String,
        issue_number: u64,
        recipient: String,
        retry_job_id: i64,
    },
}

pub struct OutboundProcessor {
    support_mailbox: String,
    token_secret: String,
    comment_marker: String,
    retry_max_attempts: u32,
    store: Arc<Store>,
    mailer: Arc<dyn MailSender>,
    alerts: Arc<dyn AlertSink>,
}

impl OutboundProcessor {
    pub fn new(
        config: &Config,
        store: Arc<Store>,
        mailer: Arc<dyn MailSender>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            support_mailbox: config.graph_support_mailbox.clone(),
            token_secret: config.bridge_token_secret.clone(),
            comment_marker: config.bridge_comment_marker.clone(),
            retry_max_attempts: config.retry_queue_max_attempts,
            store,
            mailer,
            alerts,
        }
    }

    pub async fn handle_github_event(
        &self,
        event: &str,
        payload: &GitHubEventPayload,
    ) -> Result<OutboundOutcome> {
        match event {
            "issues" => self.handle_issues_event(payload).await,
            "issue_comment" => self.handle_issue_comment_event(payload).await,
            other => Ok(ignored(format!("unsupported event {}", other))),
        }
    }

    async fn handle_issues_event(&self, payload: &GitHubEventPayload) -> Result<OutboundOutcome> {
        let action = payload.action.as_deref().unwrap_or("");
        if !ISSUE_ACTIONS.contains(&action) {
            return Ok(ignored(format!("unsupported issues action {}", action)));
        }

        let issue = payload.issue.clone().unwrap_or_default();
        if issue.number == 0 {
            return Ok(ignored("missing issue number".to_string()));
        }

        let Some(requester_email) = extract_requester_contact(issue.body.as_deref().unwrap_or(""))
        else {
            return Ok(ignored(
                "requester contact not found in issue body".to_string(),
            ));
        };

        let sender_login = sender_login(payload);
        let subject = self.subject_for(&issue);
        let body = build_issue_email_body(action, &issue, &sender_login);

        self.map_thread(issue.number, &requester_email)?;
        self.deliver(
            "issues",
            &format!("issues:{}", action),
            issue.number,
            &requester_email,
            &subject,
            &body,
        )
        .await
    }

    async fn handle_issue_comment_event(
        &self,
        payload: &GitHubEventPayload,
    ) -> Result<OutboundOutcome> {
        let action = payload.action.as_deref().unwrap_or("");
        if action != "created" {
            return Ok(ignored(format!(
                "unsupported issue_comment action {}",
                action
            )));
        }

        let issue = payload.issue.clone().unwrap_or_default();
        if issue.number == 0 {
            return Ok(ignored("missing issue number".to_string()));
        }

        let comment = payload.comment.clone().unwrap_or_default();
        // Loop prevention: never email the requester about a comment the
        // bridge itself posted.
        if comment
            .body
            .as_deref()
            .unwrap_or("")
            .contains(&self.comment_marker)
        {
            return Ok(ignored("bridge-authored comment".to_string()));
        }

        let Some(requester_email) = extract_requester_contact(issue.body.as_deref().unwrap_or(""))
        else {
            return Ok(ignored(
                "requester contact not found in issue body".to_string(),
            ));
        };

        let sender_login = sender_login(payload);
        let subject = self.subject_for(&issue);
        let body = build_comment_email_body(&issue, &comment, &sender_login);

        self.map_thread(issue.number, &requester_email)?;
        self.deliver(
            "issue_comment",
            "issue_comment:created",
            issue.number,
            &requester_email,
            &subject,
            &body,
        )
        .await
    }

    fn subject_for(&self, issue: &IssuePayload) -> String {
        build_subject(
            issue.number,
            issue.title.as_deref().unwrap_or("(no title)"),
            &self.token_secret,
        )
    }

    fn map_thread(&self, issue_number: u64, requester_email: &str) -> Result<()> {
        let token = build_issue_token(issue_number, &self.token_secret);
        self.store
            .upsert_issue_thread(issue_number, &token, requester_email)
    }

    async fn deliver(
        &self,
        event: &str,
        source_event: &str,
        issue_number: u64,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<OutboundOutcome> {
        let result = self
            .mailer
            .send_mail(&self.support_mailbox, recipient, subject, body)
            .await;

        match result {
            Ok(()) => {
                info!(
                    event,
                    issue_number,
                    recipient,
                    delivery = "sent",
                    "Processed GitHub webhook event"
                );
                Ok(OutboundOutcome::Sent {
                    event: event.to_string(),
                    issue_number,
                    recipient: recipient.to_string(),
                })
            }
            Err(e) => {
                let error_text = format!("{:#}", e);
                let job_id = self.store.enqueue_retry_job(
                    JobOperation::SendMail,
                    &json!({
                        "mailbox": self.support_mailbox,
                        "recipient": recipient,
                        "subject": subject,
                        "body_text": body,
                        "issue_number": issue_number,
                        "source_event": source_event,
                    }),
                    self.retry_max_attempts,
                    &error_text,
                )?;
                tracing::error!(
                    job_id,
                    issue_number,
                    recipient,
                    source_event,
                    error = %error_text,
                    "Queued outbound email retry"
                );
                self.alerts
                    .notify(
                        "outbound_delivery_failed",
                        "Failed to send outbound issue email; queued for retry",
                        json!({
                            "job_id": job_id,
                            "issue_number": issue_number,
                            "recipient": recipient,
                            "source_event": source_event,
                        }),
                        Some(&error_text),
                    )
                    .await;
                Ok(OutboundOutcome::Queued {
                    event: event.to_string(),
                    issue_number,
                    recipient: recipient.to_string(),
                    retry_job_id: job_id,
                })
            }
        }
    }
}

fn ignored(reason: String) -> OutboundOutcome {
    OutboundOutcome::Ignored { reason }
}

fn sender_login(payload: &GitHubEventPayload) -> String {
    payload
        .sender
        .as_ref()
        .and_then(|sender| sender.login.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

fn build_issue_email_body(action: &str, issue: &IssuePayload, sender_login: &str) -> String {
    let issue_body = extract_reply_text(issue.body.as_deref().unwrap_or(""));
    format!(
        "Issue update\n\n\
         Action: {}\n\
         Issue: #{} - {}\n\
         Updated by: {}\n\
         URL: {}\n\n\
         Current issue summary:\n{}\n",
        action,
        issue.number,
        issue.title.as_deref().unwrap_or(""),
        sender_login,
        issue.html_url.as_deref().unwrap_or(""),
        issue_body
    )
}

fn build_comment_email_body(
    issue: &IssuePayload,
    comment: &CommentPayload,
    sender_login: &str,
) -> String {
    let comment_text = extract_reply_text(comment.body.as_deref().unwrap_or(""));
    format!(
        "Issue comment update\n\n\
         Issue: #{} - {}\n\
         Comment by: {}\n\
         Issue URL: {}\n\
         Comment URL: {}\n\n\
         Comment:\n{}\n",
        issue.number,
        issue.title.as_deref().unwrap_or(""),
        sender_login,
        issue.html_url.as_deref().unwrap_or(""),
        comment.html_url.as_deref().unwrap_or(""),
        comment_text
    )
}
