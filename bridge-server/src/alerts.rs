//! Operator alert side-channel.
//!
//! Alerts go out over a webhook and/or email, both best-effort: a failed
//! alert delivery is logged and never escalated further, so a broken
//! alert channel cannot trigger an alert storm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::error;

use crate::api::{with_retry, RetryPolicy};
use crate::config::Config;
use crate::graph::MailSender;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Receives operator-visible alerts. Delivery is best-effort and
/// infallible from the caller's perspective.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert_type: &str, summary: &str, context: Value, error: Option<&str>);
}

pub struct AlertService {
    client: Client,
    policy: RetryPolicy,
    webhook_url: String,
    email_to: String,
    subject_prefix: String,
    support_mailbox: String,
    mailer: Arc<dyn MailSender>,
}

impl AlertService {
    pub fn new(config: &Config, mailer: Arc<dyn MailSender>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            client,
            policy: RetryPolicy::new(
                config.api_retry_max_attempts,
                config.api_retry_base_delay_seconds.max(0.5),
                config.api_retry_max_delay_seconds.max(1.0),
            ),
            webhook_url: config.alert_webhook_url.clone(),
            email_to: config.alert_email_to.clone(),
            subject_prefix: config.alert_subject_prefix.clone(),
            support_mailbox: config.graph_support_mailbox.clone(),
            mailer,
        }
    }

    async fn send_webhook(&self, payload: &Value) {
        if self.webhook_url.is_empty() {
            return;
        }

        let result = with_retry("alert_webhook_post", &self.policy, || {
            self.client.post(&self.webhook_url).json(payload).send()
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "Failed to deliver alert webhook");
        }
    }

    async fn send_email(&self, alert_type: &str, summary: &str, context: &Value, error: &str) {
        if self.email_to.is_empty() {
            return;
        }

        let subject = format!("{} {}", self.subject_prefix, alert_type);
        let context_text =
            serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string());
        let body = format!(
            "{}\n\nContext:\n{}\n\nError:\n{}\n",
            summary,
            context_text,
            if error.is_empty() { "(none)" } else { error }
        );

        if let Err(e) = self
            .mailer
            .send_mail(&self.support_mailbox, &self.email_to, &subject, &body)
            .await
        {
            error!(error = %e, "Failed to deliver alert email");
        }
    }
}

#[async_trait]
impl AlertSink for AlertService {
    async fn notify(&self, alert_type: &str, summary: &str, context: Value, error: Option<&str>) {
        let error_text = error.unwrap_or("");
        let payload = json!({
            "event": "bridge_alert",
            "alert_type": alert_type,
            "summary": summary,
            "context": context.clone(),
            "error": error_text,
        });
        error!(alert_type, summary, error = error_text, "Bridge alert");

        self.send_webhook(&payload).await;
        self.send_email(alert_type, summary, &context, error_text)
            .await;
    }
}
