use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Application configuration, constructed once at startup from the
/// environment and passed by reference to every component.
#[derive(Clone)]
pub struct Config {
    pub app_env: String,
    pub app_host: String,
    pub app_port: u16,

    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    pub github_owner: String,
    pub github_repo: String,
    pub github_token: String,
    pub github_webhook_secret: String,

    pub graph_tenant_id: String,
    pub graph_client_id: String,
    pub graph_client_secret: String,
    pub graph_support_mailbox: String,
    /// Shared secret echoed back by Graph in every change notification.
    pub graph_client_state: String,
    pub graph_notification_url: String,
    pub graph_subscription_id: String,
    pub graph_subscription_resource: String,
    pub graph_subscription_lifetime_minutes: i64,
    pub graph_subscription_renewal_window_minutes: i64,

    /// Secret used to sign issue-correlation tokens. Required.
    pub bridge_token_secret: String,
    /// Marker embedded in bridge-authored comments for loop prevention.
    pub bridge_comment_marker: String,

    pub api_retry_max_attempts: u32,
    pub api_retry_base_delay_seconds: f64,
    pub api_retry_max_delay_seconds: f64,

    pub retry_queue_max_attempts: u32,
    pub retry_queue_base_delay_seconds: f64,
    pub retry_queue_max_delay_seconds: f64,
    pub retry_worker_batch_size: usize,

    pub alert_webhook_url: String,
    pub alert_email_to: String,
    pub alert_subject_prefix: String,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_or(name, default)
        .parse::<T>()
        .with_context(|| format!("{} must be a valid number", name))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bridge_token_secret = env::var("BRIDGE_TOKEN_SECRET")
            .context("BRIDGE_TOKEN_SECRET environment variable is required")?;

        let support_mailbox = env_or("GRAPH_SUPPORT_MAILBOX", "support@example.org");
        let default_resource = format!(
            "/users/{}/mailFolders('Inbox')/messages",
            support_mailbox
        );

        Ok(Config {
            app_env: env_or("APP_ENV", "dev"),
            app_host: env_or("APP_HOST", "0.0.0.0"),
            app_port: env_parse("APP_PORT", "8000")?,

            database_path: PathBuf::from(env_or("DATABASE_PATH", ".data/bridge.db")),

            github_owner: env_or("GITHUB_OWNER", "example-org"),
            github_repo: env_or("GITHUB_REPO", "example-repo"),
            github_token: env_or("GITHUB_TOKEN", ""),
            github_webhook_secret: env_or("GITHUB_WEBHOOK_SECRET", ""),

            graph_tenant_id: env_or("GRAPH_TENANT_ID", ""),
            graph_client_id: env_or("GRAPH_CLIENT_ID", ""),
            graph_client_secret: env_or("GRAPH_CLIENT_SECRET", ""),
            graph_support_mailbox: support_mailbox,
            graph_client_state: env_or("GRAPH_CLIENT_STATE", ""),
            graph_notification_url: env_or("GRAPH_NOTIFICATION_URL", ""),
            graph_subscription_id: env_or("GRAPH_SUBSCRIPTION_ID", ""),
            graph_subscription_resource: env::var("GRAPH_SUBSCRIPTION_RESOURCE")
                .unwrap_or(default_resource),
            graph_subscription_lifetime_minutes: env_parse(
                "GRAPH_SUBSCRIPTION_LIFETIME_MINUTES",
                "2880",
            )?,
            graph_subscription_renewal_window_minutes: env_parse(
                "GRAPH_SUBSCRIPTION_RENEWAL_WINDOW_MINUTES",
                "360",
            )?,

            bridge_token_secret,
            bridge_comment_marker: env_or("BRIDGE_COMMENT_MARKER", "via-issue-email-bridge"),

            api_retry_max_attempts: env_parse("API_RETRY_MAX_ATTEMPTS", "3")?,
            api_retry_base_delay_seconds: env_parse("API_RETRY_BASE_DELAY_SECONDS", "1.0")?,
            api_retry_max_delay_seconds: env_parse("API_RETRY_MAX_DELAY_SECONDS", "8.0")?,

            retry_queue_max_attempts: env_parse("RETRY_QUEUE_MAX_ATTEMPTS", "5")?,
            retry_queue_base_delay_seconds: env_parse("RETRY_QUEUE_BASE_DELAY_SECONDS", "30.0")?,
            retry_queue_max_delay_seconds: env_parse("RETRY_QUEUE_MAX_DELAY_SECONDS", "900.0")?,
            retry_worker_batch_size: env_parse("RETRY_WORKER_BATCH_SIZE", "25")?,

            alert_webhook_url: env_or("ALERT_WEBHOOK_URL", ""),
            alert_email_to: env_or("ALERT_EMAIL_TO", ""),
            alert_subject_prefix: env_or("ALERT_SUBJECT_PREFIX", "[Issue Email Bridge Alert]"),
        })
    }

    /// Test configuration with fixed values and no environment access.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            app_env: "test".to_string(),
            app_host: "127.0.0.1".to_string(),
            app_port: 0,
            database_path: PathBuf::from(":memory:"),
            github_owner: "example-org".to_string(),
            github_repo: "example-repo".to_string(),
            github_token: "test-token".to_string(),
            github_webhook_secret: String::new(),
            graph_tenant_id: String::new(),
            graph_client_id: String::new(),
            graph_client_secret: String::new(),
            graph_support_mailbox: "support@example.org".to_string(),
            graph_client_state: "expected-state".to_string(),
            graph_notification_url: "https://bridge.example.org/webhooks/graph".to_string(),
            graph_subscription_id: String::new(),
            graph_subscription_resource:
                "/users/support@example.org/mailFolders('Inbox')/messages".to_string(),
            graph_subscription_lifetime_minutes: 2880,
            graph_subscription_renewal_window_minutes: 360,
            bridge_token_secret: "super-secret".to_string(),
            bridge_comment_marker: "via-issue-email-bridge".to_string(),
            api_retry_max_attempts: 3,
            api_retry_base_delay_seconds: 1.0,
            api_retry_max_delay_seconds: 8.0,
            retry_queue_max_attempts: 5,
            retry_queue_base_delay_seconds: 1.0,
            retry_queue_max_delay_seconds: 60.0,
            retry_worker_batch_size: 25,
            alert_webhook_url: String::new(),
            alert_email_to: String::new(),
            alert_subject_prefix: "[Issue Email Bridge Alert]".to_string(),
        }
    }
}
