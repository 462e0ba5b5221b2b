//! Microsoft Graph client: outbound mail, message fetch, and mailbox
//! change-notification subscriptions.
//!
//! Authenticates with the OAuth2 client-credentials flow; access tokens
//! are cached and refreshed 120 seconds before they expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::api::{with_retry, ApiError, RetryPolicy};

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Refresh the cached token this long before it actually expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// Sends one email to one recipient from a fixed mailbox.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send_mail(
        &self,
        mailbox: &str,
        recipient: &str,
        subject: &str,
        body_text: &str,
    ) -> Result<()>;
}

/// Fetches a full mailbox message by provider id.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn get_message(&self, mailbox: &str, message_id: &str) -> Result<MailMessage>;
}

/// Mailbox push-notification subscription operations.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// Look up a subscription by id; a missing subscription is `None`,
    /// not an error.
    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>>;
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;
    async fn create_subscription(&self, request: &CreateSubscriptionRequest)
        -> Result<Subscription>;
    async fn renew_subscription(
        &self,
        subscription_id: &str,
        expiration_datetime: &str,
    ) -> Result<Subscription>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    #[serde(default)]
    pub internet_message_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<MessageFrom>,
    #[serde(default)]
    pub body: Option<MessageBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrom {
    #[serde(default)]
    pub email_address: Option<EmailAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAddress {
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl MailMessage {
    /// The sender address, if the provider supplied one.
    pub fn sender_address(&self) -> Option<&str> {
        self.from
            .as_ref()?
            .email_address
            .as_ref()?
            .address
            .as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub notification_url: Option<String>,
    #[serde(default)]
    pub expiration_date_time: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub resource: String,
    pub notification_url: String,
    pub client_state: String,
    pub expiration_datetime: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionListResponse {
    #[serde(default)]
    value: Vec<Subscription>,
}

pub struct GraphClient {
    client: Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    policy: RetryPolicy,
    token_cache: Arc<RwLock<Option<(String, Instant)>>>,
}

impl GraphClient {
    pub fn new(
        tenant_id: String,
        client_id: String,
        client_secret: String,
        policy: RetryPolicy,
    ) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            client,
            tenant_id,
            client_id,
            client_secret,
            policy,
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    async fn access_token(&self) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.as_ref() {
                if Instant::now() + TOKEN_REFRESH_MARGIN < *expires_at {
                    return Ok(token.clone());
                }
            }
        }

        if self.tenant_id.is_empty() || self.client_id.is_empty() || self.client_secret.is_empty()
        {
            return Err(anyhow!("Graph credentials are required"));
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        );
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", "https://graph.microsoft.com/.default"),
        ];

        let response = with_retry("graph_token_request", &self.policy, || {
            self.client.post(&url).form(&form).send()
        })
        .await
        .context("Graph token request failed")?;

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse Graph token response")?;

        let expires_at =
            Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(3600));
        {
            let mut cache = self.token_cache.write().await;
            *cache = Some((token.access_token.clone(), expires_at));
        }

        Ok(token.access_token)
    }
}

#[async_trait]
impl MailSender for GraphClient {
    async fn send_mail(
        &self,
        mailbox: &str,
        recipient: &str,
        subject: &str,
        body_text: &str,
    ) -> Result<()> {
        let token = self.access_token().await?;
        let url = format!("{}/users/{}/sendMail", GRAPH_BASE_URL, mailbox);
        let payload = json!({
            "message": {
                "subject": subject,
                "body": {
                    "contentType": "Text",
                    "content": body_text,
                },
                "toRecipients": [
                    { "emailAddress": { "address": recipient } }
                ],
            },
            "saveToSentItems": "true",
        });

        with_retry("graph_send_mail", &self.policy, || {
            self.client
                .post(&url)
                .bearer_auth(&token)
                .json(&payload)
                .send()
        })
        .await
        .context("Graph sendMail request failed")?;

        info!(mailbox, recipient, "Sent outbound mail through Graph");
        Ok(())
    }
}

#[async_trait]
impl MessageFetcher for GraphClient {
    async fn get_message(&self, mailbox: &str, message_id: &str) -> Result<MailMessage> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/users/{}/messages/{}",
            GRAPH_BASE_URL, mailbox, message_id
        );

        let response = with_retry("graph_get_message", &self.policy, || {
            self.client
                .get(&url)
                .query(&[("$select", "internetMessageId,subject,body,from")])
                .bearer_auth(&token)
                .send()
        })
        .await
        .context("Graph message fetch failed")?;

        response
            .json()
            .await
            .context("Failed to parse Graph message")
    }
}

#[async_trait]
impl SubscriptionApi for GraphClient {
    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        let token = self.access_token().await?;
        let url = format!("{}/subscriptions/{}", GRAPH_BASE_URL, subscription_id);

        let result = with_retry("graph_get_subscription", &self.policy, || {
            self.client.get(&url).bearer_auth(&token).send()
        })
        .await;

        match result {
            Ok(response) => {
                let subscription = response
                    .json()
                    .await
                    .context("Failed to parse Graph subscription")?;
                Ok(Some(subscription))
            }
            Err(ApiError::Permanent {
                status: Some(404), ..
            }) => Ok(None),
            Err(e) => Err(e).context("Graph subscription lookup failed"),
        }
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let token = self.access_token().await?;
        let url = format!("{}/subscriptions", GRAPH_BASE_URL);

        let response = with_retry("graph_list_subscriptions", &self.policy, || {
            self.client.get(&url).bearer_auth(&token).send()
        })
        .await
        .context("Graph subscription list failed")?;

        let list: SubscriptionListResponse = response
            .json()
            .await
            .context("Failed to parse Graph subscription list")?;
        Ok(list.value)
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<Subscription> {
        let token = self.access_token().await?;
        let url = format!("{}/subscriptions", GRAPH_BASE_URL);
        let payload = json!({
            "changeType": "created",
            "notificationUrl": request.notification_url,
            "resource": request.resource,
            "expirationDateTime": request.expiration_datetime,
            "clientState": request.client_state,
        });

        let response = with_retry("graph_create_subscription", &self.policy, || {
            self.client
                .post(&url)
                .bearer_auth(&token)
                .json(&payload)
                .send()
        })
        .await
        .context("Graph subscription create failed")?;

        response
            .json()
            .await
            .context("Failed to parse created Graph subscription")
    }

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        expiration_datetime: &str,
    ) -> Result<Subscription> {
        let token = self.access_token().await?;
        let url = format!("{}/subscriptions/{}", GRAPH_BASE_URL, subscription_id);
        let payload = json!({ "expirationDateTime": expiration_datetime });

        let response = with_retry("graph_renew_subscription", &self.policy, || {
            self.client
                .patch(&url)
                .bearer_auth(&token)
                .json(&payload)
                .send()
        })
        .await
        .context("Graph subscription renew failed")?;

        response
            .json()
            .await
            .context("Failed to parse renewed Graph subscription")
    }
}
