//! Mailbox subscription lifecycle.
//!
//! A lapsed Graph subscription silently stops all inbound notification
//! delivery, so renewal happens proactively inside a window before expiry
//! rather than reactively after a lapse. Status is computed fresh from the
//! remote subscription on every call and never cached.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::graph::{CreateSubscriptionRequest, Subscription, SubscriptionApi};

/// Graph-imposed bounds on mailbox subscription lifetime.
const MAX_GRAPH_LIFETIME_MINUTES: i64 = 4200;
const MIN_GRAPH_LIFETIME_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Missing,
    Invalid,
    Expired,
    RenewalDue,
    Healthy,
}

/// Snapshot of the subscription, plus the action `ensure` took.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionReport {
    pub state: SubscriptionState,
    pub subscription_id: Option<String>,
    pub resource: Option<String>,
    pub expiration_utc: Option<String>,
    pub minutes_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
}

pub struct SubscriptionManager {
    subscription_id: String,
    resource: String,
    notification_url: String,
    client_state: String,
    lifetime_minutes: i64,
    renewal_window_minutes: i64,
    api: Arc<dyn SubscriptionApi>,
}

fn clamp_lifetime(minutes: i64) -> i64 {
    minutes.clamp(MIN_GRAPH_LIFETIME_MINUTES, MAX_GRAPH_LIFETIME_MINUTES)
}

fn graph_datetime(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_graph_datetime(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl SubscriptionManager {
    pub fn new(config: &Config, api: Arc<dyn SubscriptionApi>) -> Self {
        Self {
            subscription_id: config.graph_subscription_id.clone(),
            resource: config.graph_subscription_resource.clone(),
            notification_url: config.graph_notification_url.clone(),
            client_state: config.graph_client_state.clone(),
            lifetime_minutes: config.graph_subscription_lifetime_minutes,
            renewal_window_minutes: config.graph_subscription_renewal_window_minutes,
            api,
        }
    }

    fn target_expiration(&self) -> String {
        let lifetime = clamp_lifetime(self.lifetime_minutes);
        graph_datetime(Utc::now() + Duration::minutes(lifetime))
    }

    fn classify(&self, subscription: Option<&Subscription>) -> SubscriptionReport {
        let Some(subscription) = subscription else {
            return SubscriptionReport {
                state: SubscriptionState::Missing,
                subscription_id: None,
                resource: None,
                expiration_utc: None,
                minutes_remaining: None,
                action: None,
            };
        };

        let expiration = subscription
            .expiration_date_time
            .as_deref()
            .and_then(parse_graph_datetime);
        let Some(expires_at) = expiration else {
            return SubscriptionReport {
                state: SubscriptionState::Invalid,
                subscription_id: subscription.id.clone(),
                resource: subscription.resource.clone(),
                expiration_utc: None,
                minutes_remaining: None,
                action: None,
            };
        };

        // Whole minutes, floor-rounded.
        let remaining = (expires_at - Utc::now()).num_seconds().div_euclid(60);
        let state = if remaining <= 0 {
            SubscriptionState::Expired
        } else if remaining <= self.renewal_window_minutes {
            SubscriptionState::RenewalDue
        } else {
            SubscriptionState::Healthy
        };

        SubscriptionReport {
            state,
            subscription_id: subscription.id.clone(),
            resource: subscription.resource.clone(),
            expiration_utc: subscription.expiration_date_time.clone(),
            minutes_remaining: Some(remaining),
            action: None,
        }
    }

    /// Find the subscription this bridge owns: by configured id first
    /// (a vanished id falls through), then by scanning for a resource and
    /// notification-URL match.
    async fn find_existing(&self) -> Result<Option<Subscription>> {
        if !self.subscription_id.is_empty() {
            if let Some(subscription) = self
                .api
                .get_subscription(&self.subscription_id)
                .await
                .context("Failed to look up configured subscription")?
            {
                return Ok(Some(subscription));
            }
        }

        if self.notification_url.is_empty() {
            return Ok(None);
        }

        let subscriptions = self
            .api
            .list_subscriptions()
            .await
            .context("Failed to list subscriptions")?;
        Ok(subscriptions.into_iter().find(|subscription| {
            subscription.resource.as_deref() == Some(self.resource.as_str())
                && subscription.notification_url.as_deref()
                    == Some(self.notification_url.as_str())
        }))
    }

    /// Report the current subscription state without changing anything.
    pub async fn status(&self) -> Result<SubscriptionReport> {
        let existing = self.find_existing().await?;
        Ok(self.classify(existing.as_ref()))
    }

    /// Create or renew the subscription as needed. Healthy is a no-op.
    pub async fn ensure(&self) -> Result<SubscriptionReport> {
        if self.notification_url.is_empty() {
            bail!("GRAPH_NOTIFICATION_URL is required for subscription lifecycle operations");
        }
        if self.client_state.is_empty() {
            bail!("GRAPH_CLIENT_STATE is required for subscription lifecycle operations");
        }

        let existing = self.find_existing().await?;
        let status = self.classify(existing.as_ref());
        if status.state == SubscriptionState::Healthy {
            return Ok(SubscriptionReport {
                action: Some("none"),
                ..status
            });
        }

        let target_expiration = self.target_expiration();
        let Some(existing) = existing else {
            let created = self
                .api
                .create_subscription(&CreateSubscriptionRequest {
                    resource: self.resource.clone(),
                    notification_url: self.notification_url.clone(),
                    client_state: self.client_state.clone(),
                    expiration_datetime: target_expiration,
                })
                .await
                .context("Failed to create subscription")?;
            return Ok(SubscriptionReport {
                action: Some("created"),
                ..self.classify(Some(&created))
            });
        };

        let subscription_id = existing
            .id
            .as_deref()
            .ok_or_else(|| anyhow!("existing subscription has no id"))?;
        let renewed = self
            .api
            .renew_subscription(subscription_id, &target_expiration)
            .await
            .context("Failed to renew subscription")?;
        Ok(SubscriptionReport {
            action: Some("renewed"),
            ..self.classify(Some(&renewed))
        })
    }
}
