//! GitHub REST client for issue-comment creation.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use crate::api::{with_retry, RetryPolicy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const USER_AGENT: &str = "github-issue-email-bridge";

/// Creates one comment on one issue.
#[async_trait]
pub trait CommentCreator: Send + Sync {
    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()>;
}

pub struct GitHubClient {
    client: Client,
    token: String,
    policy: RetryPolicy,
}

impl GitHubClient {
    pub fn new(token: String, policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            client,
            token,
            policy,
        }
    }
}

#[async_trait]
impl CommentCreator for GitHubClient {
    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()> {
        if self.token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is required to create GitHub comments"));
        }

        let url = format!(
            "https://api.github.com/repos/{}/{}/issues/{}/comments",
            owner, repo, issue_number
        );
        let payload = json!({ "body": body });

        with_retry("github_create_issue_comment", &self.policy, || {
            self.client
                .post(&url)
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28")
                .header("User-Agent", USER_AGENT)
                .json(&payload)
                .send()
        })
        .await
        .context("GitHub comment request failed")?;

        info!(owner, repo, issue_number, "Created GitHub issue comment");
        Ok(())
    }
}
