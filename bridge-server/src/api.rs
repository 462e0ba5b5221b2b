//! Inner bounded retry around a single HTTP call.
//!
//! This layer sits beneath the durable retry queue: it absorbs
//! within-call transient failures (timeouts, 5xx, rate limits) before an
//! operation is considered "failed" at the job level.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// HTTP statuses worth retrying. The 4xx entries are the request-timeout,
/// conflict, too-early, and rate-limit codes.
const TRANSIENT_HTTP_STATUS: [u16; 8] = [408, 409, 425, 429, 500, 502, 503, 504];

/// Outcome classification for an outbound API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transient API failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    #[error("permanent API failure: {reason}")]
    Permanent {
        reason: String,
        status: Option<u16>,
    },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }
}

/// Bounds for the inner retry loop, taken from the `API_RETRY_*` settings.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_seconds: f64, max_delay_seconds: f64) -> Self {
        let base = base_delay_seconds.max(0.1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs_f64(base),
            max_delay: Duration::from_secs_f64(max_delay_seconds.max(base)),
        }
    }

    /// Exponential backoff with ceiling for the given 1-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.max_delay.min(self.base_delay.saturating_mul(factor))
    }
}

pub fn is_transient_status(status: u16) -> bool {
    TRANSIENT_HTTP_STATUS.contains(&status)
}

/// Parse a `Retry-After` header value: either delta-seconds or an
/// HTTP-date. Unparseable values are ignored.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse::<u64>().ok().map(Duration::from_secs);
    }
    let retry_at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let seconds = (retry_at.with_timezone(&Utc) - Utc::now()).num_seconds();
    Some(Duration::from_secs(seconds.max(0) as u64))
}

/// Classify a completed `reqwest` response, consuming it on failure so the
/// error carries the response body.
async fn classify_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if is_transient_status(status.as_u16()) {
        let retry_after = parse_retry_after(
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        return Err(ApiError::Transient {
            reason: format!("retryable HTTP status {}", status),
            retry_after,
        });
    }
    if !status.is_success() {
        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Permanent {
            reason: format!("HTTP status {} - {}", status, body),
            status: Some(code),
        });
    }
    Ok(response)
}

/// Run `call` until it succeeds, retrying transient failures with
/// exponential backoff (honoring `Retry-After` when present) up to the
/// policy's attempt bound.
pub async fn with_retry<F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<reqwest::Response, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let outcome = match call().await {
            // Transport-level failures (connect, timeout, protocol) are
            // transient by definition.
            Err(e) => Err(ApiError::Transient {
                reason: e.to_string(),
                retry_after: None,
            }),
            Ok(response) => classify_response(response).await,
        };

        match outcome {
            Ok(response) => return Ok(response),
            Err(error) => {
                if !error.is_transient() || attempt >= policy.max_attempts {
                    return Err(error);
                }
                let delay = match &error {
                    ApiError::Transient {
                        retry_after: Some(after),
                        ..
                    } => *after,
                    _ => policy.backoff(attempt),
                };
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_seconds = delay.as_secs_f64(),
                    error = %error,
                    "Retrying API operation after transient failure"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_status_set() {
        for status in [408, 409, 425, 429, 500, 502, 503, 504] {
            assert!(is_transient_status(status), "{} should be transient", status);
        }
        for status in [200, 201, 400, 401, 403, 404, 422] {
            assert!(!is_transient_status(status), "{} should not be transient", status);
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after(Some("120")),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_retry_after(Some(" 5 ")), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let parsed = parse_retry_after(Some(&future)).expect("should parse HTTP-date");
        assert!(parsed <= Duration::from_secs(90));
        assert!(parsed >= Duration::from_secs(80));
    }

    #[test]
    fn test_parse_retry_after_past_date_clamps_to_zero() {
        let past = (Utc::now() - chrono::Duration::seconds(90)).to_rfc2822();
        assert_eq!(parse_retry_after(Some(&past)), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after(None), None);
        assert_eq!(parse_retry_after(Some("")), None);
        assert_eq!(parse_retry_after(Some("soon")), None);
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::new(5, 1.0, 8.0);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(8));
    }

    #[test]
    fn test_policy_clamps_inputs() {
        let policy = RetryPolicy::new(0, 0.0, 0.0);
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.base_delay >= Duration::from_millis(100));
        assert!(policy.max_delay >= policy.base_delay);
    }
}
