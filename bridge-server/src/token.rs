//! Issue-correlation token codec.
//!
//! A token binds one GitHub issue to one email thread:
//! `HD-<issue_number>-<sig>` where `<sig>` is the first 12 hex characters
//! of an HMAC-SHA256 over the decimal issue number, keyed by the bridge
//! secret. Subject lines carry the token in square brackets; only the
//! embedded token is trusted, never the surrounding text.

use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;
use std::sync::LazyLock;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Number of hex characters kept from the HMAC digest.
const SIGNATURE_LEN: usize = 12;

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HD-(\d+)-([a-f0-9]{12})$").expect("valid token regex"));

static SUBJECT_TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(HD-\d+-[a-f0-9]{12})\]").expect("valid subject regex"));

fn signature(issue_number: u64, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(issue_number.to_string().as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    digest[..SIGNATURE_LEN].to_string()
}

/// Derive the signed token for an issue. Deterministic in (issue, secret).
pub fn build_issue_token(issue_number: u64, secret: &str) -> String {
    format!("HD-{}-{}", issue_number, signature(issue_number, secret))
}

/// Build the outbound subject line with an embedded token.
pub fn build_subject(issue_number: u64, title: &str, secret: &str) -> String {
    let token = build_issue_token(issue_number, secret);
    format!("[{}] Issue #{}: {}", token, issue_number, title)
}

/// Find the first bracketed token in free subject text.
pub fn extract_subject_token(subject: &str) -> Option<String> {
    SUBJECT_TOKEN_PATTERN
        .captures(subject)
        .map(|caps| caps[1].to_string())
}

/// Validate a token against the secret, returning the issue number it
/// binds. Any grammar or signature mismatch yields `None`; callers treat
/// that as "do not correlate".
pub fn validate_issue_token(token: &str, secret: &str) -> Option<u64> {
    let caps = TOKEN_PATTERN.captures(token)?;
    let issue_number: u64 = caps[1].parse().ok()?;
    let expected = signature(issue_number, secret);
    // Constant-time comparison of the truncated signatures.
    if expected.as_bytes().ct_eq(caps[2].as_bytes()).into() {
        Some(issue_number)
    } else {
        None
    }
}

/// Extract and validate the token from a subject line in one step.
pub fn parse_subject(subject: &str, secret: &str) -> Option<(String, u64)> {
    let token = extract_subject_token(subject)?;
    let issue_number = validate_issue_token(&token, secret)?;
    Some((token, issue_number))
}
