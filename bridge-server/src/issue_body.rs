//! Requester-contact extraction from issue bodies.

use regex::Regex;
use std::sync::LazyLock;

static SECTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ims)^##\s+Requester\s+contact\s*$\n(.*?)(?:^##\s+|\z)")
        .expect("valid section regex")
});

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").expect("valid email regex")
});

/// Find the requester's email address in an issue body: first inside a
/// "Requester contact" section, falling back to the first email-shaped
/// token anywhere in the body. Returns a lowercased address.
pub fn extract_requester_contact(issue_body: &str) -> Option<String> {
    if let Some(caps) = SECTION_PATTERN.captures(issue_body) {
        let section = caps[1].trim();
        if let Some(found) = EMAIL_PATTERN.find(section) {
            return Some(found.as_str().to_lowercase());
        }
    }

    EMAIL_PATTERN
        .find(issue_body)
        .map(|found| found.as_str().to_lowercase())
}
