//! Reply-text extraction for inbound email bodies.
//!
//! Deliberately simple: keep lines from the top of the message until the
//! first quoted line or reply-header marker. This is a heuristic, not a
//! full thread parser.

use regex::Regex;
use std::sync::LazyLock;

const QUOTE_MARKERS: [&str; 5] = [
    "-----Original Message-----",
    "From:",
    "Sent:",
    "To:",
    "Subject:",
];

static ON_WROTE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^On .+ wrote:$").expect("valid marker regex"));

static BLANK_RUN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank-run regex"));

/// Minimal HTML-to-text conversion for Graph message bodies.
pub fn html_to_text(html: &str) -> String {
    static BR: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));
    static CLOSE_P: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)</p>").expect("valid p regex"));
    static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));

    let text = BR.replace_all(html, "\n");
    let text = CLOSE_P.replace_all(&text, "\n\n");
    let text = TAG.replace_all(&text, "");
    text.replace("&nbsp;", " ").replace("&amp;", "&")
}

/// Keep the new content at the top of a reply, dropping quoted history.
///
/// Stops at the first line that is quoted (`>`), starts with a known
/// reply-header marker, or matches `On <anything> wrote:`. Runs of three
/// or more newlines collapse to one blank line; the result is trimmed.
pub fn extract_reply_text(raw_text: &str) -> String {
    let normalized = raw_text.replace('\r', "");
    let mut kept: Vec<&str> = Vec::new();

    for line in normalized.split('\n') {
        let stripped = line.trim();

        if stripped.starts_with('>') {
            break;
        }
        if QUOTE_MARKERS.iter().any(|marker| stripped.starts_with(marker)) {
            break;
        }
        if ON_WROTE_PATTERN.is_match(stripped) {
            break;
        }

        kept.push(line.trim_end());
    }

    let text = kept.join("\n");
    let text = text.trim();
    BLANK_RUN_PATTERN.replace_all(text, "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_reply_stops_at_quote_marker() {
        let raw = "Looks good.\n\nFrom: Support\nSent: Today";
        assert_eq!(extract_reply_text(raw), "Looks good.");
    }

    #[test]
    fn test_extract_reply_stops_at_on_wrote() {
        let raw = "Please proceed.\n\nOn Mon, Someone wrote:\n> older text";
        assert_eq!(extract_reply_text(raw), "Please proceed.");
    }

    #[test]
    fn test_extract_reply_stops_at_quoted_line() {
        let raw = "New content.\n> quoted reply\nmore quoted";
        assert_eq!(extract_reply_text(raw), "New content.");
    }

    #[test]
    fn test_extract_reply_stops_at_original_message_divider() {
        let raw = "Done.\n-----Original Message-----\nFrom: someone";
        assert_eq!(extract_reply_text(raw), "Done.");
    }

    #[test]
    fn test_extract_reply_keeps_new_content() {
        let raw = "Thanks, approved.\n\n- Paul";
        assert_eq!(extract_reply_text(raw), "Thanks, approved.\n\n- Paul");
    }

    #[test]
    fn test_extract_reply_collapses_blank_runs() {
        let raw = "First.\n\n\n\nSecond.";
        assert_eq!(extract_reply_text(raw), "First.\n\nSecond.");
    }

    #[test]
    fn test_extract_reply_strips_carriage_returns() {
        let raw = "Looks good.\r\n\r\nFrom: Support\r\n";
        assert_eq!(extract_reply_text(raw), "Looks good.");
    }

    #[test]
    fn test_extract_reply_empty_when_only_quotes() {
        assert_eq!(extract_reply_text("> all quoted\n> nothing new"), "");
    }

    #[test]
    fn test_html_to_text_basic() {
        let html = "<p>Hello<br/>world</p><div>&nbsp;ok &amp; done</div>";
        let text = html_to_text(html);
        assert!(text.contains("Hello\nworld"));
        assert!(text.contains(" ok & done"));
        assert!(!text.contains('<'));
    }
}
