//! Body normalisation ahead of classification and embedding.
//!
//! Every pass is pure and returns its input unchanged when no marker is
//! found, so the stages compose without surprises. HTML bodies get a
//! dedicated pre-pass (tracking pixels, script-like tags) before the plain
//! text extraction that happens upstream.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use unicode_general_category::{get_general_category, GeneralCategory};

/// URL path segments that usually indicate tracking pixels or click redirects.
const TRACKING_URL_KEYWORDS: &str = "track(?:ing)?|open(?:ed)?|pixel|beacon|unsub(?:scribe)?|\
redirect|click|mail(?:track|open)|read.?receipt|\
analytics|trace|log\\.(?:open|click)|notify\\.(?:open|click)";

static TRACKING_URL_REGEX: OnceLock<Regex> = OnceLock::new();

fn tracking_url_regex() -> &'static Regex {
    TRACKING_URL_REGEX.get_or_init(|| {
        RegexBuilder::new(&format!(
            "https?://[^\\s<>\"']*(?:{TRACKING_URL_KEYWORDS})[^\\s<>\"']*"
        ))
        .case_insensitive(true)
        .build()
        .expect("invalid tracking URL regex")
    })
}

static IMG_TAG_REGEX: OnceLock<Regex> = OnceLock::new();
static IMG_SMALL_REGEX: OnceLock<Regex> = OnceLock::new();
static IMG_TRACKING_SRC_REGEX: OnceLock<Regex> = OnceLock::new();
static SCRIPT_LIKE_REGEX: OnceLock<Regex> = OnceLock::new();

fn img_tag_regex() -> &'static Regex {
    IMG_TAG_REGEX.get_or_init(|| {
        RegexBuilder::new(r"<img\s[^>]*>")
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("invalid img tag regex")
    })
}

fn img_small_regex() -> &'static Regex {
    IMG_SMALL_REGEX.get_or_init(|| {
        RegexBuilder::new(r#"\b(?:width|height)\s*=\s*["']?1["']?|\b(?:width|height)\s*:\s*1px"#)
            .case_insensitive(true)
            .build()
            .expect("invalid 1x1 img regex")
    })
}

fn img_tracking_src_regex() -> &'static Regex {
    IMG_TRACKING_SRC_REGEX.get_or_init(|| {
        RegexBuilder::new(&format!(
            "\\bsrc\\s*=\\s*[\"']?[^\"'\\s]*(?:{TRACKING_URL_KEYWORDS})[^\"'\\s]*[\"']?"
        ))
        .case_insensitive(true)
        .build()
        .expect("invalid tracking src regex")
    })
}

fn script_like_regex() -> &'static Regex {
    SCRIPT_LIKE_REGEX.get_or_init(|| {
        RegexBuilder::new(r"</?(?:script|iframe|object|embed)\b[^>]*>")
            .case_insensitive(true)
            .build()
            .expect("invalid script tag regex")
    })
}

/// Signature / disclaimer delimiters ("-- ", mobile "Sent from", legal blocks).
const SIGNATURE_PATTERNS: &[&str] = &[
    r"\n\s*Sent from my (?:iPhone|iPad|Android|Samsung|Galaxy|Pixel)\b.*",
    r"\n\s*Get Outlook for\s+.*",
    r"\n\s*Sent from (?:Mail|Gmail)?\s+for (?:iOS|Android)\s*.*",
    r"\n\s*_{3,}\s*\n\s*From:\s+.*",
    r"\n\s*--\s*\n",
    r"\n\s*_{5,}\s*$",
    r"\n\s*-\s{0,2}$",
];

const DISCLAIMER_PATTERNS: &[&str] = &[
    r"\n\s*(?:This\s+)?(?:e-?mail|message|communication)\s+(?:is\s+)?(?:confidential|intended only).*",
    r"\n\s*Disclaimer\s*:.*",
    r"\n\s*CONFIDENTIALITY\s+NOTICE\s*:.*",
    r"\n\s*If you (?:received|have received) this (?:e-?mail|message) in error.*",
    r"\n\s*Please consider the environment before printing.*",
    r"\n\s*\[?PRIVACY\]?.*",
];

/// Quoted-reply boundaries: "On ... wrote:", "From: ... Sent:", forwards.
const QUOTE_PATTERNS: &[&str] = &[
    r"\n\s*On\s+.+?\s+wrote\s*:\s*\n",
    r"\n\s*_{3,}\s*\n\s*From:\s+",
    r"\n-{3,}\s*Original Message\s*-{3,}\s*\n",
    r"\n\s*_{2,}\s*\n\s*From:\s+",
    r"\n\s*On\s+\d{1,2}/\d{1,2}/\d{2,4}.+?\n",
    r"\n\s*----------\s+Forwarded message\s+----------\s*\n",
    r"\n\s*Begin forwarded message\s*:.*",
];

static SIGNATURE_REGEX: OnceLock<Regex> = OnceLock::new();
static DISCLAIMER_REGEX: OnceLock<Regex> = OnceLock::new();
static QUOTE_REGEX: OnceLock<Regex> = OnceLock::new();

fn join_patterns(patterns: &[&str]) -> String {
    patterns
        .iter()
        .map(|pattern| format!("(?:{pattern})"))
        .collect::<Vec<_>>()
        .join("|")
}

fn signature_regex() -> &'static Regex {
    SIGNATURE_REGEX.get_or_init(|| {
        RegexBuilder::new(&join_patterns(SIGNATURE_PATTERNS))
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("invalid signature regex")
    })
}

fn disclaimer_regex() -> &'static Regex {
    DISCLAIMER_REGEX.get_or_init(|| {
        RegexBuilder::new(&join_patterns(DISCLAIMER_PATTERNS))
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("invalid disclaimer regex")
    })
}

fn quote_regex() -> &'static Regex {
    QUOTE_REGEX.get_or_init(|| {
        RegexBuilder::new(&join_patterns(QUOTE_PATTERNS))
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("invalid quote regex")
    })
}

const ZERO_WIDTH_CHARS: &[char] = &[
    '\u{200b}', '\u{200c}', '\u{200d}', '\u{200e}', '\u{200f}', '\u{202a}', '\u{202b}', '\u{202c}',
    '\u{202d}', '\u{202e}', '\u{2060}', '\u{2061}', '\u{2062}', '\u{2063}', '\u{feff}',
];

/// Strip format, control, private-use and unassigned code points while
/// preserving space, tab, LF and CR.
pub fn strip_invisible_unicode(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    text.chars()
        .filter(|c| {
            if matches!(c, ' ' | '\t' | '\n' | '\r') {
                return true;
            }
            if ZERO_WIDTH_CHARS.contains(c) {
                return false;
            }
            !matches!(
                get_general_category(*c),
                GeneralCategory::Format
                    | GeneralCategory::Control
                    | GeneralCategory::PrivateUse
                    | GeneralCategory::Unassigned
            )
        })
        .collect()
}

/// Replace any URL containing a tracking keyword with the literal `[LINK]`.
pub fn strip_tracking_urls(text: &str) -> String {
    if text.trim().is_empty() {
        return text.to_string();
    }
    tracking_url_regex().replace_all(text, "[LINK]").into_owned()
}

fn strip_at_first_match(text: &str, regex: &Regex) -> String {
    match regex.find(text) {
        Some(found) => text[..found.start()].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Truncate at the first quoted-reply boundary.
pub fn strip_quoted_replies(body: &str) -> String {
    if body.trim().is_empty() {
        return body.to_string();
    }
    match quote_regex().find(body) {
        Some(found) => body[..found.start()].trim_end().to_string(),
        None => body.trim().to_string(),
    }
}

/// Truncate at the first signature or disclaimer marker.
pub fn strip_signatures_and_disclaimers(body: &str) -> String {
    if body.trim().is_empty() {
        return body.to_string();
    }
    let text = strip_at_first_match(body, signature_regex());
    let text = strip_at_first_match(&text, disclaimer_regex());
    text.trim().to_string()
}

/// Remove tracking pixels and script-like tags from an HTML body.
///
/// Applied upstream, before plain text extraction. `<img>` tags are dropped
/// when they declare a 1x1 geometry or point at a tracking URL.
pub fn strip_tracking_pixels_from_html(html: &str) -> String {
    if html.trim().is_empty() {
        return html.to_string();
    }
    let text = script_like_regex().replace_all(html, "");
    img_tag_regex()
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            let tag = &caps[0];
            if img_small_regex().is_match(tag) || img_tracking_src_regex().is_match(tag) {
                String::new()
            } else {
                tag.to_string()
            }
        })
        .into_owned()
}

/// The full normalisation used by the transform pipeline.
///
/// Order matters: invisible characters first (so markers hidden by
/// zero-width insertions still match), then tracking URLs, then quoted
/// replies, then signatures and disclaimers.
pub fn preprocess_body(body: &str) -> String {
    if body.trim().is_empty() {
        return String::new();
    }
    let text = body.trim();
    let text = strip_invisible_unicode(text);
    let text = strip_tracking_urls(&text);
    let text = strip_quoted_replies(&text);
    let text = strip_signatures_and_disclaimers(&text);
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_urls_become_link_tokens() {
        let body = "See https://example.com/track/abc123 for details";
        assert_eq!(strip_tracking_urls(body), "See [LINK] for details");

        let body = "Newsletter: https://mail.example.com/unsubscribe?u=42";
        assert_eq!(strip_tracking_urls(body), "Newsletter: [LINK]");
    }

    #[test]
    fn ordinary_urls_survive() {
        let body = "Docs at https://example.com/guide/setup";
        assert_eq!(strip_tracking_urls(body), body);
    }

    #[test]
    fn quoted_reply_is_truncated() {
        let body = "Thanks, sounds good.\n\nOn Mon, Jan 1, 2024 at 9:00, Alice wrote:\n> previous message";
        assert_eq!(strip_quoted_replies(body), "Thanks, sounds good.");
    }

    #[test]
    fn original_message_marker_is_truncated() {
        let body = "Reply text\n----- Original Message -----\nFrom: bob@example.com\nolder text";
        assert_eq!(strip_quoted_replies(body), "Reply text");
    }

    #[test]
    fn forwarded_message_marker_is_truncated() {
        let body = "FYI\n\nBegin forwarded message:\nFrom: carol";
        assert_eq!(strip_quoted_replies(body), "FYI");
    }

    #[test]
    fn body_without_markers_is_unchanged() {
        let body = "Just a plain body with nothing quoted.";
        assert_eq!(strip_quoted_replies(body), body);
        assert_eq!(strip_signatures_and_disclaimers(body), body);
    }

    #[test]
    fn dash_dash_signature_is_truncated() {
        let body = "Main content here.\n-- \nKind regards\nDave";
        assert_eq!(strip_signatures_and_disclaimers(body), "Main content here.");
    }

    #[test]
    fn mobile_signature_is_truncated() {
        let body = "Short answer: yes.\nSent from my iPhone";
        assert_eq!(strip_signatures_and_disclaimers(body), "Short answer: yes.");
    }

    #[test]
    fn confidentiality_notice_is_truncated() {
        let body = "Figures attached.\nCONFIDENTIALITY NOTICE: this email is intended only for...";
        assert_eq!(strip_signatures_and_disclaimers(body), "Figures attached.");
    }

    #[test]
    fn zero_width_characters_are_removed() {
        let body = "hel\u{200b}lo wor\u{feff}ld";
        assert_eq!(strip_invisible_unicode(body), "hello world");
    }

    #[test]
    fn whitespace_is_preserved() {
        let body = "a b\tc\nd\re";
        assert_eq!(strip_invisible_unicode(body), body);
    }

    #[test]
    fn control_and_private_use_are_removed() {
        let body = "a\u{0007}b\u{e000}c";
        assert_eq!(strip_invisible_unicode(body), "abc");
    }

    #[test]
    fn html_tracking_pixel_is_dropped() {
        let html = r#"<p>Hi</p><img src="https://t.example.com/pixel.gif" width="1" height="1">"#;
        assert_eq!(strip_tracking_pixels_from_html(html), "<p>Hi</p>");
    }

    #[test]
    fn html_content_image_survives() {
        let html = r#"<img src="https://example.com/photo.jpg" width="400">"#;
        assert_eq!(strip_tracking_pixels_from_html(html), html);
    }

    #[test]
    fn html_script_tags_are_dropped() {
        let html = r#"before<script src="x.js"></script>after"#;
        assert_eq!(strip_tracking_pixels_from_html(html), "beforeafter");
    }

    #[test]
    fn full_preprocess_combines_all_passes() {
        let body = "Hello\u{200b} there, see https://x.test/click/now\n\nOn Mon, Jan 1, 2024 at 9:00, Alice wrote:\n> old";
        assert_eq!(preprocess_body(body), "Hello there, see [LINK]");
    }

    #[test]
    fn empty_body_preprocesses_to_empty() {
        assert_eq!(preprocess_body(""), "");
        assert_eq!(preprocess_body("   \n "), "");
    }
}
