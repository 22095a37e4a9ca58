//! Formats raw AI backend answers for Telegram delivery.
//!
//! Pulls embedded image references out of the answer text, cleans the
//! remainder, and translates the backend's Markdown dialect into
//! Telegram's markup convention.

use regex::Regex;
use std::sync::LazyLock;

/// Sent when the backend produced neither text nor images.
pub const COMPLETION_ACK: &str = "✅ Done! Let me know if you need anything else.";

/// Markdown image syntax: `![alt](url)`.
static MARKDOWN_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[[^\]]*\]\(([^)\s]+)\)").expect("markdown image regex")
});

/// Bare URLs that are clearly images: known file extensions or known
/// image-hosting domains.
static BARE_IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bhttps?://(?:[^\s<>()]+?\.(?:jpe?g|png|gif|webp|svg)(?:\?[^\s<>()]*)?|(?:[a-z0-9-]+\.)*(?:imgur\.com|i\.redd\.it|googleusercontent\.com|cloudfront\.net|unsplash\.com)/[^\s<>()]+)",
    )
    .expect("bare image url regex")
});

/// Double-delimiter bold from the backend's dialect.
static DOUBLE_BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("bold regex"));

/// Three or more consecutive newlines.
static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("newline regex"));

/// Runs of spaces/tabs left behind after stripping inline references.
static EXCESS_SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("space regex"));

/// Section-header keywords that get a leading icon. Cosmetic only.
const HEADER_ICONS: [(&str, &str); 5] = [
    ("warning:", "⚠️"),
    ("note:", "📝"),
    ("tip:", "💡"),
    ("important:", "❗"),
    ("summary:", "📋"),
];

/// An AI answer after extraction and cleanup, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedResponse {
    pub clean_text: String,
    /// Deduplicated, in first-occurrence order.
    pub image_urls: Vec<String>,
    pub has_images: bool,
    pub use_rich_markup: bool,
}

/// Result of markup validation/repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupCheck {
    pub is_valid: bool,
    pub cleaned: String,
}

/// Process a raw AI answer into deliverable content.
pub fn process(raw: &str) -> ProcessedResponse {
    let image_urls = extract_image_urls(raw);
    let clean_text = clean_text(raw);

    if !clean_text.is_empty() {
        ProcessedResponse {
            clean_text,
            has_images: !image_urls.is_empty(),
            image_urls,
            use_rich_markup: true,
        }
    } else if !image_urls.is_empty() {
        // Image-only answer: no caption, so nothing to mis-render.
        ProcessedResponse {
            clean_text: String::new(),
            image_urls,
            has_images: true,
            use_rich_markup: false,
        }
    } else {
        ProcessedResponse {
            clean_text: COMPLETION_ACK.to_string(),
            image_urls: Vec::new(),
            has_images: false,
            use_rich_markup: false,
        }
    }
}

/// Collect image references from markdown syntax and bare URLs,
/// first occurrence wins.
fn extract_image_urls(raw: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();

    for captures in MARKDOWN_IMAGE.captures_iter(raw) {
        let url = captures[1].to_string();
        if !urls.contains(&url) {
            urls.push(url);
        }
    }

    for found in BARE_IMAGE_URL.find_iter(raw) {
        let url = found.as_str().to_string();
        if !urls.contains(&url) {
            urls.push(url);
        }
    }

    urls
}

/// Strip extracted references and reformat for Telegram.
fn clean_text(raw: &str) -> String {
    let text = MARKDOWN_IMAGE.replace_all(raw, "");
    let text = BARE_IMAGE_URL.replace_all(&text, "");

    // The backend emits literal "\n" sequences inside JSON string answers.
    let text = text.replace("\\n", "\n");

    let text = EXCESS_SPACES.replace_all(&text, " ");
    let text = EXCESS_NEWLINES.replace_all(&text, "\n\n");
    let text = DOUBLE_BOLD.replace_all(&text, "*$1*");

    let decorated = decorate_headers(&text);
    decorated.trim().to_string()
}

/// Prepend an icon to recognized section-header lines.
fn decorate_headers(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let lowered = line.trim_start().to_lowercase();
        let icon = HEADER_ICONS
            .iter()
            .find(|(keyword, _)| lowered.starts_with(keyword))
            .map(|(_, icon)| *icon);
        match icon {
            Some(icon) if !line.trim_start().starts_with(icon) => {
                lines.push(format!("{icon} {}", line.trim_start()));
            }
            _ => lines.push(line.to_string()),
        }
    }
    lines.join("\n")
}

/// Check Telegram markup delimiters and repair what can be repaired.
///
/// An odd number of bold or code markers means a dangling trailing
/// delimiter; the last occurrence is dropped instead of rejecting the
/// whole message. Never panics: if repair cannot produce balanced
/// markup, the text is returned with all delimiters stripped and
/// `is_valid` false.
pub fn validate_markup(text: &str) -> MarkupCheck {
    match repair_markup(text) {
        Some(cleaned) => MarkupCheck {
            is_valid: true,
            cleaned,
        },
        None => MarkupCheck {
            is_valid: false,
            cleaned: text.chars().filter(|c| *c != '*' && *c != '`').collect(),
        },
    }
}

fn repair_markup(text: &str) -> Option<String> {
    let mut cleaned = text.to_string();

    for delim in ['*', '`'] {
        if cleaned.matches(delim).count() % 2 == 1 {
            let pos = cleaned.rfind(delim)?;
            cleaned.remove(pos);
        }
    }

    // Empty delimiter pairs render as stray characters; drop them.
    for pair in ["**", "``"] {
        while cleaned.contains(pair) {
            cleaned = cleaned.replace(pair, "");
        }
    }

    // Repair must leave every delimiter paired.
    if cleaned.matches('*').count() % 2 == 1 || cleaned.matches('`').count() % 2 == 1 {
        return None;
    }

    Some(cleaned)
}
