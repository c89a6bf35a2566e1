// src/ingest/normalize.rs
//! Deterministic markup stripping and truncation for classifier input.

use once_cell::sync::Lazy;
use regex::Regex;

/// Character budget used as a proxy for the classifier's token limit.
pub const DEFAULT_MAX_CHARS: usize = 4000;

static RE_SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("static regex")
});
static RE_BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)</?(p|div|br|hr|li|ul|ol|h[1-6]|blockquote|pre|table|tr|td|th|section|article|header|footer|figure|figcaption|img)\b[^>]*>",
    )
    .expect("static regex")
});
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[a-z!][^>]*>").expect("static regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// `normalize_with_limit` with the default budget.
pub fn normalize(raw: &str) -> String {
    normalize_with_limit(raw, DEFAULT_MAX_CHARS)
}

/// Strip markup, decode entities, collapse whitespace and truncate to
/// `max_chars` on a word boundary where possible. Idempotent.
pub fn normalize_with_limit(raw: &str, max_chars: usize) -> String {
    // Decoding can surface new markup (`&lt;b&gt;`), so run until stable.
    // Every pass that changes the text shortens it in chars.
    let mut cur = clean_once(raw);
    loop {
        let next = clean_once(&cur);
        if next == cur {
            break;
        }
        cur = next;
    }
    truncate_on_word(&cur, max_chars)
}

fn clean_once(s: &str) -> String {
    let out = RE_SCRIPT_STYLE.replace_all(s, " ");
    let out = RE_BLOCK_TAGS.replace_all(&out, " ");
    let out = RE_TAGS.replace_all(&out, "");
    let out = html_escape::decode_html_entities(&out);

    // “ ” « » → ", ‘ ’ → ', non-breaking space → space
    let out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    RE_WS.replace_all(&out, " ").trim().to_string()
}

fn truncate_on_word(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let byte_end = s
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let head = &s[..byte_end];
    // A cut that lands exactly before a space is already a word boundary.
    if s[byte_end..].starts_with(' ') {
        return head.trim_end().to_string();
    }
    match head.rfind(' ') {
        Some(i) if i > 0 => head[..i].trim_end().to_string(),
        _ => head.to_string(),
    }
}
