//! Video code handling: normalisation, extraction from free text and URLs,
//! plus the duration heuristics used on listing and detail pages.
use std::sync::LazyLock;

use regex::Regex;

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+-[0-9]+").expect("valid regex"));
static VALID_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]+-[0-9]+$").expect("valid regex"));
static MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)\s*分").expect("valid regex"));
static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:([0-9]{1,2}):)?([0-9]{1,2}):([0-9]{2})\b").expect("valid regex")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+").expect("valid regex"));

/// Canonical form of a code: trimmed and upper-cased. Idempotent.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// True when `code` is already in canonical `LETTERS-DIGITS` form.
pub fn is_valid_code(code: &str) -> bool {
    VALID_CODE_RE.is_match(code)
}

/// First `letters-digits` run in `text`, normalised.
pub fn extract_code(text: &str) -> Option<String> {
    CODE_RE.find(text).map(|m| normalize_code(m.as_str()))
}

/// Last path segment of a URL (query and fragment removed), normalised.
///
/// This is the raw fallback identifier when neither the title nor the URL
/// contains a recognisable code; the result is not necessarily valid.
pub fn code_from_url(url: &str) -> Option<String> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let path = without_fragment.split('?').next().unwrap_or(without_fragment);
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() || segment.contains(':') {
        return None;
    }
    Some(normalize_code(segment))
}

/// Code derivation order: title pattern, URL pattern, URL last segment.
pub fn derive_code(title: Option<&str>, url: Option<&str>) -> Option<String> {
    title
        .and_then(extract_code)
        .or_else(|| url.and_then(extract_code))
        .or_else(|| url.and_then(code_from_url))
}

/// Duration in seconds parsed from listing/detail text.
///
/// Accepts `120分` / `120 分` (minutes), clock text `2:00:31` or `59:12`, and
/// finally a bare number which is read as minutes. Anything else is 0.
pub fn parse_duration_secs(text: &str) -> u32 {
    if let Some(minutes) = MINUTES_RE
        .captures(text)
        .and_then(|caps| caps[1].parse::<u32>().ok())
    {
        return minutes.saturating_mul(60);
    }

    if let Some(caps) = CLOCK_RE.captures(text) {
        let hours = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0);
        let minutes = caps[2].parse::<u32>().unwrap_or(0);
        let seconds = caps[3].parse::<u32>().unwrap_or(0);
        return hours * 3600 + minutes * 60 + seconds;
    }

    NUMBER_RE
        .find(text)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|minutes| minutes.saturating_mul(60))
        .unwrap_or(0)
}
