use crate::video::Video;

/// Characters that must be backslash-escaped in Telegram MarkdownV2 text.
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        if c == '\\' || MARKDOWN_V2_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `m:ss`, with hours folded into minutes.
pub fn format_duration(duration_secs: u32) -> String {
    format!("{}:{:02}", duration_secs / 60, duration_secs % 60)
}

/// MarkdownV2 caption for a delivered video.
///
/// The code line is always present; title, actors, tags, duration and link
/// are added only when known.
pub fn format_video_message(video: &Video) -> String {
    let mut lines = vec![format!("🎬 *{}*", escape_markdown(&video.code))];

    if !video.title.is_empty() {
        lines.push(format!("📝 {}", escape_markdown(&video.title)));
    }
    if !video.actors.is_empty() {
        lines.push(format!("👩 {}", escape_markdown(&video.actors)));
    }
    if !video.tags.is_empty() {
        lines.push(format!("🏷 {}", escape_markdown(&video.tags)));
    }
    if video.duration_secs > 0 {
        lines.push(format!("⏱ {}", escape_markdown(&format_duration(video.duration_secs))));
    }
    if let Some(url) = video.detail_url.as_deref() {
        lines.push(format!("🔗 {}", escape_markdown(url)));
    }

    lines.join("\n")
}

/// Shorten `text` to at most `max_chars` characters, ending in `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
