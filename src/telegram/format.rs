//! Markdown/Telegram formatting helpers (spec §4.5, §4.8, §8 boundary
//! behaviors). Generalizes the teacher's `send_long_message` chunking
//! (newline-only search) into the paragraph > newline > sentence > space >
//! hard-break boundary search spec §4.5/§8 require, and its
//! `markdown_to_telegram_html` converter's escaping habit into a minimal
//! MarkdownV2 escaper. The full-fidelity markdown->Telegram conversion is
//! the teacher's `markdown_to_telegram_html`'s concern (out of core scope
//! per spec §1 "the Telegram markdown escaper"); this module only owns the
//! pieces the streaming projector and transport need directly: splitting,
//! truncation, and the escape used when MarkdownV2 parsing is attempted.

pub const TELEGRAM_MSG_LIMIT: usize = 4096;
pub const TOPIC_NAME_LIMIT: usize = 128;

/// Largest byte index <= `index` that is a valid UTF-8 char boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Finds the best split point at or before `max_len` bytes, preferring
/// paragraph break > newline > sentence end > space > a hard UTF-8
/// boundary (spec §4.5, §8: "4097 characters is split at the best
/// boundary >= 2048").
pub fn best_split_point(text: &str, max_len: usize) -> usize {
    if text.len() <= max_len {
        return text.len();
    }
    let limit = floor_char_boundary(text, max_len);
    let half = max_len / 2;

    if let Some(pos) = text[..limit].rfind("\n\n") {
        if pos >= half {
            return pos + 2;
        }
    }
    if let Some(pos) = text[..limit].rfind('\n') {
        if pos >= half {
            return pos + 1;
        }
    }
    if let Some(pos) = find_sentence_end(&text[..limit], half) {
        return pos;
    }
    if let Some(pos) = text[..limit].rfind(' ') {
        if pos >= half {
            return pos + 1;
        }
    }
    limit
}

fn find_sentence_end(s: &str, min_pos: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut best = None;
    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') && i + 1 < bytes.len() && bytes[i + 1] == b' ' && i + 2 >= min_pos {
            best = Some(i + 2);
        }
    }
    best
}

/// Splits `text` into chunks of at most [`TELEGRAM_MSG_LIMIT`] bytes,
/// using [`best_split_point`] at every boundary (spec §4.5 `sendMessage`).
pub fn split_for_telegram(text: &str) -> Vec<String> {
    if text.len() <= TELEGRAM_MSG_LIMIT {
        return vec![text.to_string()];
    }
    let mut out = Vec::new();
    let mut remaining = text;
    while remaining.len() > TELEGRAM_MSG_LIMIT {
        let split = best_split_point(remaining, TELEGRAM_MSG_LIMIT);
        let split = if split == 0 { floor_char_boundary(remaining, TELEGRAM_MSG_LIMIT) } else { split };
        let (chunk, rest) = remaining.split_at(split);
        out.push(chunk.to_string());
        remaining = rest;
    }
    if !remaining.is_empty() {
        out.push(remaining.to_string());
    }
    out
}

/// Truncates a forum topic name to [`TOPIC_NAME_LIMIT`] characters (spec
/// §4.5, §8: "129 becomes 125 characters + `...`").
pub fn truncate_topic_name(name: &str) -> String {
    let char_count = name.chars().count();
    if char_count <= TOPIC_NAME_LIMIT {
        return name.to_string();
    }
    let keep: String = name.chars().take(TOPIC_NAME_LIMIT - 3).collect();
    format!("{keep}\u{2026}")
}

/// Short reasoning (<=60 chars) renders in full with a `> thinking:`
/// prefix; longer reasoning is elided to `beginning...end` with a
/// guaranteed non-overlapping split at the midpoint (spec §4.8.2, §8).
pub fn format_reasoning(content: &str) -> String {
    let char_count = content.chars().count();
    if char_count <= 60 {
        return format!("> thinking: {content}");
    }
    let mid = char_count / 2;
    let begin: String = content.chars().take(mid).collect();
    let end: String = content.chars().skip(mid).collect();
    format!("> thinking: {begin}\u{2026}{end}")
}

/// Minimal MarkdownV2 escaping for the characters Telegram requires
/// escaped outside of explicit entities. Used when attempting the
/// markdown-first send/edit (spec §4.5 "tries markdown first").
pub fn escape_markdown_v2(text: &str) -> String {
    const SPECIAL: &[char] = &[
        '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    ];
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Renders a todo list with circled-number-ish status icons (spec §4.8
/// `todowrite`).
pub fn format_todo_list(items: &[crate::agent::events::TodoItem]) -> String {
    use crate::agent::events::TodoStatus;
    let mut out = String::new();
    for item in items {
        let icon = match item.status {
            TodoStatus::Completed => "\u{2705}",
            TodoStatus::InProgress => "\u{25b6}",
            TodoStatus::Pending => "\u{25cb}",
        };
        out.push_str(icon);
        out.push(' ');
        out.push_str(&item.content);
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_exactly_4096_is_sent_unsplit() {
        let text = "a".repeat(TELEGRAM_MSG_LIMIT);
        let chunks = split_for_telegram(&text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), TELEGRAM_MSG_LIMIT);
    }

    #[test]
    fn text_of_4097_splits_at_boundary_at_least_half() {
        let text = "a".repeat(4097);
        let chunks = split_for_telegram(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].len() >= 2048);
        assert!(chunks[0].len() <= TELEGRAM_MSG_LIMIT);
    }

    #[test]
    fn splits_prefer_paragraph_boundary() {
        let mut text = "x".repeat(3000);
        text.push_str("\n\n");
        text.push_str(&"y".repeat(2000));
        let chunks = split_for_telegram(&text);
        assert!(chunks[0].ends_with("\n\n"));
    }

    #[test]
    fn topic_name_of_128_is_sent_verbatim() {
        let name = "a".repeat(128);
        assert_eq!(truncate_topic_name(&name), name);
    }

    #[test]
    fn topic_name_of_129_becomes_125_plus_ellipsis() {
        let name = "a".repeat(129);
        let truncated = truncate_topic_name(&name);
        assert_eq!(truncated.chars().count(), 126);
        assert!(truncated.ends_with('\u{2026}'));
        assert_eq!(truncated.chars().filter(|&c| c == 'a').count(), 125);
    }

    #[test]
    fn reasoning_of_60_chars_is_shown_in_full() {
        let content = "a".repeat(60);
        let out = format_reasoning(&content);
        assert!(out.contains(&content));
        assert!(!out.contains('\u{2026}'));
    }

    #[test]
    fn reasoning_of_61_chars_is_elided_with_disjoint_segments() {
        let content = "a".repeat(30) + &"b".repeat(31);
        let out = format_reasoning(&content);
        assert!(out.contains('\u{2026}'));
        assert!(out.contains('a'));
        assert!(out.contains('b'));
    }

    #[test]
    fn escape_markdown_v2_escapes_special_chars() {
        let escaped = escape_markdown_v2("a.b_c");
        assert_eq!(escaped, "a\\.b\\_c");
    }
}
