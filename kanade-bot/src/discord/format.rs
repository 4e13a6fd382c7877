//! Discord text helpers.

use regex::Regex;
use std::sync::LazyLock;

/// Discord message length limit, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Split a reply into chunks that fit Discord's message limit.
///
/// Lines are kept whole where possible; a line longer than the limit is split
/// at the last space that fits, or hard-split when there is none.
pub fn split_message(text: &str) -> Vec<String> {
    split_with_limit(text, MAX_MESSAGE_LENGTH)
}

fn split_with_limit(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count();
        let sep = usize::from(!current.is_empty());

        if current_len + sep + line_len > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > max_len {
            let mut remaining = line;
            while remaining.chars().count() > max_len {
                let split_at = find_split_point(remaining, max_len);
                chunks.push(remaining[..split_at].trim_end().to_string());
                remaining = remaining[split_at..].trim_start();
            }
            current = remaining.to_string();
            current_len = current.chars().count();
        } else {
            if !current.is_empty() {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(line);
            current_len += line_len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Byte index at which to split `text` so the head holds at most `max_chars`
/// characters, preferring the last space.
fn find_split_point(text: &str, max_chars: usize) -> usize {
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);

    match text[..limit].rfind(' ') {
        Some(pos) if pos > 0 => pos,
        _ => limit,
    }
}

static MENTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@!?(\d+)>").unwrap());

/// True if `text` mentions `bot_id` directly.
pub fn mentions_user(text: &str, bot_id: &str) -> bool {
    MENTION_PATTERN
        .captures_iter(text)
        .any(|c| c.get(1).is_some_and(|m| m.as_str() == bot_id))
}

/// Remove mentions of `bot_id` and trim the rest.
///
/// Mentions of other users are left in place.
pub fn strip_mentions(text: &str, bot_id: &str) -> String {
    MENTION_PATTERN
        .replace_all(text, |caps: &regex::Captures<'_>| {
            if caps.get(1).is_some_and(|m| m.as_str() == bot_id) {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .trim()
        .to_string()
}

/// Render a user mention.
pub fn user_mention(user_id: &str) -> String {
    format!("<@{user_id}>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_short_message() {
        let chunks = split_message("Hello world");
        assert_eq!(chunks, vec!["Hello world"]);
    }

    #[test]
    fn split_long_message() {
        let text = "a ".repeat(1500);
        let chunks = split_message(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= MAX_MESSAGE_LENGTH);
        }
    }

    #[test]
    fn split_keeps_lines_together() {
        let line = "x".repeat(1200);
        let text = format!("{line}\n{line}");
        let chunks = split_message(&text);
        assert_eq!(chunks, vec![line.clone(), line]);
    }

    #[test]
    fn split_without_spaces_hard_splits() {
        let text = "y".repeat(4500);
        let chunks = split_message(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[2].len(), 500);
    }

    #[test]
    fn split_counts_characters_not_bytes() {
        let text = "é".repeat(2000);
        assert_eq!(split_message(&text).len(), 1);

        let text = "é".repeat(2001);
        let chunks = split_message(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2000);
    }

    #[test]
    fn strip_bot_mentions() {
        assert_eq!(strip_mentions("<@42> hello", "42"), "hello");
        assert_eq!(strip_mentions("<@!42>  what's up  ", "42"), "what's up");
        assert_eq!(strip_mentions("<@42>", "42"), "");
        assert_eq!(strip_mentions("hi <@7> and <@42>", "42"), "hi <@7> and");
    }

    #[test]
    fn detects_mentions() {
        assert!(mentions_user("<@42> hi", "42"));
        assert!(mentions_user("hey <@!42>", "42"));
        assert!(!mentions_user("<@420> hi", "42"));
        assert!(!mentions_user("plain text", "42"));
    }
}
