//! Utility functions shared by Kanade crates.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Works on character boundaries, so multi-byte text is never split.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Sanitize a string for safe logging (redact credentials).
pub fn sanitize_for_log(s: &str) -> String {
    let patterns: &[(&str, &str)] = &[
        (r"(?i)(api[_-]?key|apikey|key)=[A-Za-z0-9_\-]{10,}", "$1=***REDACTED***"),
        (r"(?i)(token|secret|bearer|bot)\s*[=:]?\s+[A-Za-z0-9_\-\.]{20,}", "$1 ***REDACTED***"),
        (r"AIza[0-9A-Za-z_\-]{30,}", "***REDACTED_API_KEY***"),
        (r"[MN][A-Za-z\d]{23,}\.[\w-]{6}\.[\w-]{27,}", "***REDACTED_BOT_TOKEN***"),
    ];

    let mut result = s.to_string();
    for (pattern, replacement) in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            result = re.replace_all(&result, *replacement).to_string();
        }
    }
    result
}
