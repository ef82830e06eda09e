//! Byte-budget helpers for captured command output.
//!
//! Failures usually show up at the end of a test run, so capping keeps the
//! most recent bytes and prepends a marker describing what was dropped.

/// Default budget for captured verification output (64 KiB).
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Keep at most `limit` trailing bytes of `text`, prepending a truncation marker.
///
/// The cut is moved forward to the next UTF-8 boundary, so the kept tail may be
/// a few bytes shorter than `limit`. Text within budget is returned unchanged.
pub fn cap_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let kept = &text[start..];
    format!(
        "{}{kept}",
        truncation_marker(kept.len(), text.len())
    )
}

/// Marker prepended to capped output.
pub fn truncation_marker(kept: usize, total: usize) -> String {
    format!("[output truncated: kept last {kept} of {total} bytes]\n")
}

/// Last `max_chars` characters of `text`, for log lines.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_budget_is_untouched() {
        assert_eq!(cap_tail("short", 10), "short");
        assert_eq!(cap_tail("exact", 5), "exact");
    }

    #[test]
    fn keeps_most_recent_bytes_with_marker() {
        let capped = cap_tail("0123456789", 4);
        assert_eq!(capped, "[output truncated: kept last 4 of 10 bytes]\n6789");
    }

    #[test]
    fn never_splits_a_character() {
        // "é" is two bytes; a 3-byte tail of "aéé" would start mid-character.
        let capped = cap_tail("aéé", 3);
        assert!(capped.ends_with("é"));
        assert!(capped.contains("kept last 2 of 5 bytes"));
    }

    #[test]
    fn tail_chars_counts_characters() {
        assert_eq!(tail_chars("hello world", 5), "world");
        assert_eq!(tail_chars("héllo", 10), "héllo");
        assert_eq!(tail_chars("héllo", 4), "éllo");
    }
}
