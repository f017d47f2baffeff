//! Shared utility functions

/// Outcome of capping a captured body at the configured byte budget.
///
/// `text` is the (possibly shortened) capture, `truncated` says whether the
/// cap was hit, and `original_size` is the byte length before capping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CappedBody {
    pub text: String,
    pub truncated: bool,
    pub original_size: usize,
}

/// Cap a captured body at `max_bytes`, recording the original length.
///
/// A body of exactly `max_bytes` is kept in full and not marked truncated;
/// one byte more trims the capture back to the last UTF-8 boundary at or
/// below the budget.
pub fn cap_body(raw: &[u8], max_bytes: usize) -> CappedBody {
    let original_size = raw.len();
    let text = String::from_utf8_lossy(raw);
    if original_size <= max_bytes {
        return CappedBody {
            text: text.into_owned(),
            truncated: false,
            original_size,
        };
    }
    CappedBody {
        text: truncate_utf8_safe(&text, max_bytes).to_string(),
        truncated: true,
        original_size,
    }
}

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_shorter_than_max() {
        assert_eq!(truncate_utf8_safe("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_at_ascii_boundary() {
        assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_at_utf8_boundary() {
        // 3-byte UTF-8 character: each of these is 3 bytes
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 4), "日");
        assert_eq!(truncate_utf8_safe(s, 6), "日本");
    }

    #[test]
    fn test_cap_body_exact_budget_not_truncated() {
        let raw = vec![b'a'; 100];
        let capped = cap_body(&raw, 100);
        assert_eq!(capped.text.len(), 100);
        assert!(!capped.truncated);
        assert_eq!(capped.original_size, 100);
    }

    #[test]
    fn test_cap_body_one_over_budget() {
        let raw = vec![b'a'; 101];
        let capped = cap_body(&raw, 100);
        assert_eq!(capped.text.len(), 100);
        assert!(capped.truncated);
        assert_eq!(capped.original_size, 101);
    }

    #[test]
    fn test_cap_body_empty() {
        let capped = cap_body(b"", 10);
        assert_eq!(capped.text, "");
        assert!(!capped.truncated);
        assert_eq!(capped.original_size, 0);
    }
}
