//! Tab-escaped string encoding used on multi-value wire fields, plus a
//! sanitizer for untrusted text that ends up in log lines.

/// Escape `value` so it can be joined with other values by TAB without
/// ambiguity. TAB, CR, LF, NUL and backslash are replaced by two-character
/// backslash sequences.
pub fn tabescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            _ => out.push(c),
        }
    }
    out
}

/// Make remote-controlled text safe to log: control characters become `?`
/// and anything longer than `max_len` characters is truncated with a `...`
/// marker.
pub fn sanitize(value: &str, max_len: usize) -> String {
    let mut out: String = value
        .chars()
        .take(max_len)
        .map(|c| if c.is_control() { '?' } else { c })
        .collect();
    if value.chars().count() > max_len {
        for _ in 0..3 {
            out.pop();
        }
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tabescape_replaces_every_separator_byte() {
        assert_eq!(tabescape("a\tb\\c\r\nd"), "a\\tb\\\\c\\r\\nd");
        assert_eq!(tabescape("nul\0end"), "nul\\0end");
    }

    #[test]
    fn tabescape_plain_value_unchanged() {
        assert_eq!(tabescape("session-id-1"), "session-id-1");
    }

    #[test]
    fn sanitize_hides_control_chars_and_truncates() {
        assert_eq!(sanitize("ok\x07line", 160), "ok?line");
        let long = "x".repeat(200);
        let out = sanitize(&long, 160);
        assert_eq!(out.len(), 160);
        assert!(out.ends_with("..."));
    }
}
