use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Returns the first `n` characters as a Cow<str>, avoiding allocation if possible.
pub fn first_n_chars_lossy(s: &str, n: usize) -> Cow<'_, str> {
    if s.chars().count() <= n {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}...", prefix_chars(s, n)))
    }
}

/// True when the text has no visible character at all.
pub fn is_blank(s: &str) -> bool {
    !s.chars().any(|c| !c.is_whitespace())
}
