/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Strips a `data:<mime>;base64,` prefix, returning the raw base64 payload.
pub fn strip_data_url(s: &str) -> &str {
    let trimmed = s.trim();
    match trimmed.strip_prefix("data:") {
        Some(rest) => match rest.find(";base64,") {
            Some(idx) => &rest[idx + ";base64,".len()..],
            None => trimmed,
        },
        None => trimmed,
    }
}

/// Builds a `data:` URL around an already base64-encoded payload.
pub fn to_data_url(content_type: &str, b64: &str) -> String {
    format!("data:{};base64,{}", content_type, b64)
}
