//! Routing-key pattern matching for topic exchanges.
//!
//! Keys and patterns are dot-delimited. In a pattern `*` matches exactly one
//! segment and `#` matches zero or more segments.

/// Check whether `routing_key` matches the binding `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Try every possible number of swallowed segments.
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_segments(rest, &key[1..]),
    }
}
