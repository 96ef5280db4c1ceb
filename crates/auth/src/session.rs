/// Normalize and validate a session name.
///
/// Normalization lowercases and maps spaces to underscores; validation
/// then requires 3–50 chars of `[a-z0-9_-]`.
pub fn normalize_session_name(input: &str) -> crate::Result<String> {
    let normalized: String = input
        .trim()
        .chars()
        .map(|c| match c {
            ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    let valid_len = (3..=50).contains(&normalized.len());
    let valid_chars = normalized
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');

    if !valid_len || !valid_chars {
        return Err(crate::AuthError::InvalidSessionName(input.to_string()));
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_replaces_spaces() {
        assert_eq!(normalize_session_name("My Work Laptop").unwrap(), "my_work_laptop");
        assert_eq!(normalize_session_name("dev-box_2").unwrap(), "dev-box_2");
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(normalize_session_name("ab").is_err());
        assert!(normalize_session_name(&"x".repeat(51)).is_err());
        assert!(normalize_session_name(&"x".repeat(50)).is_ok());
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(normalize_session_name("some/where").is_err());
        assert!(normalize_session_name("héllo").is_err());
    }
}
