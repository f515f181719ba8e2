//! Channel naming rules.
//!
//! Channel names double as bus channel identifiers, so they are restricted
//! to lowercase ASCII letters, digits and underscores.

/// Broadcast channel every instance listens on.
pub const CONTROL_CHANNEL: &str = "shared_bridge_channel";

/// Longest channel name the bus accepts (Postgres identifier limit).
pub const MAX_CHANNEL_NAME_LEN: usize = 63;

/// Normalize a raw name to the bus's character set.
///
/// Uppercase ASCII letters are lowercased; any other character outside
/// `[a-z0-9_]` becomes `_`. The result is truncated to
/// [`MAX_CHANNEL_NAME_LEN`].
pub fn normalize_channel_name(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .take(MAX_CHANNEL_NAME_LEN)
        .collect()
}

/// Check whether a name is already in normalized form.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CHANNEL_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_channel_name("c_Web-01.local_ab12c"), "c_web_01_local_ab12c");
        assert_eq!(normalize_channel_name("c_hôst_x"), "c_h_st_x");
    }

    #[test]
    fn test_normalize_truncates() {
        let raw = format!("c_{}", "a".repeat(100));
        let name = normalize_channel_name(&raw);
        assert_eq!(name.len(), MAX_CHANNEL_NAME_LEN);
        assert!(is_valid_channel_name(&name));
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_channel_name(CONTROL_CHANNEL));
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("Upper"));
        assert!(!is_valid_channel_name("with-dash"));
    }
}
