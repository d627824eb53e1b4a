//! Small helpers shared by the adapters, the orchestrator and config parsing.

/// Longest provider response body quoted in an error message
const ERROR_BODY_LIMIT: usize = 180;

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether a configured base URL uses an HTTP scheme.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// First line of a provider response body, cut short for logs and run errors.
pub fn compact_text(value: &str) -> String {
    value
        .trim()
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(ERROR_BODY_LIMIT)
        .collect()
}

/// Lowercased, trimmed email used as a natural key.
pub fn normalize_email(value: &str) -> Option<String> {
    let value = value.trim().to_ascii_lowercase();
    if value.contains('@') {
        Some(value)
    } else {
        None
    }
}

/// Digits of a phone number used as a natural key.
///
/// Numbers with fewer than seven digits are not considered matchable.
pub fn normalize_phone(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.len() >= 7 {
        Some(digits)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_urls_need_http_scheme() {
        assert!(is_http_url("https://login.salesforce.com"));
        assert!(is_http_url("http://localhost:8080"));
        assert!(!is_http_url("login.salesforce.com"));
    }

    #[test]
    fn error_bodies_are_cut_to_one_line() {
        assert_eq!(
            compact_text("  {\"message\":\"bad\"}\n<html>trace</html>"),
            "{\"message\":\"bad\"}"
        );
        assert_eq!(compact_text(&"x".repeat(500)).len(), ERROR_BODY_LIMIT);
        assert_eq!(compact_text("   "), "");
    }

    #[test]
    fn natural_keys_normalize() {
        assert_eq!(
            normalize_email("  Ada@Example.COM "),
            Some("ada@example.com".to_string())
        );
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(
            normalize_phone("+1 (555) 010-9999"),
            Some("15550109999".to_string())
        );
        assert_eq!(normalize_phone("12-34"), None);
    }
}
