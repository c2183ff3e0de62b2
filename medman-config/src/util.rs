use std::str::FromStr;

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Trimmed, non-empty value.
pub fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse `raw` as `T`, returning the rejected text on failure.
pub fn parse_value<T: FromStr>(raw: &str) -> Result<T, String> {
    raw.trim().parse::<T>().map_err(|_| raw.to_string())
}

/// Environment prefix for a queue name: `thumbnailQueue` becomes
/// `THUMBNAIL`, `objectAnalysisQueue` becomes `OBJECT_ANALYSIS`.
pub fn queue_env_prefix(queue: &str) -> String {
    let stem = queue.strip_suffix("Queue").unwrap_or(queue);
    let mut prefix = String::with_capacity(stem.len() + 4);
    for (i, ch) in stem.chars().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 {
            prefix.push('_');
        }
        if ch == '-' || ch == '.' {
            prefix.push('_');
        } else {
            prefix.push(ch.to_ascii_uppercase());
        }
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_prefixes_match_deployment_variables() {
        assert_eq!(queue_env_prefix("thumbnailQueue"), "THUMBNAIL");
        assert_eq!(queue_env_prefix("exifQueue"), "EXIF");
        assert_eq!(queue_env_prefix("objectAnalysisQueue"), "OBJECT_ANALYSIS");
        assert_eq!(queue_env_prefix("contentWarningsQueue"), "CONTENT_WARNINGS");
        assert_eq!(queue_env_prefix("custom-stage"), "CUSTOM_STAGE");
    }

    #[test]
    fn parse_bool_accepts_env_forms() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
