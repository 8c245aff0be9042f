//! Host header helpers

/// Remove a trailing `:port` from a Host header value
///
/// Bracketed IPv6 literals keep their address (`[::1]:8080` -> `::1`).
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

/// Lowercased host without port or trailing dot
pub fn normalize_host(host: &str) -> String {
    strip_port(host.trim())
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("app.local:8080"), "app.local");
        assert_eq!(strip_port("app.local"), "app.local");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("app.local:"), "app.local:");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("App.Local:80"), "app.local");
        assert_eq!(normalize_host("app.local."), "app.local");
        assert_eq!(normalize_host(" APP "), "app");
    }
}
