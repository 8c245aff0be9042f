use crate::error::TunnelError;

/// Canonical form of a tunnel domain: lowercase, suffixed, no trailing dot
///
/// `"App"` and `"app.local."` both become `"app.local"` with the default
/// suffix.
pub fn normalize_domain(domain: &str, suffix: &str) -> Result<String, TunnelError> {
    let trimmed = domain.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(TunnelError::invalid("domain", "domain cannot be empty"));
    }
    let lower = trimmed.to_ascii_lowercase();
    let suffix = suffix.to_ascii_lowercase();
    let bare_suffix = suffix.trim_start_matches('.');

    if lower == suffix || lower == bare_suffix {
        return Err(TunnelError::invalid(
            "domain",
            format!("'{}' has no name before the suffix", trimmed),
        ));
    }

    let normalized = if lower.ends_with(&suffix) {
        lower
    } else {
        format!("{}{}", lower, suffix)
    };

    if !is_host_name(&normalized) {
        return Err(TunnelError::invalid(
            "domain",
            format!("'{}' is not a valid host name", trimmed),
        ));
    }
    Ok(normalized)
}

/// Dot-separated non-empty labels of ASCII alphanumerics, `-` and `_`
fn is_host_name(name: &str) -> bool {
    name.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_appends_suffix() {
        assert_eq!(normalize_domain("app", ".local").unwrap(), "app.local");
        assert_eq!(normalize_domain("api.app", ".local").unwrap(), "api.app.local");
    }

    #[test]
    fn test_canonicalizes() {
        assert_eq!(normalize_domain("App.Local", ".local").unwrap(), "app.local");
        assert_eq!(normalize_domain("  app.local. ", ".local").unwrap(), "app.local");
        assert_eq!(normalize_domain("app", ".test").unwrap(), "app.test");
    }

    #[test]
    fn test_rejects_invalid() {
        for input in [
            "", "   ", ".", ".local", "local", "my app", "a/b", "app:1", "a..b", ".app",
            "app\tx", "app#1", "caf\u{e9}", "a\\b",
        ] {
            let err = normalize_domain(input, ".local").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "input {:?}", input);
        }
    }

    #[test]
    fn test_accepts_host_name_characters() {
        assert_eq!(normalize_domain("my-app_2", ".local").unwrap(), "my-app_2.local");
        assert_eq!(normalize_domain("v1.API", ".local").unwrap(), "v1.api.local");
    }
}
