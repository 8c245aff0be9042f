/// Whether the process may bind privileged ports
#[cfg(unix)]
pub fn has_elevated_privileges() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn has_elevated_privileges() -> bool {
    false
}

/// Ports below 1024 need elevation on Unix
pub fn is_privileged_port(port: u16) -> bool {
    port < 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_ports() {
        assert!(is_privileged_port(80));
        assert!(is_privileged_port(443));
        assert!(!is_privileged_port(1024));
        assert!(!is_privileged_port(8080));
    }

    #[cfg(unix)]
    #[test]
    fn test_matches_effective_uid() {
        let root = unsafe { libc::geteuid() } == 0;
        assert_eq!(has_elevated_privileges(), root);
    }
}
