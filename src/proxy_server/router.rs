//! Host-based dispatch: `oauth.<domain>`, `health.<domain>`, and
//! `{sub}.<domain>` where `sub` is a valid DNS label.

use once_cell::sync::Lazy;
use regex::Regex;

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("static regex compiles"));

/// Which of the three host patterns a request's `Host` header matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    Oauth,
    Health,
    Upstream(String),
    Unknown,
}

/// Classifies `host` (already stripped of any `:port` suffix) against the
/// configured parent `domain`.
pub fn classify(host: &str, domain: &str) -> HostKind {
    if host == format!("oauth.{domain}") {
        return HostKind::Oauth;
    }
    if host == format!("health.{domain}") {
        return HostKind::Health;
    }

    if let Some(sub) = host.strip_suffix(&format!(".{domain}")) {
        if DNS_LABEL.is_match(sub) {
            return HostKind::Upstream(sub.to_string());
        }
    }

    HostKind::Unknown
}

/// Strips a `:port` suffix from a `Host` header value, the way the router
/// needs to before pattern-matching against the configured domain.
pub fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_oauth_host() {
        assert_eq!(classify("oauth.example.com", "example.com"), HostKind::Oauth);
    }

    #[test]
    fn classifies_health_host() {
        assert_eq!(classify("health.example.com", "example.com"), HostKind::Health);
    }

    #[test]
    fn classifies_valid_upstream_subdomain() {
        assert_eq!(
            classify("svc-1.example.com", "example.com"),
            HostKind::Upstream("svc-1".to_string())
        );
    }

    #[test]
    fn rejects_invalid_dns_label() {
        assert_eq!(
            classify("-bad.example.com", "example.com"),
            HostKind::Unknown
        );
    }

    #[test]
    fn rejects_unrelated_host() {
        assert_eq!(classify("other.org", "example.com"), HostKind::Unknown);
    }

    #[test]
    fn strips_port_suffix() {
        assert_eq!(strip_port("svc.example.com:8443"), "svc.example.com");
    }
}
