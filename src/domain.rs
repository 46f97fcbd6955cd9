use std::net::IpAddr;

use anyhow::{Result, anyhow};

/// Normalizes a configured domain to lowercase ASCII without a trailing dot.
/// Wildcard labels and IP literals pass through untouched apart from case.
pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    if is_ip_literal(trimmed) {
        return Ok(trimmed.to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("*.") {
        let ascii =
            idna::domain_to_ascii(rest).map_err(|err| anyhow!("invalid domain name: {err}"))?;
        return Ok(format!("*.{}", ascii.to_lowercase()));
    }
    let ascii =
        idna::domain_to_ascii(trimmed).map_err(|err| anyhow!("invalid domain name: {err}"))?;
    Ok(ascii.to_lowercase())
}

pub fn is_wildcard(domain: &str) -> bool {
    domain.starts_with("*.")
}

pub fn is_ip_literal(domain: &str) -> bool {
    domain.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().is_ok()
}

/// Returns true when `host` is covered by `pattern`, where `pattern` may be a
/// single-label wildcard such as `*.example.com`.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let host = host.trim_end_matches('.');
    if pattern.eq_ignore_ascii_case(host) {
        return true;
    }
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    match host.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
        None => false,
    }
}

/// Deterministic wildcard-shaped label for a domain: `www.example.com` becomes
/// `*.example.com`. Apex domains and wildcards map to `*.` of themselves.
pub fn wildcard_label(domain: &str) -> String {
    let domain = domain.trim_end_matches('.').to_lowercase();
    if is_wildcard(&domain) || is_ip_literal(&domain) {
        return domain;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() > 2 {
        format!("*.{}", labels[1..].join("."))
    } else {
        format!("*.{domain}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        assert_eq!(normalize_domain(" WWW.Example.COM. ").unwrap(), "www.example.com");
        assert_eq!(normalize_domain("*.Example.com").unwrap(), "*.example.com");
        assert_eq!(normalize_domain("10.0.0.1").unwrap(), "10.0.0.1");
        assert!(normalize_domain("  ").is_err());
    }

    #[test]
    fn wildcard_matches_single_label_only() {
        assert!(host_matches("*.example.com", "www.example.com"));
        assert!(!host_matches("*.example.com", "a.b.example.com"));
        assert!(!host_matches("*.example.com", "example.com"));
        assert!(host_matches("Example.com", "example.com"));
    }

    #[test]
    fn recognizes_ip_literals() {
        assert!(is_ip_literal("192.168.1.10"));
        assert!(is_ip_literal("[::1]"));
        assert!(!is_ip_literal("example.com"));
    }

    #[test]
    fn builds_wildcard_labels() {
        assert_eq!(wildcard_label("www.example.com"), "*.example.com");
        assert_eq!(wildcard_label("example.com"), "*.example.com");
        assert_eq!(wildcard_label("*.example.com"), "*.example.com");
    }
}
