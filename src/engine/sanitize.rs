//! Target argument sanitization (§4.1 "Argument sanitization").
//!
//! Every argument reaches the subprocess as a separate argv element — shell interpolation
//! is never used, so this module has nothing to escape, only to reject. Target strings are
//! rejected outright when they are loopback, link-local, private (unless the descriptor
//! opts in via `allow_private`), or syntactically not a hostname / IPv4 / IPv6 / URL.

use crate::error::OrchestratorError;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

fn hostname_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,63}$")
            .expect("valid hostname regex")
    })
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^https?://[^\s]+$").expect("valid URL regex"))
}

fn is_private_or_reserved_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_link_local()
        || ip.is_private()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
}

fn is_private_or_reserved_v6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00 || (ip.segments()[0] & 0xffc0) == 0xfe80
}

fn host_from_url(url: &str) -> Option<String> {
    let without_scheme = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host_and_rest = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host_only = host_and_rest.rsplit_once(':').map(|(h, _)| h).unwrap_or(host_and_rest);
    Some(host_only.to_string())
}

/// Validate a raw target string against the syntactic and policy rules in §4.1. Returns
/// the (unmodified) target on success.
pub fn validate_target(target: &str, allow_private: bool) -> Result<String, OrchestratorError> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::invalid_target("target is empty"));
    }

    let host_to_check = if url_pattern().is_match(trimmed) {
        host_from_url(trimmed).ok_or_else(|| OrchestratorError::invalid_target("malformed URL"))?
    } else {
        trimmed.to_string()
    };

    if let Ok(ip) = host_to_check.parse::<IpAddr>() {
        let is_reserved = match ip {
            IpAddr::V4(v4) => is_private_or_reserved_v4(&v4),
            IpAddr::V6(v6) => is_private_or_reserved_v6(&v6),
        };
        if is_reserved && !allow_private {
            return Err(OrchestratorError::invalid_target(format!(
                "target '{}' resolves to a private/loopback/link-local address",
                trimmed
            )));
        }
        return Ok(trimmed.to_string());
    }

    if hostname_pattern().is_match(&host_to_check) || url_pattern().is_match(trimmed) {
        if host_to_check.eq_ignore_ascii_case("localhost") && !allow_private {
            return Err(OrchestratorError::invalid_target("localhost is not a permitted target"));
        }
        return Ok(trimmed.to_string());
    }

    Err(OrchestratorError::invalid_target(format!(
        "target '{}' is not a valid hostname, IPv4, IPv6, or URL",
        trimmed
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_hostname() {
        assert!(validate_target("example.test", false).is_ok());
    }

    #[test]
    fn accepts_https_url() {
        assert!(validate_target("https://example.test/path", false).is_ok());
    }

    #[test]
    fn rejects_loopback_ipv4_by_default() {
        let err = validate_target("127.0.0.1", false).unwrap_err();
        assert_eq!(err.kind(), "InvalidTarget");
    }

    #[test]
    fn rejects_loopback_ipv6_by_default() {
        assert!(validate_target("::1", false).is_err());
    }

    #[test]
    fn rejects_private_range_unless_allowed() {
        assert!(validate_target("10.0.0.5", false).is_err());
        assert!(validate_target("10.0.0.5", true).is_ok());
    }

    #[test]
    fn rejects_link_local() {
        assert!(validate_target("169.254.1.1", false).is_err());
    }

    #[test]
    fn rejects_localhost_hostname() {
        assert!(validate_target("localhost", false).is_err());
    }

    #[test]
    fn accepts_public_ip() {
        assert!(validate_target("93.184.216.34", false).is_ok());
    }

    #[test]
    fn rejects_garbage_target() {
        assert!(validate_target("not a host; rm -rf /", false).is_err());
    }

    #[test]
    fn rejects_private_ip_embedded_in_url() {
        assert!(validate_target("http://10.0.0.5:8080/admin", false).is_err());
    }
}
