//! Request size limits and SSRF-safe URL validation.
//!
//! Every chat request passes through here before any provider work starts:
//! oversize payloads are rejected up front, and custom provider base URLs
//! are checked against private, link-local, and cloud-metadata address
//! space before an outbound connection is ever attempted.

use ipnetwork::IpNetwork;
use regex::Regex;
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Maximum `user_input` size in bytes.
pub const MAX_USER_INPUT_BYTES: usize = 100 * 1024;
/// Maximum `instructions` size in bytes.
pub const MAX_INSTRUCTIONS_BYTES: usize = 50 * 1024;
/// Maximum number of history messages replayed per request.
pub const MAX_HISTORY_MESSAGES: usize = 100;
/// Maximum number of metadata entries per request.
pub const MAX_METADATA_ENTRIES: usize = 50;
/// Maximum metadata key size in bytes.
pub const MAX_METADATA_KEY_BYTES: usize = 1024;
/// Maximum metadata value size in bytes.
pub const MAX_METADATA_VALUE_BYTES: usize = 10 * 1024;

/// Validation failure surfaced to the client as `InvalidArgument`.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} exceeds maximum size of {limit} bytes")]
    TooLarge { field: &'static str, limit: usize },
    #[error("history exceeds maximum of {0} messages")]
    HistoryTooLong(usize),
    #[error("metadata exceeds maximum of {0} entries")]
    TooManyMetadataEntries(usize),
    #[error("metadata key exceeds maximum size of {0} bytes")]
    MetadataKeyTooLarge(usize),
    #[error("metadata value for key {key:?} exceeds maximum size of {limit} bytes")]
    MetadataValueTooLarge { key: String, limit: usize },
    #[error("unsafe base_url: {0}")]
    UnsafeUrl(String),
}

fn request_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static pattern"))
}

/// Accept a caller-supplied request id if well-formed, otherwise mint a
/// random 128-bit one.
pub fn normalize_request_id(supplied: Option<&str>) -> String {
    match supplied {
        Some(id) if request_id_pattern().is_match(id) => id.to_string(),
        _ => format!("{:032x}", rand::random::<u128>()),
    }
}

/// Check the size limits on one chat request.
pub fn validate_chat_sizes(
    user_input: &str,
    instructions: &str,
    history_len: usize,
    metadata: &HashMap<String, String>,
) -> Result<(), ValidationError> {
    if user_input.len() > MAX_USER_INPUT_BYTES {
        return Err(ValidationError::TooLarge {
            field: "user_input",
            limit: MAX_USER_INPUT_BYTES,
        });
    }
    if instructions.len() > MAX_INSTRUCTIONS_BYTES {
        return Err(ValidationError::TooLarge {
            field: "instructions",
            limit: MAX_INSTRUCTIONS_BYTES,
        });
    }
    if history_len > MAX_HISTORY_MESSAGES {
        return Err(ValidationError::HistoryTooLong(MAX_HISTORY_MESSAGES));
    }
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(ValidationError::TooManyMetadataEntries(MAX_METADATA_ENTRIES));
    }
    for (key, value) in metadata {
        if key.len() > MAX_METADATA_KEY_BYTES {
            return Err(ValidationError::MetadataKeyTooLarge(MAX_METADATA_KEY_BYTES));
        }
        if value.len() > MAX_METADATA_VALUE_BYTES {
            return Err(ValidationError::MetadataValueTooLarge {
                key: key.clone(),
                limit: MAX_METADATA_VALUE_BYTES,
            });
        }
    }
    Ok(())
}

/// Hostname resolution seam so tests can pin addresses without real DNS.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver backed by the OS stub resolver.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok((host, port)
            .to_socket_addrs()?
            .map(|sa| sa.ip())
            .collect())
    }
}

/// Protocols that must never reach a provider client.
const FORBIDDEN_SCHEMES: &[&str] = &[
    "file", "gopher", "javascript", "data", "ftp", "dict", "ldap", "ldaps", "tftp",
];

/// Hostnames that are metadata endpoints regardless of what they resolve to.
const BLOCKED_HOSTNAMES: &[&str] = &["metadata.google.internal"];

/// SSRF validator for provider base URLs.
///
/// Rejects URLs whose host sits in private, link-local, zero, or
/// cloud-metadata address space, whether given as a literal or reached
/// through DNS. Every resolved address is checked; the first blocked one
/// fails the URL.
pub struct SsrfValidator {
    blocked_ranges: Vec<IpNetwork>,
    resolver: Arc<dyn HostResolver>,
}

impl Default for SsrfValidator {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver))
    }
}

impl SsrfValidator {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        let blocked_ranges = vec![
            // Private IPv4 ranges (RFC 1918)
            IpNetwork::from_str("10.0.0.0/8").expect("static cidr"),
            IpNetwork::from_str("172.16.0.0/12").expect("static cidr"),
            IpNetwork::from_str("192.168.0.0/16").expect("static cidr"),
            // Link-local, includes the cloud metadata sentinel 169.254.169.254
            IpNetwork::from_str("169.254.0.0/16").expect("static cidr"),
            // Zero network
            IpNetwork::from_str("0.0.0.0/8").expect("static cidr"),
            // IPv6 link-local and unique-local
            IpNetwork::from_str("fe80::/10").expect("static cidr"),
            IpNetwork::from_str("fc00::/7").expect("static cidr"),
            // IPv6 unspecified
            IpNetwork::from_str("::/128").expect("static cidr"),
        ];
        Self {
            blocked_ranges,
            resolver,
        }
    }

    /// Validate a provider base URL.
    ///
    /// Scheme must be `http` or `https`; `http` is only accepted for
    /// loopback hosts. Resolution happens here so a rejected URL never
    /// produces an outbound connection attempt.
    pub fn validate_base_url(&self, raw: &str) -> Result<(), ValidationError> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| ValidationError::UnsafeUrl(format!("invalid URL: {e}")))?;

        let scheme = parsed.scheme();
        if FORBIDDEN_SCHEMES.contains(&scheme) {
            return Err(ValidationError::UnsafeUrl(format!(
                "forbidden protocol {scheme:?}"
            )));
        }
        if scheme != "http" && scheme != "https" {
            return Err(ValidationError::UnsafeUrl(format!(
                "scheme {scheme:?} not allowed, use http or https"
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ValidationError::UnsafeUrl("URL has no host".into()))?;

        if BLOCKED_HOSTNAMES.contains(&host.to_ascii_lowercase().as_str()) {
            return Err(ValidationError::UnsafeUrl(format!(
                "host {host:?} is a metadata endpoint"
            )));
        }

        let loopback = is_loopback_host(host);
        if scheme == "http" && !loopback {
            return Err(ValidationError::UnsafeUrl(
                "http is only allowed for loopback hosts".into(),
            ));
        }
        if loopback {
            return Ok(());
        }

        // Host literal: check directly without touching DNS. IPv6
        // literals come bracketed out of the URL parser.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = IpAddr::from_str(bare) {
            return self.check_ip(&ip, host);
        }

        let port = parsed
            .port()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let addrs = self
            .resolver
            .resolve(host, port)
            .map_err(|e| ValidationError::UnsafeUrl(format!("failed to resolve {host:?}: {e}")))?;
        if addrs.is_empty() {
            return Err(ValidationError::UnsafeUrl(format!(
                "host {host:?} resolved to no addresses"
            )));
        }
        for ip in &addrs {
            self.check_ip(ip, host)?;
        }
        Ok(())
    }

    fn check_ip(&self, ip: &IpAddr, host: &str) -> Result<(), ValidationError> {
        for range in &self.blocked_ranges {
            if range.contains(*ip) {
                return Err(ValidationError::UnsafeUrl(format!(
                    "host {host:?} resolves to blocked address {ip} (range {range})"
                )));
            }
        }
        Ok(())
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match IpAddr::from_str(host.trim_start_matches('[').trim_end_matches(']')) {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(HashMap<String, Vec<IpAddr>>);

    impl HostResolver for FixedResolver {
        fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn validator_with(entries: &[(&str, &[&str])]) -> SsrfValidator {
        let map = entries
            .iter()
            .map(|(host, ips)| {
                (
                    host.to_string(),
                    ips.iter().map(|ip| ip.parse().unwrap()).collect(),
                )
            })
            .collect();
        SsrfValidator::new(Arc::new(FixedResolver(map)))
    }

    #[test]
    fn blocks_private_literals() {
        let v = validator_with(&[]);
        assert!(v.validate_base_url("https://10.0.0.1/").is_err());
        assert!(v.validate_base_url("https://172.16.0.1/").is_err());
        assert!(v.validate_base_url("https://192.168.1.1/").is_err());
        assert!(v.validate_base_url("https://169.254.169.254/").is_err());
        assert!(v.validate_base_url("https://0.0.0.0/").is_err());
    }

    #[test]
    fn blocks_ipv6_private_literals() {
        let v = validator_with(&[]);
        // Link-local, unique-local, unspecified.
        assert!(v.validate_base_url("https://[fe80::1]/").is_err());
        assert!(v.validate_base_url("https://[fd00::1]/").is_err());
        assert!(v.validate_base_url("https://[fc00::1]:8080/").is_err());
        assert!(v.validate_base_url("https://[::]/").is_err());
        // IPv6 loopback stays subject to the loopback rule, not the
        // range table.
        assert!(v.validate_base_url("http://[::1]:11434/").is_ok());
    }

    #[test]
    fn blocks_hostname_resolving_to_ipv6_private_space() {
        let v = validator_with(&[("dual.example.com", &["93.184.216.34", "fe80::2"])]);
        let err = v.validate_base_url("https://dual.example.com/").unwrap_err();
        assert!(err.to_string().contains("fe80::2"));
    }

    #[test]
    fn blocks_forbidden_schemes() {
        let v = validator_with(&[]);
        for scheme in FORBIDDEN_SCHEMES {
            let url = format!("{scheme}://example.com/");
            assert!(v.validate_base_url(&url).is_err(), "scheme {scheme}");
        }
    }

    #[test]
    fn http_only_for_loopback() {
        let v = validator_with(&[("api.example.com", &["93.184.216.34"])]);
        assert!(v.validate_base_url("http://localhost:11434/").is_ok());
        assert!(v.validate_base_url("http://127.0.0.1:8080/").is_ok());
        assert!(v.validate_base_url("http://api.example.com/").is_err());
        assert!(v.validate_base_url("https://api.example.com/").is_ok());
    }

    #[test]
    fn blocks_hostname_resolving_to_private_space() {
        let v = validator_with(&[("evil.example.com", &["93.184.216.34", "10.1.2.3"])]);
        let err = v.validate_base_url("https://evil.example.com/").unwrap_err();
        assert!(err.to_string().contains("10.1.2.3"));
    }

    #[test]
    fn blocks_metadata_hostname_without_resolving() {
        let v = validator_with(&[]);
        assert!(v
            .validate_base_url("https://metadata.google.internal/computeMetadata/")
            .is_err());
    }

    #[test]
    fn size_limits_are_exact() {
        let meta = HashMap::new();
        let at_limit = "x".repeat(MAX_USER_INPUT_BYTES);
        assert!(validate_chat_sizes(&at_limit, "", 0, &meta).is_ok());
        let over = "x".repeat(MAX_USER_INPUT_BYTES + 1);
        assert!(validate_chat_sizes(&over, "", 0, &meta).is_err());
        let instructions = "y".repeat(MAX_INSTRUCTIONS_BYTES + 1);
        assert!(validate_chat_sizes("hi", &instructions, 0, &meta).is_err());
        assert!(validate_chat_sizes("hi", "", MAX_HISTORY_MESSAGES + 1, &meta).is_err());
    }

    #[test]
    fn metadata_limits() {
        let mut meta = HashMap::new();
        for i in 0..MAX_METADATA_ENTRIES + 1 {
            meta.insert(format!("k{i}"), "v".to_string());
        }
        assert!(validate_chat_sizes("hi", "", 0, &meta).is_err());

        let mut meta = HashMap::new();
        meta.insert("k".repeat(MAX_METADATA_KEY_BYTES + 1), "v".to_string());
        assert!(validate_chat_sizes("hi", "", 0, &meta).is_err());

        let mut meta = HashMap::new();
        meta.insert("k".into(), "v".repeat(MAX_METADATA_VALUE_BYTES + 1));
        assert!(validate_chat_sizes("hi", "", 0, &meta).is_err());
    }

    #[test]
    fn request_id_normalization() {
        assert_eq!(normalize_request_id(Some("req_abc-123")), "req_abc-123");
        let generated = normalize_request_id(Some("bad id with spaces"));
        assert_eq!(generated.len(), 32);
        let fresh = normalize_request_id(None);
        assert_eq!(fresh.len(), 32);
        assert_ne!(generated, fresh);
    }
}
