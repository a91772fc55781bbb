//! Network bridge: destination policy and egress
//!
//! A destination must be on the plugin's allow-list. Independently of the
//! allow-list, loopback, private and link-local addresses, local-only host
//! names and cloud metadata endpoints are never reachable. Responses are read
//! only up to the plugin's remaining network budget.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use palisade_core::config::NetworkConfig;
use thiserror::Error;
use url::{Host, Url};

const BLOCKED_SUFFIXES: [&str; 6] = [
    ".localhost",
    ".local",
    ".internal",
    ".corp",
    ".lan",
    ".home",
];

const METADATA_HOSTS: [&str; 4] = [
    "metadata",
    "metadata.google.internal",
    "169.254.169.254",
    "100.100.100.200",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("invalid URL")]
    InvalidUrl,

    #[error("scheme '{0}' is not allowed")]
    Scheme(String),

    #[error("host '{0}' is not reachable from plugins")]
    BlockedHost(String),

    #[error("host '{0}' is not in the plugin's allow-list")]
    NotAllowed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkPolicy {
    enforce_https: bool,
    block_private: bool,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

impl NetworkPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            enforce_https: config.enforce_https,
            block_private: config.block_private_addresses,
        }
    }

    /// Parse `url` and check it against the policy and `allowed_hosts`
    pub fn check(&self, url: &str, allowed_hosts: &[String]) -> Result<Url, PolicyViolation> {
        let parsed = Url::parse(url).map_err(|_| PolicyViolation::InvalidUrl)?;

        match parsed.scheme() {
            "https" => {}
            "http" if !self.enforce_https => {}
            other => return Err(PolicyViolation::Scheme(other.to_string())),
        }

        let host = parsed.host().ok_or(PolicyViolation::InvalidUrl)?;
        let name = host.to_string().to_ascii_lowercase();

        if METADATA_HOSTS.contains(&name.trim_matches(|c| c == '[' || c == ']')) {
            return Err(PolicyViolation::BlockedHost(name));
        }

        let blocked = match &host {
            Host::Domain(domain) => is_local_name(&domain.to_ascii_lowercase()),
            Host::Ipv4(addr) => self.block_private && is_internal_v4(addr),
            Host::Ipv6(addr) => self.block_private && is_internal_v6(addr),
        };
        if blocked {
            return Err(PolicyViolation::BlockedHost(name));
        }

        if !allowed_hosts.iter().any(|pattern| host_matches(pattern, &name)) {
            return Err(PolicyViolation::NotAllowed(name));
        }

        Ok(parsed)
    }
}

fn is_local_name(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    domain == "localhost" || BLOCKED_SUFFIXES.iter().any(|suffix| domain.ends_with(suffix))
}

fn is_internal_v4(addr: &Ipv4Addr) -> bool {
    let [a, b, ..] = addr.octets();
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        // carrier-grade NAT, 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b))
}

fn is_internal_v6(addr: &Ipv6Addr) -> bool {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_internal_v4(&mapped);
    }
    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        // unique local fc00::/7
        || (first & 0xfe00) == 0xfc00
        // link local fe80::/10
        || (first & 0xffc0) == 0xfe80
}

/// Exact host, or `*.domain` for any subdomain of `domain`
fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(domain) => host
            .strip_suffix(domain)
            .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.')),
        None => pattern == host,
    }
}

/// Whether an address is one plugins may never reach
pub fn is_internal_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => is_internal_v6(v6),
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EgressError {
    /// The response is larger than the caller allowed; `received` bytes were
    /// read before giving up
    #[error("response larger than the remaining network budget")]
    OverBudget { received: u64 },

    #[error("{0}")]
    Failed(String),
}

/// Performs network sends that already passed [`NetworkPolicy`]
#[async_trait]
pub trait NetworkEgress: Send + Sync + fmt::Debug {
    /// Send `body` and return at most `max_response` bytes of the answer
    async fn send(
        &self,
        url: &Url,
        body: Vec<u8>,
        max_response: u64,
    ) -> Result<Vec<u8>, EgressError>;
}

/// Egress for hosts that grant no network access at all
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedEgress;

#[async_trait]
impl NetworkEgress for DisconnectedEgress {
    async fn send(
        &self,
        _url: &Url,
        _body: Vec<u8>,
        _max_response: u64,
    ) -> Result<Vec<u8>, EgressError> {
        Err(EgressError::Failed(
            "network egress is not available".to_string(),
        ))
    }
}

/// HTTPS egress via reqwest; redirects are not followed
#[derive(Debug, Clone)]
pub struct HttpEgress {
    client: reqwest::Client,
}

impl HttpEgress {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkEgress for HttpEgress {
    async fn send(
        &self,
        url: &Url,
        body: Vec<u8>,
        max_response: u64,
    ) -> Result<Vec<u8>, EgressError> {
        let mut response = self
            .client
            .post(url.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| EgressError::Failed(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EgressError::Failed(format!("remote answered {status}")));
        }
        if response.content_length().is_some_and(|len| len > max_response) {
            return Err(EgressError::OverBudget { received: 0 });
        }

        read_capped(&mut response, max_response).await
    }
}

/// Read the body chunk by chunk, stopping as soon as it passes `max`
async fn read_capped(response: &mut reqwest::Response, max: u64) -> Result<Vec<u8>, EgressError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        EgressError::Failed(format!("failed to read response: {}", e.without_url()))
    })? {
        body.extend_from_slice(&chunk);
        if body.len() as u64 > max {
            return Err(EgressError::OverBudget {
                received: body.len() as u64,
            });
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_allow_listed_https_passes() {
        let policy = NetworkPolicy::default();
        let url = policy
            .check("https://api.weather.example/v1", &allow(&["*.weather.example"]))
            .unwrap();
        assert_eq!(url.host_str(), Some("api.weather.example"));
    }

    #[test]
    fn test_wildcard_does_not_match_lookalikes() {
        assert!(host_matches("*.example.com", "a.example.com"));
        assert!(host_matches("*.example.com", "a.b.example.com"));
        assert!(!host_matches("*.example.com", "example.com"));
        assert!(!host_matches("*.example.com", "badexample.com"));
        assert!(host_matches("Example.com", "example.com"));
    }

    #[test]
    fn test_empty_allow_list_denies() {
        let policy = NetworkPolicy::default();
        assert_eq!(
            policy.check("https://example.com", &[]),
            Err(PolicyViolation::NotAllowed("example.com".into()))
        );
    }

    #[test]
    fn test_plain_http_refused_when_https_enforced() {
        let policy = NetworkPolicy::default();
        assert_eq!(
            policy.check("http://example.com", &allow(&["example.com"])),
            Err(PolicyViolation::Scheme("http".into()))
        );

        let relaxed = NetworkPolicy::from_config(&NetworkConfig {
            enforce_https: false,
            ..NetworkConfig::default()
        });
        assert!(relaxed.check("http://example.com", &allow(&["example.com"])).is_ok());
        assert!(relaxed.check("ftp://example.com", &allow(&["example.com"])).is_err());
    }

    #[test]
    fn test_internal_destinations_blocked_even_if_listed() {
        let policy = NetworkPolicy::default();
        for url in [
            "https://localhost/",
            "https://127.0.0.1/",
            "https://10.1.2.3/",
            "https://192.168.0.10/",
            "https://169.254.169.254/latest/meta-data",
            "https://metadata.google.internal/",
            "https://100.100.100.200/",
            "https://printer.local/",
            "https://[::1]/",
            "https://[fd00::1]/",
            "https://[::ffff:10.0.0.1]/",
        ] {
            let host = Url::parse(url).unwrap().host_str().unwrap().to_string();
            let result = policy.check(url, &allow(&[host.as_str()]));
            assert!(
                matches!(result, Err(PolicyViolation::BlockedHost(_))),
                "{url} not blocked: {result:?}"
            );
        }
    }

    #[test]
    fn test_public_addresses_pass() {
        assert!(!is_internal_address(&"93.184.216.34".parse().unwrap()));
        assert!(!is_internal_address(&"2606:2800:220:1::".parse().unwrap()));
        assert!(is_internal_address(&"100.64.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_disconnected_egress_fails() {
        let url = Url::parse("https://example.com").unwrap();
        assert!(matches!(
            DisconnectedEgress.send(&url, vec![], 1024).await,
            Err(EgressError::Failed(_))
        ));
    }
}
