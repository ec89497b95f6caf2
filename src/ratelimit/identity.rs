//! Identity key derivation and handling.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity value used when a request carries no usable client address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// The two independent rate limiting tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Requests identified by client network address
    Ip,
    /// Requests identified by an API token
    Token,
}

impl Tier {
    /// Name used for key prefixes, logs and the admin API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Ip => "ip",
            Tier::Token => "token",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known tier.
#[derive(Debug, Error)]
#[error("unknown tier `{0}`, expected `ip` or `token`")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ip" => Ok(Tier::Ip),
            "token" => Ok(Tier::Token),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

/// A key that uniquely identifies a rate limited caller.
///
/// The key is namespaced by tier (`ip:10.0.0.1`, `token:abc`), so an IP
/// address and a token with the same text never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    tier: Tier,
    key: String,
}

impl IdentityKey {
    /// Create a key for `value` within `tier`.
    pub fn new(tier: Tier, value: &str) -> Self {
        Self {
            tier,
            key: format!("{}:{}", tier.as_str(), value),
        }
    }

    /// Key for an API token.
    pub fn token(token: &str) -> Self {
        Self::new(Tier::Token, token)
    }

    /// Key for a client address, with any port suffix removed.
    pub fn client_addr(addr: &str) -> Self {
        Self::new(Tier::Ip, &strip_port(addr))
    }

    /// The tier this key is governed by.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The identity without its tier prefix.
    pub fn value(&self) -> &str {
        &self.key[self.tier.as_str().len() + 1..]
    }

    /// The namespaced key used in the counter store.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// A form safe for logs: token values are cut to a short prefix.
    pub fn redacted(&self) -> String {
        match self.tier {
            Tier::Ip => self.key.clone(),
            Tier::Token => {
                let visible: String = self.value().chars().take(4).collect();
                format!("{}:{}***", self.tier.as_str(), visible)
            }
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Remove a port suffix from an address, keeping bare IPv6 addresses intact.
pub fn strip_port(addr: &str) -> String {
    let addr = addr.trim();

    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return ip.to_string();
    }
    if let Some(inner) = addr.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
        return inner.to_string();
    }

    // host:port where host is not an IP literal
    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':')
                && !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            host.to_string()
        }
        _ => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_namespacing() {
        let ip = IdentityKey::client_addr("10.0.0.1");
        let token = IdentityKey::token("10.0.0.1");

        assert_eq!(ip.as_str(), "ip:10.0.0.1");
        assert_eq!(token.as_str(), "token:10.0.0.1");
        assert_ne!(ip, token);
        assert_eq!(ip.value(), token.value());
    }

    #[test]
    fn test_identity_key_equality() {
        let key1 = IdentityKey::token("tok-A");
        let key2 = IdentityKey::token("tok-A");
        assert_eq!(key1, key2);
        assert_eq!(key1.tier(), Tier::Token);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("10.0.0.1:8080"), "10.0.0.1");
        assert_eq!(strip_port(" 10.0.0.1 "), "10.0.0.1");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("proxy.internal:3128"), "proxy.internal");
        assert_eq!(strip_port("proxy.internal"), "proxy.internal");
    }

    #[test]
    fn test_client_addr_strips_port() {
        let key = IdentityKey::client_addr("192.168.1.7:51234");
        assert_eq!(key.as_str(), "ip:192.168.1.7");
    }

    #[test]
    fn test_redacted_hides_token() {
        let key = IdentityKey::token("secret-token-value");
        assert_eq!(key.redacted(), "token:secr***");
        assert_eq!(key.to_string(), "token:secr***");

        let ip = IdentityKey::client_addr("10.0.0.1");
        assert_eq!(ip.to_string(), "ip:10.0.0.1");
    }

    #[test]
    fn test_tier_from_str() {
        assert_eq!("ip".parse::<Tier>().unwrap(), Tier::Ip);
        assert_eq!("token".parse::<Tier>().unwrap(), Tier::Token);
        assert!("region".parse::<Tier>().is_err());
    }
}
