//! Shared primitives used across every ServGrid crate.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a node in the cluster.
pub type NodeId = String;

/// Default port handed to services that do not request one.
pub const DEFAULT_SERVICE_PORT: u16 = 44955;

/// Default runtime name.
pub const DEFAULT_RUNTIME: &str = "jvm";

/// Default separator between task name and numeric id.
pub const DEFAULT_NAME_SPLITTER: &str = "-";

/// Whether `name` is usable as a task, group or service name
/// (`[a-zA-Z0-9._-*]+`).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '*'))
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    epoch_millis() / 1000
}

// ── HostAndPort ────────────────────────────────────────────────────

/// A network listener or service address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Rewrite wildcard bind addresses to the matching loopback address
    /// so a local process can connect to them.
    pub fn to_connectable(&self) -> Self {
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) if v4.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            Ok(IpAddr::V6(v6)) if v6.is_unspecified() => Ipv6Addr::LOCALHOST.to_string(),
            _ => self.host.clone(),
        };
        Self {
            host,
            port: self.port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_name("Lobby-1"));
        assert!(is_valid_name("proxy_eu.west*"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("lobby 1"));
        assert!(!is_valid_name("lobby/1"));
    }

    #[test]
    fn wildcard_listeners_become_loopback() {
        let v4 = HostAndPort::new("0.0.0.0", 1410).to_connectable();
        assert_eq!(v4.host, "127.0.0.1");

        let v6 = HostAndPort::new("::", 1410).to_connectable();
        assert_eq!(v6.host, "::1");

        let named = HostAndPort::new("node-1.internal", 1410).to_connectable();
        assert_eq!(named.host, "node-1.internal");
    }

    #[test]
    fn display_brackets_ipv6() {
        assert_eq!(HostAndPort::new("::1", 80).to_string(), "[::1]:80");
        assert_eq!(HostAndPort::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
    }
}
