//! Client identity resolution.
//!
//! Combines a peer's IP address with an (optionally) parsed MQTT Client-ID
//! into the [`ClientInfo`] surfaced to the forwarder, logs, and metrics.

use std::fmt;
use std::net::IpAddr;

/// A client's display identity: its peer IP and resolved Client-ID.
///
/// `client_id` is the original MQTT Client-ID when one was parsed and
/// non-empty; otherwise it is `"anonymous_<ip>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: IpAddr,
    pub client_id: String,
}

impl ClientInfo {
    /// The fingerprint the rate limiter keys buckets by: the original
    /// Client-ID when present, else the textual IP.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        if self.is_anonymous() {
            self.ip.to_string()
        } else {
            self.client_id.clone()
        }
    }

    fn is_anonymous(&self) -> bool {
        self.client_id == format!("anonymous_{}", self.ip)
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.client_id, self.ip)
    }
}

/// Resolves a [`ClientInfo`] from a peer address and a parsed Client-ID.
///
/// `parsed_client_id` should be `None` when the CONNECT parser didn't
/// recognize the packet, and `Some("")` or `Some(id)` otherwise; both
/// `None` and `Some("")` fall back to the `anonymous_<ip>` display id.
#[must_use]
pub fn resolve_client_info(ip: IpAddr, parsed_client_id: Option<&str>) -> ClientInfo {
    match parsed_client_id {
        Some(id) if !id.is_empty() => ClientInfo {
            ip,
            client_id: id.to_string(),
        },
        _ => ClientInfo {
            ip,
            client_id: format!("anonymous_{ip}"),
        },
    }
}
