//! Proxy data models

use crate::proxy::geo::GeoInfo;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Timestamp format used in result rows
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y-%H:%M:%S";

/// A candidate SOCKS5 proxy endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    /// Renders `address:port`, bracketing IPv6 addresses
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Anonymity classification derived from reverse DNS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anonymity {
    Low,
    High,
}

impl Anonymity {
    /// `High` when reverse DNS produced a name distinct from the literal address
    pub fn classify(address: &IpAddr, hostname: Option<&str>) -> Self {
        match hostname {
            Some(name) if name != address.to_string() => Anonymity::High,
            _ => Anonymity::Low,
        }
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anonymity::Low => write!(f, "Low"),
            Anonymity::High => write!(f, "High"),
        }
    }
}

/// Outcome of verifying a single endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Verified {
        hostname: String,
        latency_ms: u64,
        anonymity: Anonymity,
    },
    Denylisted,
    Unreachable {
        reason: String,
    },
    Invalid {
        reason: String,
    },
}

impl ProbeOutcome {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        ProbeOutcome::Unreachable {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        ProbeOutcome::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, ProbeOutcome::Verified { .. })
    }

    /// Measured latency, if the endpoint was reachable
    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            ProbeOutcome::Verified { latency_ms, .. } => Some(*latency_ms),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Verified {
                hostname,
                latency_ms,
                anonymity,
            } => write!(f, "verified {}ms, {} anonymity ({})", latency_ms, anonymity, hostname),
            ProbeOutcome::Denylisted => write!(f, "denylisted"),
            ProbeOutcome::Unreachable { reason } => write!(f, "unreachable: {}", reason),
            ProbeOutcome::Invalid { reason } => write!(f, "invalid: {}", reason),
        }
    }
}

/// Durable record of a successfully verified endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedResult {
    pub endpoint: Endpoint,
    pub geo: GeoInfo,
    pub hostname: String,
    pub latency_ms: u64,
    pub anonymity: Anonymity,
    pub timestamp: DateTime<Local>,
}

impl VerifiedResult {
    /// Build a result from a `Verified` outcome; any other outcome yields `None`
    pub fn from_outcome(endpoint: Endpoint, geo: GeoInfo, outcome: &ProbeOutcome) -> Option<Self> {
        match outcome {
            ProbeOutcome::Verified {
                hostname,
                latency_ms,
                anonymity,
            } => Some(Self {
                endpoint,
                geo,
                hostname: hostname.clone(),
                latency_ms: *latency_ms,
                anonymity: *anonymity,
                timestamp: Local::now(),
            }),
            _ => None,
        }
    }

    /// Latency in the `Nms` form used by the result file
    pub fn speed(&self) -> String {
        format!("{}ms", self.latency_ms)
    }

    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Upstream relay every probe of a run tunnels through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayChoice {
    pub endpoint: Endpoint,
}

impl RelayChoice {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl fmt::Display for RelayChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://{}", self.endpoint)
    }
}
