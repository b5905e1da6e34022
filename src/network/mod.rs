//! Network module: scan targets, deadline-aware streams, dialers and TLS

pub mod context;
pub mod dialer;
pub mod tls;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub use context::{ContextStream, ScanContext};
pub use dialer::{Connection, DialerGroup, DialerGroupConfig, L4Dialer, Transport};
pub use tls::{CertificateInfo, TlsAttempt, TlsLog, TlsWrapper};

/// One probe target: a host name or address, a port and an optional
/// pre-resolved IP that skips DNS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub host: String,
    pub port: u16,
    pub ip: Option<IpAddr>,
}

impl ScanTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let ip = host.parse::<IpAddr>().ok();
        Self { host, port, ip }
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            ip: Some(addr.ip()),
        }
    }

    /// Attach an already resolved address
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// The host name when the target was given as a name rather than an address
    pub fn domain(&self) -> Option<&str> {
        if self.host.is_empty() || self.host.parse::<IpAddr>().is_ok() {
            None
        } else {
            Some(&self.host)
        }
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn host_port(&self) -> String {
        let host = if self.host.is_empty() {
            self.ip.map(|ip| ip.to_string()).unwrap_or_default()
        } else {
            self.host.clone()
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_port())
    }
}

/// Lowercase hex rendering used for raw protocol fields in results
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
