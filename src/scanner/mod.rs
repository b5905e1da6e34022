//! Scanner registry: one closed set of protocols, each mapped statically to
//! its config section, default port, dialer setup and scan function.

pub mod status;

use crate::config::ProbeConfig;
use crate::error::{ScanError, ScanResult};
use crate::network::{DialerGroup, DialerGroupConfig, ScanContext, ScanTarget, TlsLog};
use crate::protocols::{MssqlResults, MssqlScanner, SmbLog, SmbScanner, TelnetLog, TelnetScanner};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use status::ScanStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mssql,
    Smb,
    Telnet,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Mssql, Protocol::Smb, Protocol::Telnet];

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Mssql => "mssql",
            Protocol::Smb => "smb",
            Protocol::Telnet => "telnet",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Mssql => 1433,
            Protocol::Smb => 445,
            Protocol::Telnet => 23,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Protocol::Mssql => "Perform a PRELOGIN handshake with Microsoft SQL Server",
            Protocol::Smb => "Probe for SMB servers (Windows file sharing / Samba)",
            Protocol::Telnet => "Fetch a telnet banner",
        }
    }

    pub fn dialer_group_config(&self, config: &ProbeConfig) -> DialerGroupConfig {
        match self {
            Protocol::Mssql => MssqlScanner::dialer_group_config(config),
            Protocol::Smb => SmbScanner::dialer_group_config(config),
            Protocol::Telnet => TelnetScanner::dialer_group_config(config),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mssql" => Ok(Protocol::Mssql),
            "smb" => Ok(Protocol::Smb),
            "telnet" => Ok(Protocol::Telnet),
            other => Err(ScanError::InvalidInput(format!("unknown protocol '{}'", other))),
        }
    }
}

/// `(status, result, error)` of one protocol scan
#[derive(Debug)]
pub struct ScanOutcome<T> {
    pub status: ScanStatus,
    pub result: Option<T>,
    pub error: Option<ScanError>,
}

impl<T> ScanOutcome<T> {
    pub fn new(status: ScanStatus, result: Option<T>, error: Option<ScanError>) -> Self {
        Self {
            status,
            result,
            error,
        }
    }

    pub fn success(result: T) -> Self {
        Self::new(ScanStatus::Success, Some(result), None)
    }

    /// Status is derived from the error
    pub fn failure(error: ScanError, result: Option<T>) -> Self {
        Self::new(ScanStatus::from_error(&error), result, Some(error))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ScanOutcome<U> {
        ScanOutcome {
            status: self.status,
            result: self.result.map(f),
            error: self.error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ScanData {
    Mssql(MssqlResults),
    Smb(SmbLog),
    Telnet(TelnetLog),
}

/// Serializable record of one scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    pub protocol: Protocol,
    pub target: String,
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// TLS log of a dial-time handshake that failed before any result existed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsLog>,
    pub timestamp: DateTime<Utc>,
}

impl ScanResponse {
    fn from_outcome(protocol: Protocol, target: &ScanTarget, outcome: ScanOutcome<ScanData>) -> Self {
        Self {
            protocol,
            target: target.to_string(),
            status: outcome.status,
            result: outcome.result,
            tls: outcome.error.as_ref().and_then(|e| e.tls_log()).cloned(),
            error: outcome.error.map(|e| e.to_string()),
            timestamp: Utc::now(),
        }
    }
}

enum ProtocolScanner {
    Mssql(MssqlScanner),
    Smb(SmbScanner),
    Telnet(TelnetScanner),
}

/// A configured scanner for one protocol, with its dialers built once.
/// Immutable after construction; share it between concurrent scans.
pub struct Scanner {
    protocol: Protocol,
    inner: ProtocolScanner,
    dialers: DialerGroup,
}

impl Scanner {
    pub fn new(protocol: Protocol, config: &ProbeConfig) -> ScanResult<Self> {
        config.validate()?;

        let inner = match protocol {
            Protocol::Mssql => ProtocolScanner::Mssql(MssqlScanner::new(config.mssql.clone())),
            Protocol::Smb => ProtocolScanner::Smb(SmbScanner::new(config.smb.clone())),
            Protocol::Telnet => ProtocolScanner::Telnet(TelnetScanner::new(config.telnet.clone())),
        };
        let dialers = DialerGroup::new(&protocol.dialer_group_config(config))?;

        Ok(Self {
            protocol,
            inner,
            dialers,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn dialer_group(&self) -> &DialerGroup {
        &self.dialers
    }

    pub async fn scan(&self, ctx: &ScanContext, target: &ScanTarget) -> ScanResponse {
        self.scan_with(ctx, &self.dialers, target).await
    }

    /// Scan using an explicitly supplied dialer group
    pub async fn scan_with(
        &self,
        ctx: &ScanContext,
        dialers: &DialerGroup,
        target: &ScanTarget,
    ) -> ScanResponse {
        log::debug!("Starting {} scan of {}", self.protocol, target);

        let outcome = match &self.inner {
            ProtocolScanner::Mssql(s) => s.scan(ctx, dialers, target).await.map(ScanData::Mssql),
            ProtocolScanner::Smb(s) => s.scan(ctx, dialers, target).await.map(ScanData::Smb),
            ProtocolScanner::Telnet(s) => s.scan(ctx, dialers, target).await.map(ScanData::Telnet),
        };

        if let Some(e) = &outcome.error {
            log::debug!("{} scan of {} ended with {}: {}", self.protocol, target, outcome.status, e);
        }

        ScanResponse::from_outcome(self.protocol, target, outcome)
    }
}
