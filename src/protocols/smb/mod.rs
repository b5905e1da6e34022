//! SMB negotiation probe (default port 445)
//!
//! 1. Connect and send an SMB2 NEGOTIATE offering dialect 2.1 with signing enabled.
//! 2. Read the response. A failure here produces no log at all.
//!    An SMB1 protocol id sets `smbv1_support`; otherwise the negotiate fields are decoded.
//! 3. Optionally send a SESSION_SETUP carrying an NTLMSSP NEGOTIATE and decode
//!    the CHALLENGE. A failure here keeps the log gathered so far.
//!
//! When step 2 fails the scanner reconnects once and retries verbosely.

pub mod negotiator;
pub mod ntlm;
pub mod scanner;
pub mod wire;

use crate::error::ScanError;
use crate::network::hex_string;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

pub use negotiator::{Negotiator, SmbNegotiator};
pub use scanner::SmbScanner;

pub const CAP_DFS: u32 = 0x0000_0001;
pub const CAP_LEASING: u32 = 0x0000_0002;
pub const CAP_LARGE_MTU: u32 = 0x0000_0004;
pub const CAP_MULTI_CHANNEL: u32 = 0x0000_0008;
pub const CAP_PERSISTENT_HANDLES: u32 = 0x0000_0010;
pub const CAP_DIRECTORY_LEASING: u32 = 0x0000_0020;
pub const CAP_ENCRYPTION: u32 = 0x0000_0040;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET: i64 = 11_644_473_600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SmbLog {
    pub smbv1_support: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub smb_version: Option<SmbVersions>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub smb_capabilities: Option<SmbCapabilities>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiation_log: Option<NegotiationLog>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_setup_log: Option<SessionSetupLog>,

    /// Produced by a verbose negotiation
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,

    /// Produced on the second connection of a retried scan
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retried: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmbVersions {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub version_string: String,
}

impl SmbVersions {
    /// 0x0311 -> 3.1.1
    pub fn from_dialect(dialect: u16) -> Self {
        let major = (dialect >> 8) as u8;
        let minor = ((dialect >> 4) & 0x0F) as u8;
        let revision = (dialect & 0x0F) as u8;
        Self {
            major,
            minor,
            revision,
            version_string: format!("SMB {}.{}.{}", major, minor, revision),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SmbCapabilities {
    pub dfs_support: bool,
    pub leasing: bool,
    pub large_mtu: bool,
    pub multi_channel: bool,
    pub persistent_handles: bool,
    pub directory_leasing: bool,
    pub encryption: bool,
}

impl SmbCapabilities {
    pub fn from_flags(flags: u32) -> Self {
        Self {
            dfs_support: flags & CAP_DFS != 0,
            leasing: flags & CAP_LEASING != 0,
            large_mtu: flags & CAP_LARGE_MTU != 0,
            multi_channel: flags & CAP_MULTI_CHANNEL != 0,
            persistent_handles: flags & CAP_PERSISTENT_HANDLES != 0,
            directory_leasing: flags & CAP_DIRECTORY_LEASING != 0,
            encryption: flags & CAP_ENCRYPTION != 0,
        }
    }
}

/// Raw SMB2 header fields, kept for verbose scans
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderLog {
    pub protocol_id: String,
    pub status: u32,
    pub command: u16,
    pub credits: u16,
    pub flags: u32,
}

impl From<&wire::Smb2Header> for HeaderLog {
    fn from(header: &wire::Smb2Header) -> Self {
        Self {
            protocol_id: hex_string(&header.protocol_id),
            status: header.status,
            command: header.command,
            credits: header.credits,
            flags: header.flags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationLog {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_log: Option<HeaderLog>,
    pub security_mode: u16,
    pub dialect_revision: u16,
    pub server_guid: String,
    pub capabilities: u32,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authentication_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSetupLog {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_log: Option<HeaderLog>,
    pub setup_flags: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    pub negotiate_flags: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netbios_computer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netbios_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_computer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_tree_name: Option<String>,
}

impl SessionSetupLog {
    fn apply_challenge(&mut self, challenge: ntlm::NtlmChallenge) {
        self.os_version = challenge.os_version();
        self.target_name = challenge.target_name;
        self.negotiate_flags = challenge.negotiate_flags;
        self.netbios_computer_name = challenge.netbios_computer_name;
        self.netbios_domain_name = challenge.netbios_domain_name;
        self.dns_computer_name = challenge.dns_computer_name;
        self.dns_domain_name = challenge.dns_domain_name;
        self.dns_tree_name = challenge.dns_tree_name;
    }
}

/// A failed negotiation, with whatever log it produced
#[derive(Debug)]
pub struct SmbFailure {
    pub log: Option<SmbLog>,
    pub error: ScanError,
}

impl From<ScanError> for SmbFailure {
    fn from(error: ScanError) -> Self {
        Self { log: None, error }
    }
}

impl fmt::Display for SmbFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// FILETIME (100ns ticks since 1601) to UTC; zero means "not set"
pub fn filetime_to_utc(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let secs = (filetime / 10_000_000) as i64 - FILETIME_UNIX_OFFSET;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
}
