//! Deimos - multi-protocol handshake probe engine
//!
//! Dials a target, drives the MSSQL, SMB or Telnet handshake, and reports
//! what the service revealed along with a classified scan status.

pub mod config;
pub mod error;
pub mod network;
pub mod protocols;
pub mod scanner;

// Re-export commonly used types
pub use config::ProbeConfig;
pub use error::{ScanError, ScanResult};
pub use network::{ScanContext, ScanTarget};
pub use scanner::{Protocol, ScanData, ScanOutcome, ScanResponse, ScanStatus, Scanner};

pub type Result<T> = std::result::Result<T, ScanError>;
