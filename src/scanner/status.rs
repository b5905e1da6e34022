//! Scan status classification

use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanStatus {
    Success,
    /// Could not reach the service, or it hung up on us
    ConnectionFailed,
    Timeout,
    /// The peer sent something that is not the protocol we expected
    ProtocolError,
    /// The peer speaks the protocol but refused what we asked for
    ApplicationError,
    InvalidInputs,
    UnknownError,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Success => "success",
            ScanStatus::ConnectionFailed => "connection-failed",
            ScanStatus::Timeout => "timeout",
            ScanStatus::ProtocolError => "protocol-error",
            ScanStatus::ApplicationError => "application-error",
            ScanStatus::InvalidInputs => "invalid-inputs",
            ScanStatus::UnknownError => "unknown-error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScanStatus::Success)
    }

    /// Classify an error by its innermost cause
    pub fn from_error(err: &ScanError) -> Self {
        if err.is_timeout() {
            return ScanStatus::Timeout;
        }

        match err.root() {
            ScanError::Dial { .. } => ScanStatus::ConnectionFailed,
            ScanError::Io(e) => Self::from_io_kind(e.kind()),
            ScanError::InvalidTdsHeader(_) | ScanError::Protocol(_) | ScanError::Tls(_) => {
                ScanStatus::ProtocolError
            }
            ScanError::NoServerEncryption | ScanError::ServerRequiresEncryption { .. } => {
                ScanStatus::ApplicationError
            }
            ScanError::InvalidInput(_) | ScanError::Config(_) => ScanStatus::InvalidInputs,
            ScanError::Timeout | ScanError::Cancelled => ScanStatus::Timeout,
            _ => ScanStatus::UnknownError,
        }
    }

    fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::AddrNotAvailable => ScanStatus::ConnectionFailed,
            io::ErrorKind::InvalidData => ScanStatus::ProtocolError,
            _ => ScanStatus::UnknownError,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_display() {
        for status in [
            ScanStatus::Success,
            ScanStatus::ConnectionFailed,
            ScanStatus::ProtocolError,
            ScanStatus::InvalidInputs,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }

    #[test]
    fn test_io_kinds() {
        let reset = ScanError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(ScanStatus::from_error(&reset), ScanStatus::ConnectionFailed);

        let garbage = ScanError::Io(io::Error::new(io::ErrorKind::InvalidData, "bad header"));
        assert_eq!(ScanStatus::from_error(&garbage), ScanStatus::ProtocolError);

        let other = ScanError::Io(io::Error::new(io::ErrorKind::Other, "?"));
        assert_eq!(ScanStatus::from_error(&other), ScanStatus::UnknownError);
    }

    #[test]
    fn test_wrapped_errors_classified_by_root() {
        let err = ScanError::ServerRequiresEncryption {
            cause: Some(Box::new(ScanError::Tls("alert".to_string()))),
        }
        .context("10.0.0.5:1433");
        assert_eq!(ScanStatus::from_error(&err), ScanStatus::ApplicationError);

        let err = ScanError::InvalidTdsHeader("type 0x48".to_string()).context("x");
        assert_eq!(ScanStatus::from_error(&err), ScanStatus::ProtocolError);
    }
}
