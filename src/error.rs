//! Error handling for the deimos probe engine
//!
//! Every failure a probe can hit is a variant of [`ScanError`]. Errors are
//! wrapped with the target they happened against and later mapped to a
//! [`ScanStatus`](crate::scanner::status::ScanStatus) by the classifier.

use crate::network::TlsLog;
use std::io;
use thiserror::Error;

/// Main error type for probe operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("error dialing {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ScanError>,
    },

    #[error("scan deadline exceeded")]
    Timeout,

    #[error("scan cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The handshake ran and failed; `log` holds what was negotiated so far.
    #[error("TLS handshake with {target} failed: {source}")]
    TlsHandshake {
        target: String,
        log: Box<TlsLog>,
        #[source]
        source: Box<ScanError>,
    },

    #[error("TLS setup error: {0}")]
    TlsSetup(#[from] openssl::error::ErrorStack),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not a valid TDS header: {0}")]
    InvalidTdsHeader(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client asked for encryption but the server declared it cannot encrypt.
    #[error("server does not support encryption")]
    NoServerEncryption,

    /// The server declared encryption mandatory and no TLS session was established.
    #[error("server requires encryption")]
    ServerRequiresEncryption {
        #[source]
        cause: Option<Box<ScanError>>,
    },
}

/// Result type alias for probe operations
pub type ScanResult<T> = Result<T, ScanError>;

impl ScanError {
    /// Wrap this error with a human readable context, usually naming the target.
    pub fn context(self, context: impl Into<String>) -> Self {
        ScanError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ScanError::Protocol(message.into())
    }

    /// The innermost error once all context wrappers are peeled off.
    pub fn root(&self) -> &ScanError {
        let mut current = self;
        loop {
            match current {
                ScanError::Context { source, .. } | ScanError::TlsHandshake { source, .. } => {
                    current = source
                }
                _ => return current,
            }
        }
    }

    /// The TLS log of a failed handshake anywhere in the chain
    pub fn tls_log(&self) -> Option<&TlsLog> {
        let mut current = self;
        loop {
            match current {
                ScanError::TlsHandshake { log, .. } => return Some(log),
                ScanError::Context { source, .. } => current = source,
                _ => return None,
            }
        }
    }

    /// The io error kind carried by the root error, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self.root() {
            ScanError::Io(e) => Some(e.kind()),
            ScanError::Dial { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self.root() {
            ScanError::Timeout | ScanError::Cancelled => true,
            _ => matches!(
                self.io_kind(),
                Some(io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
            ),
        }
    }
}

impl From<openssl::ssl::Error> for ScanError {
    fn from(err: openssl::ssl::Error) -> Self {
        // Keep deadline and reset information visible to the classifier.
        match err.into_io_error() {
            Ok(io_err) => ScanError::Io(io_err),
            Err(err) => ScanError::Tls(err.to_string()),
        }
    }
}
