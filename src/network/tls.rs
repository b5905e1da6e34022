//! TLS client wrapper and handshake log
//!
//! The wrapper works over any `AsyncRead + AsyncWrite` stream, which lets the
//! MSSQL handshake run TLS through its TDS framing adapter instead of a bare
//! socket.

use super::{hex_string, ScanTarget};
use crate::config::{TlsConfig, TlsVersion};
use crate::error::{ScanError, ScanResult};
use openssl::hash::MessageDigest;
use openssl::ssl::{Ssl, SslConnector, SslMethod, SslRef, SslVerifyMode, SslVersion};
use openssl::x509::{X509NameRef, X509Ref};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;

impl TlsVersion {
    fn to_ssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Ssl3 => SslVersion::SSL3,
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

/// Builds client sessions from one shared, immutable `SslConnector`
pub struct TlsWrapper {
    connector: SslConnector,
    config: TlsConfig,
}

impl std::fmt::Debug for TlsWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsWrapper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TlsWrapper {
    pub fn new(config: &TlsConfig) -> ScanResult<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;

        if config.verify_certificates {
            builder.set_verify(SslVerifyMode::PEER);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
            // Level 0 re-enables TLS 1.0 and small keys still found on old servers
            builder.set_security_level(0);
        }

        if let Some(min) = config.min_version {
            builder.set_min_proto_version(Some(min.to_ssl_version()))?;
        }
        if let Some(max) = config.max_version {
            builder.set_max_proto_version(Some(max.to_ssl_version()))?;
        }
        if let Some(ca_file) = &config.ca_file {
            builder.set_ca_file(ca_file)?;
        }
        if let Some(ciphers) = &config.cipher_list {
            builder.set_cipher_list(ciphers)?;
        }

        Ok(Self {
            connector: builder.build(),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// SNI name: the configured override, else the target's domain name
    pub fn server_name<'a>(&'a self, target: &'a ScanTarget) -> Option<&'a str> {
        self.config.server_name.as_deref().or_else(|| target.domain())
    }

    pub fn new_ssl(&self, target: &ScanTarget) -> ScanResult<Ssl> {
        let sni = self.server_name(target);
        let ssl = self
            .connector
            .configure()?
            .use_server_name_indication(sni.is_some())
            .verify_hostname(self.config.verify_certificates)
            .into_ssl(sni.unwrap_or(&target.host))?;
        Ok(ssl)
    }

    /// Run a client handshake over `stream`.
    ///
    /// Only setup failures are returned as `Err`. A failed handshake still
    /// yields a [`TlsAttempt`] so the caller keeps the log and the stream.
    pub async fn handshake<S>(&self, stream: S, target: &ScanTarget) -> ScanResult<TlsAttempt<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = self.new_ssl(target)?;
        let server_name = self.server_name(target).map(str::to_string);
        let mut stream = SslStream::new(ssl, stream)?;

        let error = Pin::new(&mut stream).connect().await.err().map(ScanError::from);
        let log = TlsLog::from_ssl(stream.ssl(), server_name, error.as_ref());

        match &error {
            Some(e) => log::debug!("TLS handshake with {} failed: {}", target, e),
            None => log::debug!(
                "TLS handshake with {} complete: {} {}",
                target,
                log.version.as_deref().unwrap_or("?"),
                log.cipher_suite.as_deref().unwrap_or("?")
            ),
        }

        Ok(TlsAttempt { stream, log, error })
    }
}

/// Outcome of one handshake attempt
pub struct TlsAttempt<S> {
    pub stream: SslStream<S>,
    pub log: TlsLog,
    pub error: Option<ScanError>,
}

impl<S> TlsAttempt<S> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsLog {
    pub handshake_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher_suite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub certificates: Vec<CertificateInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TlsLog {
    pub fn from_ssl(ssl: &SslRef, server_name: Option<String>, error: Option<&ScanError>) -> Self {
        let mut certificates: Vec<CertificateInfo> = ssl
            .peer_cert_chain()
            .map(|chain| chain.iter().map(CertificateInfo::from_x509).collect())
            .unwrap_or_default();
        if certificates.is_empty() {
            if let Some(leaf) = ssl.peer_certificate() {
                certificates.push(CertificateInfo::from_x509(&leaf));
            }
        }

        let complete = error.is_none();
        Self {
            handshake_complete: complete,
            version: complete.then(|| ssl.version_str().to_string()),
            cipher_suite: ssl.current_cipher().map(|c| c.name().to_string()),
            server_name,
            certificates,
            error: error.map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: String,
    pub not_after: String,
    pub fingerprint_sha256: String,
}

impl CertificateInfo {
    pub fn from_x509(cert: &X509Ref) -> Self {
        Self {
            subject: format_name(cert.subject_name()),
            issuer: format_name(cert.issuer_name()),
            serial_number: cert
                .serial_number()
                .to_bn()
                .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
                .unwrap_or_default(),
            not_before: cert.not_before().to_string(),
            not_after: cert.not_after().to_string(),
            fingerprint_sha256: cert
                .digest(MessageDigest::sha256())
                .map(|d| hex_string(&d))
                .unwrap_or_default(),
        }
    }
}

fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}
