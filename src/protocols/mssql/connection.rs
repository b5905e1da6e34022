//! TDS connection and the PRELOGIN handshake state machine

use super::prelogin::{EncryptMode, PreloginOptions};
use super::tds::{encode_message, read_tds_message, TdsPacketType, DEFAULT_PACKET_SIZE};
use super::tunnel::TdsTlsAdapter;
use crate::error::{ScanError, ScanResult};
use crate::network::{ScanTarget, TlsLog, TlsWrapper};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_openssl::SslStream;

enum Transport<S> {
    Raw(S),
    Tls(Box<SslStream<TdsTlsAdapter<S>>>),
    Closed,
}

/// A connection speaking TDS to an MSSQL server
pub struct TdsConnection<S> {
    transport: Transport<S>,
    packet_size: usize,
    packet_id: u8,
    read_valid_tds_packet: bool,
    prelogin_options: Option<PreloginOptions>,
    encrypt_mode: Option<EncryptMode>,
    tls_log: Option<TlsLog>,
    verbose: bool,
}

impl<S> TdsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            transport: Transport::Raw(stream),
            packet_size: DEFAULT_PACKET_SIZE,
            packet_id: 1,
            read_valid_tds_packet: false,
            prelogin_options: None,
            encrypt_mode: None,
            tls_log: None,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// At least one packet with a plausible TDS header was read
    pub fn read_valid_tds_packet(&self) -> bool {
        self.read_valid_tds_packet
    }

    pub fn prelogin_options(&self) -> Option<&PreloginOptions> {
        self.prelogin_options.as_ref()
    }

    /// The server's declared mode, once its PRELOGIN response was decoded
    pub fn encrypt_mode(&self) -> Option<EncryptMode> {
        self.encrypt_mode
    }

    pub fn tls_log(&self) -> Option<&TlsLog> {
        self.tls_log.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Send PRELOGIN, read the answer and run TLS through TDS when both
    /// sides allow it. Returns the server's encryption mode.
    pub async fn handshake(
        &mut self,
        requested: EncryptMode,
        tls: Option<&TlsWrapper>,
        target: &ScanTarget,
    ) -> ScanResult<EncryptMode> {
        self.send_prelogin(requested).await?;
        let options = self.read_prelogin().await?;

        let server_mode = options.encrypt_mode().ok_or_else(|| {
            ScanError::protocol("PRELOGIN response has no ENCRYPTION option")
        })?;
        self.encrypt_mode = Some(server_mode);
        self.prelogin_options = Some(options);

        if self.verbose {
            log::debug!(
                "{}: client requested {}, server declared {}",
                target,
                requested,
                server_mode
            );
        }

        if server_mode == EncryptMode::NotSupported {
            if requested.wants_encryption() {
                return Err(ScanError::NoServerEncryption);
            }
            return Ok(server_mode);
        }

        if requested == EncryptMode::NotSupported {
            if server_mode.requires_encryption() {
                return Err(ScanError::ServerRequiresEncryption { cause: None });
            }
            return Ok(server_mode);
        }

        let tls = tls.ok_or_else(|| {
            ScanError::InvalidInput("a TLS wrapper is required to encrypt the MSSQL session".to_string())
        })?;
        self.start_tls(tls, server_mode, target).await?;
        Ok(server_mode)
    }

    async fn send_prelogin(&mut self, mode: EncryptMode) -> ScanResult<()> {
        let payload = PreloginOptions::client_request(mode).encode();
        let wire = encode_message(TdsPacketType::Prelogin, &payload, self.packet_size, &mut self.packet_id);
        let stream = self.raw_mut()?;
        stream.write_all(&wire).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_prelogin(&mut self) -> ScanResult<PreloginOptions> {
        let mut saw_valid = self.read_valid_tds_packet;
        let result = match &mut self.transport {
            Transport::Raw(stream) => {
                read_tds_message(stream, &[TdsPacketType::TabularResult], &mut saw_valid).await
            }
            _ => Err(ScanError::protocol("PRELOGIN must run before TLS")),
        };
        self.read_valid_tds_packet = saw_valid;

        PreloginOptions::decode(&result?)
    }

    async fn start_tls(
        &mut self,
        tls: &TlsWrapper,
        server_mode: EncryptMode,
        target: &ScanTarget,
    ) -> ScanResult<()> {
        let raw = match std::mem::replace(&mut self.transport, Transport::Closed) {
            Transport::Raw(stream) => stream,
            other => {
                self.transport = other;
                return Err(ScanError::protocol("TLS already negotiated"));
            }
        };

        let adapter = TdsTlsAdapter::new(raw, self.packet_size, self.packet_id);
        let mut attempt = tls.handshake(adapter, target).await?;
        self.read_valid_tds_packet |= attempt.stream.get_ref().saw_valid_header();
        self.packet_id = attempt.stream.get_ref().packet_id();
        self.tls_log = Some(attempt.log);

        match attempt.error {
            None => {
                attempt.stream.get_mut().finish_handshake();
                self.transport = Transport::Tls(Box::new(attempt.stream));
                Ok(())
            }
            Some(err) => {
                self.transport = Transport::Tls(Box::new(attempt.stream));
                if server_mode.requires_encryption() {
                    Err(ScanError::ServerRequiresEncryption {
                        cause: Some(Box::new(err)),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_decoded_options(mut self, options: PreloginOptions) -> Self {
        self.encrypt_mode = options.encrypt_mode();
        self.prelogin_options = Some(options);
        self
    }

    fn raw_mut(&mut self) -> ScanResult<&mut S> {
        match &mut self.transport {
            Transport::Raw(stream) => Ok(stream),
            _ => Err(ScanError::protocol("TDS connection is not in plaintext mode")),
        }
    }

    /// Shut the connection down. Errors are logged, not returned.
    pub async fn close(mut self, target: &ScanTarget) {
        let result = match &mut self.transport {
            Transport::Raw(stream) => stream.shutdown().await,
            Transport::Tls(stream) => stream.shutdown().await,
            Transport::Closed => Ok(()),
        };
        if let Err(e) = result {
            log::debug!("error closing connection to target {}: {}", target, e);
        }
        self.transport = Transport::Closed;
    }
}
