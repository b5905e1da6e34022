use super::ntlm::{self, NtlmChallenge};
use super::wire::{
    self, NegotiateResponse, SessionSetupResponse, Smb2Header, COMMAND_NEGOTIATE,
    COMMAND_SESSION_SETUP, SMB1_PROTOCOL_ID, STATUS_MORE_PROCESSING_REQUIRED, STATUS_SUCCESS,
};
use super::{
    filetime_to_utc, HeaderLog, NegotiationLog, SessionSetupLog, SmbCapabilities, SmbFailure,
    SmbLog, SmbVersions,
};
use crate::error::{ScanError, ScanResult};
use crate::network::hex_string;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// One SMB negotiation over an already connected stream.
///
/// `Err` carries `log: None` when the server never produced a usable
/// NEGOTIATE response, and the partial log otherwise. The scanner's retry
/// policy depends on that distinction.
#[async_trait::async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate<S>(
        &self,
        conn: &mut S,
        setup_session: bool,
        verbose: bool,
    ) -> Result<SmbLog, SmbFailure>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send;
}

/// The real SMB2 negotiator
#[derive(Debug, Clone, Copy, Default)]
pub struct SmbNegotiator;

#[async_trait::async_trait]
impl Negotiator for SmbNegotiator {
    async fn negotiate<S>(
        &self,
        conn: &mut S,
        setup_session: bool,
        verbose: bool,
    ) -> Result<SmbLog, SmbFailure>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut log = negotiate_protocol(conn, verbose).await?;
        if log.smbv1_support || !setup_session {
            return Ok(log);
        }

        match session_setup(conn, &mut log, verbose).await {
            Ok(()) => Ok(log),
            Err(error) => Err(SmbFailure {
                log: Some(log),
                error,
            }),
        }
    }
}

async fn negotiate_protocol<S>(conn: &mut S, verbose: bool) -> ScanResult<SmbLog>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::write_message(conn, &wire::negotiate_request(Uuid::new_v4())).await?;
    let response = wire::read_message(conn).await?;

    let mut log = SmbLog {
        verbose,
        ..SmbLog::default()
    };

    if response.starts_with(&SMB1_PROTOCOL_ID) {
        if verbose {
            log::debug!("SMB server answered with an SMBv1 header");
        }
        log.smbv1_support = true;
        return Ok(log);
    }

    let header = Smb2Header::decode(&response)?;
    if header.command != COMMAND_NEGOTIATE {
        return Err(ScanError::protocol(format!(
            "expected NEGOTIATE response, got command 0x{:04x}",
            header.command
        )));
    }
    if header.status != STATUS_SUCCESS {
        return Err(ScanError::protocol(format!(
            "SMB NEGOTIATE failed with status 0x{:08x}",
            header.status
        )));
    }

    let negotiate = NegotiateResponse::decode(&response)?;
    if verbose {
        log::debug!(
            "SMB NEGOTIATE: dialect 0x{:04x}, security mode 0x{:04x}, security blob {}",
            negotiate.dialect_revision,
            negotiate.security_mode,
            hex_string(&negotiate.security_blob)
        );
    }

    log.smb_version = Some(SmbVersions::from_dialect(negotiate.dialect_revision));
    log.smb_capabilities = Some(SmbCapabilities::from_flags(negotiate.capabilities));
    log.negotiation_log = Some(NegotiationLog {
        header_log: verbose.then(|| HeaderLog::from(&header)),
        security_mode: negotiate.security_mode,
        dialect_revision: negotiate.dialect_revision,
        server_guid: negotiate.server_guid.to_string(),
        capabilities: negotiate.capabilities,
        max_transact_size: negotiate.max_transact_size,
        max_read_size: negotiate.max_read_size,
        max_write_size: negotiate.max_write_size,
        system_time: filetime_to_utc(negotiate.system_time),
        server_start_time: filetime_to_utc(negotiate.server_start_time),
        authentication_types: ntlm::auth_mechanisms(&negotiate.security_blob),
    });

    Ok(log)
}

async fn session_setup<S>(conn: &mut S, log: &mut SmbLog, verbose: bool) -> ScanResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = wire::session_setup_request(1, &ntlm::spnego_negotiate_token());
    wire::write_message(conn, &request).await?;
    let response = wire::read_message(conn).await?;

    let header = Smb2Header::decode(&response)?;
    let mut setup_log = SessionSetupLog {
        header_log: verbose.then(|| HeaderLog::from(&header)),
        ..SessionSetupLog::default()
    };

    if header.command != COMMAND_SESSION_SETUP
        || !matches!(header.status, STATUS_SUCCESS | STATUS_MORE_PROCESSING_REQUIRED)
    {
        let status = header.status;
        log.session_setup_log = Some(setup_log);
        return Err(ScanError::protocol(format!(
            "SMB SESSION_SETUP failed with status 0x{:08x}",
            status
        )));
    }

    let setup = SessionSetupResponse::decode(&response)?;
    setup_log.setup_flags = setup.session_flags;

    match ntlm::find_ntlmssp(&setup.security_blob) {
        Some(message) => {
            let challenge = NtlmChallenge::parse(message)?;
            if verbose {
                log::debug!("NTLMSSP challenge {}", hex_string(&challenge.server_challenge));
            }
            setup_log.apply_challenge(challenge);
        }
        None => log::debug!("SESSION_SETUP response carried no NTLMSSP message"),
    }

    log.session_setup_log = Some(setup_log);
    Ok(())
}
