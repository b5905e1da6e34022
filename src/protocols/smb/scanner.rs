use super::negotiator::{Negotiator, SmbNegotiator};
use super::{SmbFailure, SmbLog};
use crate::config::{ProbeConfig, SmbConfig};
use crate::network::{DialerGroup, DialerGroupConfig, ScanContext, ScanTarget, Transport};
use crate::scanner::ScanOutcome;

/// SMB scanner. Generic over the negotiator so the retry policy can be
/// exercised without a real server.
#[derive(Debug, Clone)]
pub struct SmbScanner<N = SmbNegotiator> {
    config: SmbConfig,
    negotiator: N,
}

impl SmbScanner<SmbNegotiator> {
    pub fn new(config: SmbConfig) -> Self {
        Self::with_negotiator(config, SmbNegotiator)
    }

    pub fn dialer_group_config(config: &ProbeConfig) -> DialerGroupConfig {
        DialerGroupConfig {
            transport: Transport::Tcp,
            connect_timeout: config.connect_timeout_duration(),
            source_address: config.source_address,
            ..DialerGroupConfig::default()
        }
    }
}

impl<N: Negotiator> SmbScanner<N> {
    pub fn with_negotiator(config: SmbConfig, negotiator: N) -> Self {
        Self { config, negotiator }
    }

    pub fn negotiator(&self) -> &N {
        &self.negotiator
    }

    /// Negotiate with `target`. A first failure that produced no log at all
    /// gets exactly one more try on a fresh connection, with verbose forced on.
    pub async fn scan(
        &self,
        ctx: &ScanContext,
        dialers: &DialerGroup,
        target: &ScanTarget,
    ) -> ScanOutcome<SmbLog> {
        let setup_session = self.config.setup_session;

        let mut conn = match dialers.dial(ctx, target).await {
            Ok(conn) => conn,
            Err(e) => {
                return ScanOutcome::failure(
                    e.context(format!("could not establish connection to SMB server {}", target)),
                    None,
                )
            }
        };

        let first = self
            .negotiator
            .negotiate(&mut conn, setup_session, self.config.verbose)
            .await;
        conn.close().await;

        let error = match first {
            Ok(log) => return ScanOutcome::success(log),
            Err(SmbFailure {
                log: Some(log),
                error,
            }) => return ScanOutcome::failure(error.context(target.to_string()), Some(log)),
            Err(SmbFailure { log: None, error }) => error,
        };

        log::debug!("SMB negotiation with {} failed ({}); retrying once", target, error);

        let mut conn = match dialers.dial(ctx, target).await {
            Ok(conn) => conn,
            Err(e) => {
                return ScanOutcome::failure(
                    e.context(format!(
                        "could not establish connection to SMB server {} on 2nd attempt",
                        target
                    )),
                    None,
                )
            }
        };

        let second = self.negotiator.negotiate(&mut conn, setup_session, true).await;
        conn.close().await;

        match second {
            Ok(mut log) => {
                log.retried = true;
                ScanOutcome::success(log)
            }
            Err(SmbFailure { log, error }) => ScanOutcome::failure(
                error.context(target.to_string()),
                log.map(|mut log| {
                    log.retried = true;
                    log
                }),
            ),
        }
    }
}
