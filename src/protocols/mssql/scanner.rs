use super::connection::TdsConnection;
use super::prelogin::{EncryptMode, PreloginOptions};
use crate::config::{MssqlConfig, ProbeConfig};
use crate::error::ScanError;
use crate::network::{DialerGroup, DialerGroupConfig, ScanContext, ScanTarget, TlsLog, Transport};
use crate::scanner::status::ScanStatus;
use crate::scanner::ScanOutcome;
use serde::Serialize;

/// What the server revealed during PRELOGIN and the TLS handshake
#[derive(Debug, Clone, Default, Serialize)]
pub struct MssqlResults {
    /// "major.minor.build.sub_build" from the VERSION option
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// `None` when the server sent no INSTOPT, `Some("")` when it sent an empty one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,

    /// Raw option table; verbose scans only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prelogin_options: Option<PreloginOptions>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypt_mode: Option<EncryptMode>,

    #[serde(rename = "tls", skip_serializing_if = "Option::is_none")]
    pub tls_log: Option<TlsLog>,
}

impl MssqlResults {
    fn from_connection<S>(conn: &TdsConnection<S>, verbose: bool) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut result = MssqlResults {
            encrypt_mode: conn.encrypt_mode(),
            tls_log: conn.tls_log().cloned(),
            ..MssqlResults::default()
        };

        if let Some(options) = conn.prelogin_options() {
            result.version = options.version().map(|v| v.to_string());
            result.instance_name = options.instance().map(|name| {
                String::from_utf8_lossy(name)
                    .trim_matches(|c| c == '\0' || c == '\r' || c == '\n')
                    .to_string()
            });
            if verbose {
                result.prelogin_options = Some(options.clone());
            }
        }

        result
    }
}

#[derive(Debug, Clone)]
pub struct MssqlScanner {
    config: MssqlConfig,
}

impl MssqlScanner {
    pub fn new(config: MssqlConfig) -> Self {
        Self { config }
    }

    /// TDS framing needs the raw TCP dialer; TLS is layered on by the handshake
    pub fn dialer_group_config(config: &ProbeConfig) -> DialerGroupConfig {
        DialerGroupConfig {
            transport: Transport::Tcp,
            need_separate_l4_dialer: true,
            tls_enabled: true,
            tls: config.tls.clone(),
            connect_timeout: config.connect_timeout_duration(),
            source_address: config.source_address,
        }
    }

    pub async fn scan(
        &self,
        ctx: &ScanContext,
        dialers: &DialerGroup,
        target: &ScanTarget,
    ) -> ScanOutcome<MssqlResults> {
        let Some(l4_dialer) = dialers.l4_dialer() else {
            return ScanOutcome::new(
                ScanStatus::InvalidInputs,
                None,
                Some(ScanError::InvalidInput("l4 dialer is required for mssql".to_string())),
            );
        };

        let requested: EncryptMode = match self.config.encrypt_mode.parse() {
            Ok(mode) => mode,
            Err(e) => return ScanOutcome::failure(e, None),
        };

        let stream = match l4_dialer.dial(ctx, target).await {
            Ok(stream) => stream,
            Err(e) => {
                return ScanOutcome::failure(e.context(format!("error dialing target {}", target)), None)
            }
        };

        let mut sql = TdsConnection::new(stream).with_verbose(self.config.verbose);
        let handshake = sql.handshake(requested, dialers.tls_wrapper(), target).await;

        let result = MssqlResults::from_connection(&sql, self.config.verbose);
        // No options and no plausible header: nothing on the port speaks TDS
        let spoke_tds = sql.prelogin_options().is_some() || sql.read_valid_tds_packet();
        sql.close(target).await;

        match handshake {
            Ok(mode) => {
                log::debug!("{}: MSSQL handshake complete ({})", target, mode);
                ScanOutcome::success(result)
            }
            Err(e) => ScanOutcome::failure(e.context(target.to_string()), spoke_tds.then_some(result)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::mssql::prelogin::{PRELOGIN_ENCRYPTION, PRELOGIN_INSTOPT, PRELOGIN_VERSION};

    #[test]
    fn test_dialer_config_requests_l4_and_tls() {
        let config = MssqlScanner::dialer_group_config(&ProbeConfig::default());
        assert!(config.need_separate_l4_dialer);
        assert!(config.tls_enabled);
    }

    #[test]
    fn test_results_skip_absent_fields() {
        let json = serde_json::to_value(MssqlResults::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_instance_name_absent_versus_empty() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = TdsConnection::new(client);
        assert!(MssqlResults::from_connection(&conn, false).instance_name.is_none());

        let mut options = PreloginOptions::new();
        options.insert(PRELOGIN_VERSION, vec![12, 0, 0x07, 0xD0, 0, 0]);
        options.insert(PRELOGIN_ENCRYPTION, vec![0x02]);
        options.insert(PRELOGIN_INSTOPT, b"\0".to_vec());
        conn = conn.with_decoded_options(options);

        let result = MssqlResults::from_connection(&conn, true);
        assert_eq!(result.instance_name.as_deref(), Some(""));
        assert_eq!(result.version.as_deref(), Some("12.0.2000.0"));
        assert!(result.prelogin_options.is_some());
    }
}
