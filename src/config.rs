//! Configuration module for the deimos probe engine

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for probe operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Per-scan deadline in milliseconds, covering dial and handshake
    pub timeout: u64,

    /// Connect timeout in milliseconds for the transport dial
    pub connect_timeout: u64,

    /// Local address to bind outgoing connections to
    pub source_address: Option<IpAddr>,

    /// TLS settings passed through to the transport dialer
    pub tls: TlsConfig,

    pub telnet: TelnetConfig,
    pub smb: SmbConfig,
    pub mssql: MssqlConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: 10_000,
            connect_timeout: 5_000,
            source_address: None,
            tls: TlsConfig::default(),
            telnet: TelnetConfig::default(),
            smb: SmbConfig::default(),
            mssql: MssqlConfig::default(),
        }
    }
}

/// TLS options. Verification is off by default: a probe wants to log
/// whatever certificate the server presents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub verify_certificates: bool,
    /// SNI override; defaults to the target's domain name when it has one
    pub server_name: Option<String>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    /// PEM bundle used as trust roots when verification is on
    pub ca_file: Option<PathBuf>,
    /// OpenSSL cipher list string
    pub cipher_list: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "ssl3")]
    Ssl3,
    #[serde(rename = "tls1.0")]
    Tls10,
    #[serde(rename = "tls1.1")]
    Tls11,
    #[serde(rename = "tls1.2")]
    Tls12,
    #[serde(rename = "tls1.3")]
    Tls13,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    /// Ceiling on the number of banner bytes kept
    pub max_read_size: usize,
    /// Return the banner on error whenever it has non-zero bytes
    pub force_banner: bool,
    /// Milliseconds of silence, after the first byte, that end the banner (0 = wait for EOF)
    pub quiet_period: u64,
    pub verbose: bool,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            max_read_size: 65_536,
            force_banner: false,
            quiet_period: 1_500,
            verbose: false,
        }
    }
}

impl TelnetConfig {
    pub fn quiet_period_duration(&self) -> Option<Duration> {
        (self.quiet_period > 0).then(|| Duration::from_millis(self.quiet_period))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmbConfig {
    /// Continue with a session setup up to the point credentials would be needed
    pub setup_session: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MssqlConfig {
    /// Encryption mode requested in PRELOGIN: ENCRYPT_ON, ENCRYPT_OFF or ENCRYPT_NOT_SUP
    pub encrypt_mode: String,
    /// Include debug fields (raw PRELOGIN options) in results
    pub verbose: bool,
}

impl Default for MssqlConfig {
    fn default() -> Self {
        Self {
            encrypt_mode: "ENCRYPT_ON".to_string(),
            verbose: false,
        }
    }
}

impl ProbeConfig {
    /// Get the per-scan deadline as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn connect_timeout_duration(&self) -> Option<Duration> {
        (self.connect_timeout > 0).then(|| Duration::from_millis(self.connect_timeout))
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ScanError::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ScanResult<Self> {
        let config: ProbeConfig = toml::from_str(content)
            .map_err(|e| ScanError::Config(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from ~/.deimos.toml, falling back to defaults
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_path = home_dir.join(".deimos.toml");

        if config_path.exists() {
            match Self::from_toml_file(&config_path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", config_path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", config_path.display(), e),
            }
        }

        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ScanResult<()> {
        if self.timeout == 0 {
            return Err(ScanError::Config("timeout must be greater than 0".to_string()));
        }

        if self.telnet.max_read_size == 0 {
            return Err(ScanError::Config(
                "telnet.max_read_size must be greater than 0".to_string(),
            ));
        }

        if let (Some(min), Some(max)) = (self.tls.min_version, self.tls.max_version) {
            if min > max {
                return Err(ScanError::Config(format!(
                    "tls.min_version {:?} is above tls.max_version {:?}",
                    min, max
                )));
            }
        }

        self.mssql
            .encrypt_mode
            .parse::<crate::protocols::mssql::EncryptMode>()
            .map_err(|e| ScanError::Config(e.to_string()))?;

        Ok(())
    }
}
