//! Telnet banner grab with option negotiation
//!
//! The server's byte stream is a mix of banner text and IAC command
//! sequences. Banner bytes are collected up to a ceiling; every option the
//! server offers (WILL) or asks for (DO) is refused, so the session never
//! enters a mode the probe cannot follow.

use crate::config::{ProbeConfig, TelnetConfig};
use crate::error::{ScanError, ScanResult};
use crate::network::{DialerGroup, DialerGroupConfig, ScanContext, ScanTarget, Transport};
use crate::scanner::ScanOutcome;
use serde::{Serialize, Serializer};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

const READ_CHUNK_SIZE: usize = 4096;

/// Well-known option names (RFC 855 and friends)
pub fn option_name(code: u8) -> &'static str {
    match code {
        0 => "BINARY",
        1 => "ECHO",
        3 => "SUPPRESS_GO_AHEAD",
        5 => "STATUS",
        6 => "TIMING_MARK",
        24 => "TERMINAL_TYPE",
        31 => "WINDOW_SIZE",
        32 => "TERMINAL_SPEED",
        33 => "REMOTE_FLOW_CONTROL",
        34 => "LINEMODE",
        35 => "X_DISPLAY_LOCATION",
        36 => "ENVIRONMENT",
        37 => "AUTHENTICATION",
        38 => "ENCRYPT",
        39 => "NEW_ENVIRONMENT",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TelnetCommand {
    Will,
    Wont,
    Do,
    Dont,
}

impl TelnetCommand {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            WILL => Some(TelnetCommand::Will),
            WONT => Some(TelnetCommand::Wont),
            DO => Some(TelnetCommand::Do),
            DONT => Some(TelnetCommand::Dont),
            _ => None,
        }
    }

    /// Our answer: refuse whatever was offered or requested
    fn reply(self) -> Option<u8> {
        match self {
            TelnetCommand::Will => Some(DONT),
            TelnetCommand::Do => Some(WONT),
            TelnetCommand::Wont | TelnetCommand::Dont => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionOutcome {
    Refused,
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelnetOption {
    pub code: u8,
    pub name: String,
    pub command: TelnetCommand,
    pub outcome: OptionOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelnetLog {
    #[serde(serialize_with = "serialize_banner")]
    pub banner: Vec<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<TelnetOption>,
}

fn serialize_banner<S: Serializer>(banner: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(banner))
}

impl TelnetLog {
    pub fn banner_text(&self) -> String {
        String::from_utf8_lossy(&self.banner).into_owned()
    }

    /// True once the peer sent at least one option negotiation
    pub fn is_telnet(&self) -> bool {
        !self.options.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BannerOptions {
    pub max_read_size: usize,
    /// Silence after the first byte that ends the read
    pub quiet_period: Option<Duration>,
    pub verbose: bool,
}

impl From<&TelnetConfig> for BannerOptions {
    fn from(config: &TelnetConfig) -> Self {
        Self {
            max_read_size: config.max_read_size,
            quiet_period: config.quiet_period_duration(),
            verbose: config.verbose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ParseState {
    #[default]
    Data,
    Iac,
    Negotiate(TelnetCommand),
    Subnegotiation,
    SubnegotiationIac,
}

/// Incremental IAC parser; state carries over between reads
#[derive(Debug, Default)]
struct TelnetParser {
    state: ParseState,
}

impl TelnetParser {
    /// Consume one chunk. Replies are appended to `replies`.
    /// Returns true once the banner has reached `max_read_size`.
    fn feed(
        &mut self,
        chunk: &[u8],
        log: &mut TelnetLog,
        max_read_size: usize,
        replies: &mut Vec<u8>,
        verbose: bool,
    ) -> bool {
        for &byte in chunk {
            if log.banner.len() >= max_read_size {
                return true;
            }

            self.state = match self.state {
                ParseState::Data if byte == IAC => ParseState::Iac,
                ParseState::Data => {
                    log.banner.push(byte);
                    ParseState::Data
                }
                ParseState::Iac => match byte {
                    IAC => {
                        log.banner.push(IAC);
                        ParseState::Data
                    }
                    SB => ParseState::Subnegotiation,
                    other => match TelnetCommand::from_byte(other) {
                        Some(command) => ParseState::Negotiate(command),
                        // NOP, GA and the other two-byte commands
                        None => ParseState::Data,
                    },
                },
                ParseState::Negotiate(command) => {
                    let outcome = match command.reply() {
                        Some(answer) => {
                            replies.extend_from_slice(&[IAC, answer, byte]);
                            OptionOutcome::Refused
                        }
                        None => OptionOutcome::Acknowledged,
                    };
                    if verbose {
                        log::debug!("telnet option {} ({:?}) -> {:?}", option_name(byte), command, outcome);
                    }
                    log.options.push(TelnetOption {
                        code: byte,
                        name: option_name(byte).to_string(),
                        command,
                        outcome,
                    });
                    ParseState::Data
                }
                ParseState::Subnegotiation if byte == IAC => ParseState::SubnegotiationIac,
                ParseState::Subnegotiation => ParseState::Subnegotiation,
                ParseState::SubnegotiationIac if byte == SE => ParseState::Data,
                ParseState::SubnegotiationIac => ParseState::Subnegotiation,
            };
        }

        log.banner.len() >= max_read_size
    }

    fn finish(&self) -> ScanResult<()> {
        match self.state {
            ParseState::Data => Ok(()),
            _ => Err(ScanError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a telnet command sequence",
            ))),
        }
    }
}

/// Read the banner into `log`, answering option negotiations as they arrive.
///
/// `log` is filled incrementally, so whatever was read before an error is
/// still there when this returns `Err`.
pub async fn get_banner<S>(log: &mut TelnetLog, conn: &mut S, options: &BannerOptions) -> ScanResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut parser = TelnetParser::default();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut replies = Vec::new();
    let mut received_any = false;

    loop {
        let n = match options.quiet_period.filter(|_| received_any) {
            Some(quiet) => match tokio::time::timeout(quiet, conn.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    log::debug!("telnet peer went quiet after {} banner bytes", log.banner.len());
                    break;
                }
            },
            None => conn.read(&mut buf).await?,
        };

        if n == 0 {
            parser.finish()?;
            if log.banner.is_empty() && !log.is_telnet() {
                return Err(ScanError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before any banner was sent",
                )));
            }
            break;
        }
        received_any = true;

        let full = parser.feed(&buf[..n], log, options.max_read_size, &mut replies, options.verbose);
        if !replies.is_empty() {
            conn.write_all(&replies).await?;
            conn.flush().await?;
            replies.clear();
        }
        if full {
            break;
        }
    }

    Ok(())
}

/// Connects to a Telnet service (default port 23) and grabs its banner
#[derive(Debug, Clone)]
pub struct TelnetScanner {
    config: TelnetConfig,
}

impl TelnetScanner {
    pub fn new(config: TelnetConfig) -> Self {
        Self { config }
    }

    pub fn dialer_group_config(config: &ProbeConfig) -> DialerGroupConfig {
        DialerGroupConfig {
            transport: Transport::Tcp,
            connect_timeout: config.connect_timeout_duration(),
            source_address: config.source_address,
            ..DialerGroupConfig::default()
        }
    }

    pub async fn scan(
        &self,
        ctx: &ScanContext,
        dialers: &DialerGroup,
        target: &ScanTarget,
    ) -> ScanOutcome<TelnetLog> {
        let mut conn = match dialers.dial(ctx, target).await {
            Ok(conn) => conn,
            Err(e) => {
                return ScanOutcome::failure(
                    e.context(format!("could not establish connection to telnet server {}", target)),
                    None,
                )
            }
        };

        let mut log = TelnetLog::default();
        let result = get_banner(&mut log, &mut conn, &BannerOptions::from(&self.config)).await;
        conn.close().await;

        match result {
            Ok(()) => ScanOutcome::success(log),
            Err(e) => {
                let keep = (self.config.force_banner && !log.banner.is_empty()) || log.is_telnet();
                ScanOutcome::failure(e.context(target.to_string()), keep.then_some(log))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(input: &[u8], max: usize) -> (TelnetLog, Vec<u8>, bool) {
        let mut parser = TelnetParser::default();
        let mut log = TelnetLog::default();
        let mut replies = Vec::new();
        let full = parser.feed(input, &mut log, max, &mut replies, false);
        (log, replies, full)
    }

    #[test]
    fn test_do_is_refused_with_wont() {
        let (log, replies, _) = feed_all(&[IAC, DO, 24, b'o', b'k'], 100);
        assert_eq!(replies, vec![IAC, WONT, 24]);
        assert_eq!(log.banner, b"ok");
        assert_eq!(log.options[0].name, "TERMINAL_TYPE");
        assert_eq!(log.options[0].command, TelnetCommand::Do);
        assert_eq!(log.options[0].outcome, OptionOutcome::Refused);
    }

    #[test]
    fn test_wont_and_dont_need_no_reply() {
        let (log, replies, _) = feed_all(&[IAC, WONT, 1, IAC, DONT, 3], 100);
        assert!(replies.is_empty());
        assert_eq!(log.options.len(), 2);
        assert!(log
            .options
            .iter()
            .all(|o| o.outcome == OptionOutcome::Acknowledged));
    }

    #[test]
    fn test_escaped_iac_is_banner_byte() {
        let (log, replies, _) = feed_all(&[b'a', IAC, IAC, b'b'], 100);
        assert_eq!(log.banner, vec![b'a', 0xFF, b'b']);
        assert!(replies.is_empty());
        assert!(!log.is_telnet());
    }

    #[test]
    fn test_subnegotiation_is_skipped() {
        let input = [IAC, SB, 24, 1, IAC, IAC, IAC, SE, b'h', b'i'];
        let (log, _, _) = feed_all(&input, 100);
        assert_eq!(log.banner, b"hi");
        assert!(log.options.is_empty());
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let mut parser = TelnetParser::default();
        let mut log = TelnetLog::default();
        let mut replies = Vec::new();
        parser.feed(&[b'x', IAC], &mut log, 100, &mut replies, false);
        assert!(parser.finish().is_err());
        parser.feed(&[WILL], &mut log, 100, &mut replies, false);
        parser.feed(&[1, b'y'], &mut log, 100, &mut replies, false);
        assert!(parser.finish().is_ok());
        assert_eq!(log.banner, b"xy");
        assert_eq!(replies, vec![IAC, DONT, 1]);
    }

    #[test]
    fn test_ceiling_stops_parsing() {
        let (log, _, full) = feed_all(b"abcdefgh", 3);
        assert!(full);
        assert_eq!(log.banner, b"abc");
    }

    #[test]
    fn test_log_serializes_banner_as_text() {
        let log = TelnetLog {
            banner: b"login: ".to_vec(),
            options: vec![],
        };
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["banner"], "login: ");
        assert!(json.get("options").is_none());
    }
}
