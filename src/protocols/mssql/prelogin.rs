//! PRELOGIN option table and the values carried in it

use crate::error::{ScanError, ScanResult};
use crate::network::hex_string;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const PRELOGIN_VERSION: u8 = 0x00;
pub const PRELOGIN_ENCRYPTION: u8 = 0x01;
pub const PRELOGIN_INSTOPT: u8 = 0x02;
pub const PRELOGIN_THREADID: u8 = 0x03;
pub const PRELOGIN_MARS: u8 = 0x04;
pub const PRELOGIN_TRACEID: u8 = 0x05;
pub const PRELOGIN_FEDAUTHREQUIRED: u8 = 0x06;
pub const PRELOGIN_NONCEOPT: u8 = 0x07;
pub const PRELOGIN_TERMINATOR: u8 = 0xFF;

const OPTION_ENTRY_SIZE: usize = 5;

/// Version we announce as a client: all zeros, no real driver behind it
const CLIENT_VERSION: [u8; 6] = [0, 0, 0, 0, 0, 0];

pub fn token_name(token: u8) -> String {
    match token {
        PRELOGIN_VERSION => "VERSION".to_string(),
        PRELOGIN_ENCRYPTION => "ENCRYPTION".to_string(),
        PRELOGIN_INSTOPT => "INSTOPT".to_string(),
        PRELOGIN_THREADID => "THREADID".to_string(),
        PRELOGIN_MARS => "MARS".to_string(),
        PRELOGIN_TRACEID => "TRACEID".to_string(),
        PRELOGIN_FEDAUTHREQUIRED => "FEDAUTHREQUIRED".to_string(),
        PRELOGIN_NONCEOPT => "NONCEOPT".to_string(),
        other => format!("UNKNOWN_0x{:02x}", other),
    }
}

/// ENCRYPTION option value, as requested by the client or declared by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptMode {
    Off,
    On,
    NotSupported,
    Required,
    ClientCertOff,
    ClientCertOn,
    ClientCertRequired,
    Unknown(u8),
}

impl EncryptMode {
    pub fn as_byte(self) -> u8 {
        match self {
            EncryptMode::Off => 0x00,
            EncryptMode::On => 0x01,
            EncryptMode::NotSupported => 0x02,
            EncryptMode::Required => 0x03,
            EncryptMode::ClientCertOff => 0x80,
            EncryptMode::ClientCertOn => 0x81,
            EncryptMode::ClientCertRequired => 0x83,
            EncryptMode::Unknown(b) => b,
        }
    }

    pub fn name(self) -> String {
        match self {
            EncryptMode::Off => "ENCRYPT_OFF".to_string(),
            EncryptMode::On => "ENCRYPT_ON".to_string(),
            EncryptMode::NotSupported => "ENCRYPT_NOT_SUP".to_string(),
            EncryptMode::Required => "ENCRYPT_REQ".to_string(),
            EncryptMode::ClientCertOff => "ENCRYPT_CLIENT_CERT_OFF".to_string(),
            EncryptMode::ClientCertOn => "ENCRYPT_CLIENT_CERT_ON".to_string(),
            EncryptMode::ClientCertRequired => "ENCRYPT_CLIENT_CERT_REQ".to_string(),
            EncryptMode::Unknown(b) => format!("UNKNOWN(0x{:02x})", b),
        }
    }

    /// The side using this mode insists on an encrypted session
    pub fn requires_encryption(self) -> bool {
        matches!(self, EncryptMode::Required | EncryptMode::ClientCertRequired)
    }

    /// The side using this mode wants encryption (on or required)
    pub fn wants_encryption(self) -> bool {
        matches!(
            self,
            EncryptMode::On
                | EncryptMode::Required
                | EncryptMode::ClientCertOn
                | EncryptMode::ClientCertRequired
        )
    }
}

impl From<u8> for EncryptMode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => EncryptMode::Off,
            0x01 => EncryptMode::On,
            0x02 => EncryptMode::NotSupported,
            0x03 => EncryptMode::Required,
            0x80 => EncryptMode::ClientCertOff,
            0x81 => EncryptMode::ClientCertOn,
            0x83 => EncryptMode::ClientCertRequired,
            other => EncryptMode::Unknown(other),
        }
    }
}

impl FromStr for EncryptMode {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENCRYPT_ON" | "ON" => Ok(EncryptMode::On),
            "ENCRYPT_OFF" | "OFF" => Ok(EncryptMode::Off),
            "ENCRYPT_NOT_SUP" | "NOT_SUPPORTED" => Ok(EncryptMode::NotSupported),
            "ENCRYPT_REQ" | "REQUIRED" => Ok(EncryptMode::Required),
            _ => Err(ScanError::InvalidInput(format!(
                "unknown encrypt mode '{}' (expected ENCRYPT_ON, ENCRYPT_OFF, ENCRYPT_NOT_SUP or ENCRYPT_REQ)",
                s
            ))),
        }
    }
}

impl fmt::Display for EncryptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for EncryptMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// Server version from the VERSION option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub sub_build: u16,
}

impl ServerVersion {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        Some(Self {
            major: bytes[0],
            minor: bytes[1],
            build: u16::from_be_bytes([bytes[2], bytes[3]]),
            sub_build: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }

    pub fn to_bytes(self) -> [u8; 6] {
        let build = self.build.to_be_bytes();
        let sub_build = self.sub_build.to_be_bytes();
        [self.major, self.minor, build[0], build[1], sub_build[0], sub_build[1]]
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.sub_build)
    }
}

/// Token to raw value. Kept sorted so encoding is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloginOptions(BTreeMap<u8, Vec<u8>>);

impl PreloginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The options a scanning client sends
    pub fn client_request(mode: EncryptMode) -> Self {
        let mut options = Self::new();
        options.insert(PRELOGIN_VERSION, CLIENT_VERSION.to_vec());
        options.insert(PRELOGIN_ENCRYPTION, vec![mode.as_byte()]);
        options.insert(PRELOGIN_INSTOPT, vec![0]);
        options.insert(PRELOGIN_THREADID, vec![0; 4]);
        options.insert(PRELOGIN_MARS, vec![0]);
        options
    }

    /// Set an option. The terminator token cannot be stored.
    pub fn insert(&mut self, token: u8, value: Vec<u8>) -> Option<Vec<u8>> {
        if token == PRELOGIN_TERMINATOR {
            return None;
        }
        self.0.insert(token, value)
    }

    pub fn get(&self, token: u8) -> Option<&[u8]> {
        self.0.get(&token).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.0.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn version(&self) -> Option<ServerVersion> {
        self.get(PRELOGIN_VERSION).and_then(ServerVersion::from_bytes)
    }

    pub fn encrypt_mode(&self) -> Option<EncryptMode> {
        self.get(PRELOGIN_ENCRYPTION)
            .and_then(|v| v.first().copied())
            .map(EncryptMode::from)
    }

    pub fn instance(&self) -> Option<&[u8]> {
        self.get(PRELOGIN_INSTOPT)
    }

    /// Table of contents in ascending token order, then the data in the same order
    pub fn encode(&self) -> Vec<u8> {
        let toc_len = self.0.len() * OPTION_ENTRY_SIZE + 1;
        let data_len: usize = self.0.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(toc_len + data_len);
        let mut data = Vec::with_capacity(data_len);

        for (token, value) in &self.0 {
            let offset = (toc_len + data.len()) as u16;
            out.push(*token);
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            data.extend_from_slice(value);
        }
        out.push(PRELOGIN_TERMINATOR);
        out.extend_from_slice(&data);
        out
    }

    pub fn decode(payload: &[u8]) -> ScanResult<Self> {
        let mut options = BTreeMap::new();
        let mut pos = 0;

        loop {
            let token = *payload.get(pos).ok_or_else(|| {
                ScanError::protocol("PRELOGIN option table is missing its terminator")
            })?;
            if token == PRELOGIN_TERMINATOR {
                break;
            }

            let entry = payload.get(pos..pos + OPTION_ENTRY_SIZE).ok_or_else(|| {
                ScanError::protocol(format!("truncated PRELOGIN entry for {}", token_name(token)))
            })?;
            let offset = usize::from(u16::from_be_bytes([entry[1], entry[2]]));
            let length = usize::from(u16::from_be_bytes([entry[3], entry[4]]));

            let value = offset
                .checked_add(length)
                .and_then(|end| payload.get(offset..end))
                .ok_or_else(|| {
                    ScanError::protocol(format!(
                        "PRELOGIN option {} points outside the payload ({}+{} > {})",
                        token_name(token),
                        offset,
                        length,
                        payload.len()
                    ))
                })?;

            if options.insert(token, value.to_vec()).is_some() {
                return Err(ScanError::protocol(format!(
                    "duplicate PRELOGIN option {}",
                    token_name(token)
                )));
            }
            pos += OPTION_ENTRY_SIZE;
        }

        Ok(Self(options))
    }
}

impl Serialize for PreloginOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (token, value) in &self.0 {
            map.serialize_entry(&token_name(*token), &hex_string(value))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_response() -> PreloginOptions {
        let mut options = PreloginOptions::new();
        options.insert(PRELOGIN_VERSION, vec![0x0C, 0x00, 0x07, 0xD0, 0x00, 0x00]);
        options.insert(PRELOGIN_ENCRYPTION, vec![0x01]);
        options.insert(PRELOGIN_INSTOPT, b"SQLEXPRESS\0".to_vec());
        options.insert(PRELOGIN_THREADID, vec![]);
        options.insert(PRELOGIN_MARS, vec![0]);
        options
    }

    #[test]
    fn test_client_request_layout() {
        let bytes = PreloginOptions::client_request(EncryptMode::On).encode();
        // 5 entries, terminator at 25, data starts at 26
        assert_eq!(&bytes[..5], &[PRELOGIN_VERSION, 0x00, 26, 0x00, 6]);
        assert_eq!(&bytes[5..10], &[PRELOGIN_ENCRYPTION, 0x00, 32, 0x00, 1]);
        assert_eq!(bytes[25], PRELOGIN_TERMINATOR);
        assert_eq!(bytes[32], 0x01);
        assert_eq!(bytes.len(), 26 + 6 + 1 + 1 + 4 + 1);
    }

    #[test]
    fn test_decode_server_fields() {
        let decoded = PreloginOptions::decode(&server_response().encode()).unwrap();
        assert_eq!(decoded.version().unwrap().to_string(), "12.0.2000.0");
        assert_eq!(decoded.encrypt_mode(), Some(EncryptMode::On));
        assert_eq!(decoded.instance(), Some(&b"SQLEXPRESS\0"[..]));
        assert_eq!(decoded.get(PRELOGIN_THREADID), Some(&[][..]));
    }

    #[test]
    fn test_decode_rejects_missing_terminator() {
        let mut bytes = server_response().encode();
        let toc_end = 5 * 5;
        bytes.truncate(toc_end);
        assert!(matches!(PreloginOptions::decode(&bytes), Err(ScanError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_out_of_bounds_option() {
        let bytes = [PRELOGIN_VERSION, 0x00, 0x06, 0x00, 0x10, PRELOGIN_TERMINATOR, 1, 2];
        assert!(PreloginOptions::decode(&bytes).is_err());

        let bytes = [PRELOGIN_VERSION, 0xFF, 0xFF, 0xFF, 0xFF, PRELOGIN_TERMINATOR];
        let err = PreloginOptions::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("points outside the payload"));
    }

    #[test]
    fn test_decode_rejects_duplicate_tokens() {
        let bytes = [
            PRELOGIN_ENCRYPTION, 0x00, 0x0B, 0x00, 0x01,
            PRELOGIN_ENCRYPTION, 0x00, 0x0B, 0x00, 0x01,
            PRELOGIN_TERMINATOR,
            0x02,
        ];
        let err = PreloginOptions::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_encrypt_mode_parsing() {
        assert_eq!("encrypt_on".parse::<EncryptMode>().unwrap(), EncryptMode::On);
        assert_eq!("NOT_SUPPORTED".parse::<EncryptMode>().unwrap(), EncryptMode::NotSupported);
        assert_eq!("ENCRYPT_REQ".parse::<EncryptMode>().unwrap(), EncryptMode::Required);
        assert!("sometimes".parse::<EncryptMode>().is_err());
        assert_eq!(EncryptMode::from(0x42), EncryptMode::Unknown(0x42));
        assert_eq!(EncryptMode::from(0x83).as_byte(), 0x83);
    }

    #[test]
    fn test_options_serialize_by_name() {
        let json = serde_json::to_value(server_response()).unwrap();
        assert_eq!(json["ENCRYPTION"], "01");
        assert_eq!(json["VERSION"], "0c0007d00000");
        assert_eq!(
            serde_json::to_value(EncryptMode::NotSupported).unwrap(),
            "ENCRYPT_NOT_SUP"
        );
    }
}
