//! SPNEGO and NTLMSSP pieces used by the anonymous session setup.
//!
//! Only the first leg is implemented: we send NEGOTIATE and decode the
//! server's CHALLENGE, which names the host and domain without credentials.

use crate::error::{ScanError, ScanResult};
use bytes::Buf;

pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
pub const NTLM_NEGOTIATE: u32 = 1;
pub const NTLM_CHALLENGE: u32 = 2;

pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub const NEGOTIATE_OEM: u32 = 0x0000_0002;
pub const REQUEST_TARGET: u32 = 0x0000_0004;
pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
pub const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
pub const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
pub const NEGOTIATE_VERSION: u32 = 0x0200_0000;
pub const NEGOTIATE_128: u32 = 0x2000_0000;
pub const NEGOTIATE_KEY_EXCH: u32 = 0x4000_0000;
pub const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_VERSION
    | NEGOTIATE_128
    | NEGOTIATE_KEY_EXCH
    | NEGOTIATE_56;

const NEGOTIATE_MESSAGE_SIZE: usize = 40;
const CHALLENGE_MIN_SIZE: usize = 48;

const OID_SPNEGO: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
const OID_NTLMSSP: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];
const OID_KERBEROS: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02];
const OID_MS_KERBEROS: &[u8] = &[0x2a, 0x86, 0x48, 0x82, 0xf7, 0x12, 0x01, 0x02, 0x02];
const OID_NEGOEX: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x1e];

const KNOWN_MECHANISMS: [(&[u8], &str); 4] = [
    (OID_NTLMSSP, "ntlmssp"),
    (OID_KERBEROS, "kerberos"),
    (OID_MS_KERBEROS, "ms-kerberos"),
    (OID_NEGOEX, "negoex"),
];

// Target info AV pair ids (MS-NLMP 2.2.2.1)
const AV_EOL: u16 = 0;
const AV_NB_COMPUTER_NAME: u16 = 1;
const AV_NB_DOMAIN_NAME: u16 = 2;
const AV_DNS_COMPUTER_NAME: u16 = 3;
const AV_DNS_DOMAIN_NAME: u16 = 4;
const AV_DNS_TREE_NAME: u16 = 5;

fn der_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    der_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Security mechanisms advertised in a SPNEGO token, in the order they appear
pub fn auth_mechanisms(blob: &[u8]) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = KNOWN_MECHANISMS
        .iter()
        .filter_map(|(oid, name)| find(blob, &der(0x06, oid)).map(|pos| (pos, *name)))
        .collect();
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, name)| name.to_string()).collect()
}

/// NTLMSSP NEGOTIATE with no domain or workstation
pub fn negotiate_message() -> Vec<u8> {
    let mut out = Vec::with_capacity(NEGOTIATE_MESSAGE_SIZE);
    out.extend_from_slice(NTLMSSP_SIGNATURE);
    out.extend_from_slice(&NTLM_NEGOTIATE.to_le_bytes());
    out.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
    for _ in 0..2 {
        // empty domain / workstation fields
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(NEGOTIATE_MESSAGE_SIZE as u32).to_le_bytes());
    }
    // version 6.1 build 7601, NTLM revision 15
    out.extend_from_slice(&[6, 1, 0xB1, 0x1D, 0, 0, 0, 0x0F]);
    out
}

/// SPNEGO NegTokenInit offering NTLMSSP and carrying its NEGOTIATE message
pub fn spnego_negotiate_token() -> Vec<u8> {
    let mech_types = der(0xa0, &der(0x30, &der(0x06, OID_NTLMSSP)));
    let mech_token = der(0xa2, &der(0x04, &negotiate_message()));
    let neg_token_init = der(0xa0, &der(0x30, &[mech_types, mech_token].concat()));
    der(0x60, &[der(0x06, OID_SPNEGO), neg_token_init].concat())
}

/// Locate an NTLMSSP message inside a SPNEGO response blob
pub fn find_ntlmssp(blob: &[u8]) -> Option<&[u8]> {
    find(blob, NTLMSSP_SIGNATURE).map(|pos| &blob[pos..])
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NtlmChallenge {
    pub target_name: Option<String>,
    pub negotiate_flags: u32,
    pub server_challenge: [u8; 8],
    /// (major, minor, build)
    pub version: Option<(u8, u8, u16)>,
    pub netbios_computer_name: Option<String>,
    pub netbios_domain_name: Option<String>,
    pub dns_computer_name: Option<String>,
    pub dns_domain_name: Option<String>,
    pub dns_tree_name: Option<String>,
}

impl NtlmChallenge {
    pub fn parse(message: &[u8]) -> ScanResult<Self> {
        if message.len() < CHALLENGE_MIN_SIZE {
            return Err(ScanError::protocol(format!(
                "NTLMSSP CHALLENGE truncated ({} bytes)",
                message.len()
            )));
        }
        if &message[..8] != NTLMSSP_SIGNATURE {
            return Err(ScanError::protocol("missing NTLMSSP signature"));
        }

        let mut buf = &message[8..];
        let message_type = buf.get_u32_le();
        if message_type != NTLM_CHALLENGE {
            return Err(ScanError::protocol(format!(
                "expected NTLMSSP CHALLENGE, got message type {}",
                message_type
            )));
        }

        let target_name_len = usize::from(buf.get_u16_le());
        buf.advance(2);
        let target_name_offset = buf.get_u32_le() as usize;
        let negotiate_flags = buf.get_u32_le();
        let mut server_challenge = [0u8; 8];
        buf.copy_to_slice(&mut server_challenge);
        buf.advance(8); // reserved
        let target_info_len = usize::from(buf.get_u16_le());
        buf.advance(2);
        let target_info_offset = buf.get_u32_le() as usize;

        let unicode = negotiate_flags & NEGOTIATE_UNICODE != 0;
        let mut challenge = NtlmChallenge {
            target_name: field(message, target_name_offset, target_name_len)
                .map(|raw| decode_string(raw, unicode)),
            negotiate_flags,
            server_challenge,
            ..NtlmChallenge::default()
        };

        if negotiate_flags & NEGOTIATE_VERSION != 0 && message.len() >= 56 {
            let build = u16::from_le_bytes([message[50], message[51]]);
            challenge.version = Some((message[48], message[49], build));
        }

        if let Some(info) = field(message, target_info_offset, target_info_len) {
            challenge.read_target_info(info);
        }

        Ok(challenge)
    }

    fn read_target_info(&mut self, mut info: &[u8]) {
        while info.remaining() >= 4 {
            let id = info.get_u16_le();
            let len = usize::from(info.get_u16_le());
            if id == AV_EOL || info.remaining() < len {
                break;
            }
            let value = decode_string(&info[..len], true);
            info.advance(len);

            match id {
                AV_NB_COMPUTER_NAME => self.netbios_computer_name = Some(value),
                AV_NB_DOMAIN_NAME => self.netbios_domain_name = Some(value),
                AV_DNS_COMPUTER_NAME => self.dns_computer_name = Some(value),
                AV_DNS_DOMAIN_NAME => self.dns_domain_name = Some(value),
                AV_DNS_TREE_NAME => self.dns_tree_name = Some(value),
                _ => {}
            }
        }
    }

    pub fn os_version(&self) -> Option<String> {
        self.version
            .map(|(major, minor, build)| format!("{}.{}.{}", major, minor, build))
    }
}

fn field(message: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    if len == 0 {
        return None;
    }
    let end = offset.checked_add(len)?;
    message.get(offset..end)
}

fn decode_string(raw: &[u8], unicode: bool) -> String {
    if unicode {
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(raw).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn av(id: u16, value: &[u8]) -> Vec<u8> {
        let mut out = id.to_le_bytes().to_vec();
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(value);
        out
    }

    fn challenge_message() -> Vec<u8> {
        let target = utf16("CORP");
        let info = [
            av(AV_NB_DOMAIN_NAME, &utf16("CORP")),
            av(AV_NB_COMPUTER_NAME, &utf16("FILES01")),
            av(AV_DNS_DOMAIN_NAME, &utf16("corp.example")),
            av(AV_EOL, &[]),
        ]
        .concat();
        let flags = NEGOTIATE_UNICODE | NEGOTIATE_VERSION | NEGOTIATE_TARGET_INFO;

        let mut msg = NTLMSSP_SIGNATURE.to_vec();
        msg.extend_from_slice(&NTLM_CHALLENGE.to_le_bytes());
        msg.extend_from_slice(&(target.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(target.len() as u16).to_le_bytes());
        msg.extend_from_slice(&56u32.to_le_bytes());
        msg.extend_from_slice(&flags.to_le_bytes());
        msg.extend_from_slice(&[0x11; 8]);
        msg.extend_from_slice(&[0; 8]);
        msg.extend_from_slice(&(info.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(info.len() as u16).to_le_bytes());
        msg.extend_from_slice(&((56 + target.len()) as u32).to_le_bytes());
        msg.extend_from_slice(&[10, 0, 0x63, 0x45, 0, 0, 0, 0x0F]);
        msg.extend_from_slice(&target);
        msg.extend_from_slice(&info);
        msg
    }

    #[test]
    fn test_negotiate_message_shape() {
        let msg = negotiate_message();
        assert_eq!(msg.len(), NEGOTIATE_MESSAGE_SIZE);
        assert_eq!(&msg[..8], NTLMSSP_SIGNATURE);
        assert_eq!(u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]), NTLM_NEGOTIATE);
    }

    #[test]
    fn test_spnego_token_advertises_ntlmssp() {
        let token = spnego_negotiate_token();
        assert_eq!(token[0], 0x60);
        assert_eq!(usize::from(token[1]), token.len() - 2);
        assert_eq!(auth_mechanisms(&token), vec!["ntlmssp"]);
        assert!(find_ntlmssp(&token).is_some());
    }

    #[test]
    fn test_auth_mechanisms_in_order() {
        let blob = [
            der(0x06, OID_MS_KERBEROS),
            der(0x06, OID_KERBEROS),
            der(0x06, OID_NEGOEX),
            der(0x06, OID_NTLMSSP),
        ]
        .concat();
        assert_eq!(
            auth_mechanisms(&blob),
            vec!["ms-kerberos", "kerberos", "negoex", "ntlmssp"]
        );
        assert!(auth_mechanisms(&[]).is_empty());
    }

    #[test]
    fn test_parse_challenge() {
        let challenge = NtlmChallenge::parse(&challenge_message()).unwrap();
        assert_eq!(challenge.target_name.as_deref(), Some("CORP"));
        assert_eq!(challenge.server_challenge, [0x11; 8]);
        assert_eq!(challenge.os_version().as_deref(), Some("10.0.17763"));
        assert_eq!(challenge.netbios_computer_name.as_deref(), Some("FILES01"));
        assert_eq!(challenge.dns_domain_name.as_deref(), Some("corp.example"));
        assert!(challenge.dns_tree_name.is_none());
    }

    #[test]
    fn test_field_outside_message_is_absent() {
        let message = [0u8; 16];
        assert_eq!(field(&message, 8, 8), Some(&message[8..]));
        assert!(field(&message, 8, 9).is_none());
        assert!(field(&message, usize::MAX, 1).is_none());
        assert!(field(&message, 0, 0).is_none());
    }

    #[test]
    fn test_parse_rejects_negotiate_message() {
        let mut msg = negotiate_message();
        msg.resize(64, 0);
        assert!(NtlmChallenge::parse(&msg).is_err());
        assert!(NtlmChallenge::parse(b"NTLMSSP\0").is_err());
    }
}
