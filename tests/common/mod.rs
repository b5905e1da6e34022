//! Fixtures shared by the integration tests: a throwaway certificate and
//! canned server messages.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use deimos::protocols::mssql::prelogin::{
    PRELOGIN_ENCRYPTION, PRELOGIN_INSTOPT, PRELOGIN_VERSION,
};
use deimos::protocols::mssql::{EncryptMode, PreloginOptions};
use deimos::protocols::smb::wire::{
    Smb2Header, COMMAND_NEGOTIATE, COMMAND_SESSION_SETUP, SMB2_HEADER_SIZE,
    STATUS_MORE_PROCESSING_REQUIRED,
};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::{X509NameBuilder, X509};

/// Self-signed P-256 certificate with `CN=<common_name>`
pub fn self_signed(common_name: &str) -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (builder.build(), key)
}

pub fn tls_acceptor(common_name: &str) -> SslAcceptor {
    let (cert, key) = self_signed(common_name);
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    builder.set_certificate(&cert).unwrap();
    builder.set_private_key(&key).unwrap();
    builder.build()
}

/// PRELOGIN response of a SQL Server 2014 named instance
pub fn prelogin_response(mode: EncryptMode) -> PreloginOptions {
    let mut options = PreloginOptions::new();
    // 12.0.2000.0
    options.insert(PRELOGIN_VERSION, vec![0x0C, 0x00, 0x07, 0xD0, 0x00, 0x00]);
    options.insert(PRELOGIN_ENCRYPTION, vec![mode.as_byte()]);
    options.insert(PRELOGIN_INSTOPT, b"SQLEXPRESS\0".to_vec());
    options
}

/// SMB2 NEGOTIATE response selecting dialect 2.1, without NetBIOS framing
pub fn smb_negotiate_response(capabilities: u32) -> Vec<u8> {
    let mut header = Smb2Header::request(COMMAND_NEGOTIATE, 0);
    header.flags = 0x0000_0001; // SERVER_TO_REDIR

    let mut out = BytesMut::new();
    header.encode(&mut out);
    out.put_u16_le(65); // StructureSize
    out.put_u16_le(0x0001); // SecurityMode: signing enabled
    out.put_u16_le(0x0210); // DialectRevision
    out.put_u16_le(0); // NegotiateContextCount
    out.put_slice(&[0x11; 16]); // ServerGuid
    out.put_u32_le(capabilities);
    out.put_u32_le(65_536); // MaxTransactSize
    out.put_u32_le(65_536); // MaxReadSize
    out.put_u32_le(65_536); // MaxWriteSize
    out.put_u64_le(133_000_000_000_000_000); // SystemTime (2022)
    out.put_u64_le(0); // ServerStartTime
    out.put_u16_le(0); // SecurityBufferOffset
    out.put_u16_le(0); // SecurityBufferLength
    out.put_u32_le(0); // NegotiateContextOffset
    debug_assert_eq!(out.len(), SMB2_HEADER_SIZE + 64);
    out.to_vec()
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// NTLMSSP CHALLENGE for host FILES01 in domain CORP, Windows 10.0.17763
pub fn ntlm_challenge() -> Vec<u8> {
    const FLAGS: u32 = 0x0000_0001 | 0x0000_0200 | 0x0080_0000 | 0x0200_0000;
    let target_name = utf16("CORP");

    let mut target_info = Vec::new();
    for (id, value) in [(1u16, "FILES01"), (2, "CORP"), (3, "files01.corp.local"), (4, "corp.local")] {
        let value = utf16(value);
        target_info.extend_from_slice(&id.to_le_bytes());
        target_info.extend_from_slice(&(value.len() as u16).to_le_bytes());
        target_info.extend_from_slice(&value);
    }
    target_info.extend_from_slice(&[0, 0, 0, 0]); // MsvAvEOL

    let target_name_offset = 56u32;
    let target_info_offset = target_name_offset + target_name.len() as u32;

    let mut out = BytesMut::new();
    out.put_slice(b"NTLMSSP\0");
    out.put_u32_le(2);
    out.put_u16_le(target_name.len() as u16);
    out.put_u16_le(target_name.len() as u16);
    out.put_u32_le(target_name_offset);
    out.put_u32_le(FLAGS);
    out.put_slice(&[0xAB; 8]); // server challenge
    out.put_slice(&[0; 8]); // reserved
    out.put_u16_le(target_info.len() as u16);
    out.put_u16_le(target_info.len() as u16);
    out.put_u32_le(target_info_offset);
    out.put_slice(&[10, 0, 0x63, 0x45, 0, 0, 0, 0x0F]); // version
    out.put_slice(&target_name);
    out.put_slice(&target_info);
    out.to_vec()
}

/// SESSION_SETUP response asking for the next leg, carrying `security_blob`
pub fn smb_session_setup_response(security_blob: &[u8]) -> Vec<u8> {
    let mut header = Smb2Header::request(COMMAND_SESSION_SETUP, 1);
    header.status = STATUS_MORE_PROCESSING_REQUIRED;
    header.flags = 0x0000_0001;
    header.session_id = 0x0000_0400_0000_0041;

    let mut out = BytesMut::new();
    header.encode(&mut out);
    out.put_u16_le(9); // StructureSize
    out.put_u16_le(0); // SessionFlags
    out.put_u16_le((SMB2_HEADER_SIZE + 8) as u16);
    out.put_u16_le(security_blob.len() as u16);
    out.put_slice(security_blob);
    out.to_vec()
}
