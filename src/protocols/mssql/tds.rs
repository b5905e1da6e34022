//! TDS packet framing
//!
//! Every TDS packet starts with an 8-byte header:
//!
//! ```text
//! type u8 | status u8 | length u16 BE | spid u16 BE | packet id u8 | window u8
//! ```
//!
//! `length` counts the header. A message is the concatenation of packet
//! payloads up to and including the packet with the end-of-message bit.

use crate::error::{ScanError, ScanResult};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const TDS_HEADER_SIZE: usize = 8;
pub const STATUS_EOM: u8 = 0x01;
/// Packet size used for outgoing messages
pub const DEFAULT_PACKET_SIZE: usize = 4096;
/// Largest packet length accepted on read
pub const MAX_PACKET_SIZE: usize = 32767;
/// Ceiling on one reassembled message
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TdsPacketType {
    SqlBatch = 0x01,
    RpcRequest = 0x03,
    TabularResult = 0x04,
    Attention = 0x06,
    BulkLoad = 0x07,
    FedAuthToken = 0x08,
    TransactionManager = 0x0E,
    Login7 = 0x10,
    Sspi = 0x11,
    /// PRELOGIN requests, and TLS handshake records tunneled during PRELOGIN
    Prelogin = 0x12,
}

impl TdsPacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => TdsPacketType::SqlBatch,
            0x03 => TdsPacketType::RpcRequest,
            0x04 => TdsPacketType::TabularResult,
            0x06 => TdsPacketType::Attention,
            0x07 => TdsPacketType::BulkLoad,
            0x08 => TdsPacketType::FedAuthToken,
            0x0E => TdsPacketType::TransactionManager,
            0x10 => TdsPacketType::Login7,
            0x11 => TdsPacketType::Sspi,
            0x12 => TdsPacketType::Prelogin,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdsHeader {
    pub packet_type: u8,
    pub status: u8,
    pub length: u16,
    pub spid: u16,
    pub packet_id: u8,
    pub window: u8,
}

impl TdsHeader {
    pub fn new(packet_type: TdsPacketType, status: u8, payload_len: usize, packet_id: u8) -> Self {
        Self {
            packet_type: packet_type as u8,
            status,
            length: (payload_len + TDS_HEADER_SIZE) as u16,
            spid: 0,
            packet_id,
            window: 0,
        }
    }

    pub fn encode(&self) -> [u8; TDS_HEADER_SIZE] {
        let length = self.length.to_be_bytes();
        let spid = self.spid.to_be_bytes();
        [
            self.packet_type,
            self.status,
            length[0],
            length[1],
            spid[0],
            spid[1],
            self.packet_id,
            self.window,
        ]
    }

    pub fn decode(bytes: &[u8; TDS_HEADER_SIZE]) -> Self {
        Self {
            packet_type: bytes[0],
            status: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            spid: u16::from_be_bytes([bytes[4], bytes[5]]),
            packet_id: bytes[6],
            window: bytes[7],
        }
    }

    pub fn is_eom(&self) -> bool {
        self.status & STATUS_EOM != 0
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.length).saturating_sub(TDS_HEADER_SIZE)
    }

    /// Check the header could belong to a TDS server answering us
    pub fn validate(&self, accepted: &[TdsPacketType]) -> ScanResult<()> {
        let known = TdsPacketType::from_u8(self.packet_type);
        if !known.map_or(false, |t| accepted.contains(&t)) {
            return Err(ScanError::InvalidTdsHeader(format!(
                "unexpected packet type 0x{:02x}",
                self.packet_type
            )));
        }

        let length = usize::from(self.length);
        if !(TDS_HEADER_SIZE..=MAX_PACKET_SIZE).contains(&length) {
            return Err(ScanError::InvalidTdsHeader(format!(
                "packet length {} out of range",
                length
            )));
        }

        Ok(())
    }
}

/// Split `payload` into packets of at most `packet_size` bytes.
///
/// `packet_id` is advanced (wrapping) once per packet. An empty payload
/// still produces one end-of-message packet.
pub fn encode_message(
    packet_type: TdsPacketType,
    payload: &[u8],
    packet_size: usize,
    packet_id: &mut u8,
) -> Vec<u8> {
    let chunk_size = packet_size
        .min(MAX_PACKET_SIZE)
        .saturating_sub(TDS_HEADER_SIZE)
        .max(1);
    let packet_count = ((payload.len() + chunk_size - 1) / chunk_size).max(1);
    let mut out = Vec::with_capacity(payload.len() + packet_count * TDS_HEADER_SIZE);

    let mut chunks = payload.chunks(chunk_size).peekable();
    if chunks.peek().is_none() {
        out.extend_from_slice(&TdsHeader::new(packet_type, STATUS_EOM, 0, *packet_id).encode());
        *packet_id = packet_id.wrapping_add(1);
        return out;
    }

    while let Some(chunk) = chunks.next() {
        let status = if chunks.peek().is_none() { STATUS_EOM } else { 0 };
        out.extend_from_slice(&TdsHeader::new(packet_type, status, chunk.len(), *packet_id).encode());
        out.extend_from_slice(chunk);
        *packet_id = packet_id.wrapping_add(1);
    }

    out
}

/// Read packets until end-of-message and return the joined payload.
///
/// `saw_valid_header` is set as soon as one header passes validation, so a
/// caller can tell "spoke TDS, then failed" from "never spoke TDS".
pub async fn read_tds_message<R>(
    reader: &mut R,
    accepted: &[TdsPacketType],
    saw_valid_header: &mut bool,
) -> ScanResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();

    loop {
        let mut raw = [0u8; TDS_HEADER_SIZE];
        reader.read_exact(&mut raw).await?;
        let header = TdsHeader::decode(&raw);
        header.validate(accepted)?;
        *saw_valid_header = true;

        let payload_len = header.payload_len();
        if message.len() + payload_len > MAX_MESSAGE_SIZE {
            return Err(ScanError::protocol(format!(
                "TDS message exceeds {} bytes",
                MAX_MESSAGE_SIZE
            )));
        }

        let start = message.len();
        message.resize(start + payload_len, 0);
        reader.read_exact(&mut message[start..]).await?;

        if header.is_eom() {
            return Ok(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = TdsHeader::new(TdsPacketType::Prelogin, STATUS_EOM, 0x2f, 1);
        assert_eq!(header.encode(), [0x12, 0x01, 0x00, 0x37, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(TdsHeader::decode(&header.encode()), header);
    }

    #[test]
    fn test_empty_message_is_single_eom_packet() {
        let mut id = 1;
        let bytes = encode_message(TdsPacketType::Prelogin, &[], DEFAULT_PACKET_SIZE, &mut id);
        assert_eq!(bytes, vec![0x12, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(id, 2);
    }

    #[test]
    fn test_fragmentation_marks_only_last_packet() {
        let mut id = 255;
        let payload = vec![0xAB; 20];
        let bytes = encode_message(TdsPacketType::Prelogin, &payload, 16, &mut id);

        // 8 payload bytes per packet: 8 + 8 + 4
        assert_eq!(bytes.len(), 20 + 3 * TDS_HEADER_SIZE);
        assert_eq!(bytes[1], 0);
        assert_eq!(bytes[6], 255);
        assert_eq!(bytes[16 + 1], 0);
        assert_eq!(bytes[16 + 6], 0);
        assert_eq!(bytes[32 + 1], STATUS_EOM);
        assert_eq!(u16::from_be_bytes([bytes[34], bytes[35]]), 12);
        assert_eq!(id, 2);
    }

    #[test]
    fn test_validate_rejects_foreign_type_and_length() {
        let http = TdsHeader::decode(b"HTTP/1.1");
        assert!(matches!(
            http.validate(&[TdsPacketType::TabularResult]),
            Err(ScanError::InvalidTdsHeader(_))
        ));

        let mut short = TdsHeader::new(TdsPacketType::TabularResult, STATUS_EOM, 0, 1);
        short.length = 4;
        assert!(short.validate(&[TdsPacketType::TabularResult]).is_err());
    }

    #[tokio::test]
    async fn test_read_reassembles_message() {
        let mut id = 1;
        let payload: Vec<u8> = (0..100u8).collect();
        let wire = encode_message(TdsPacketType::TabularResult, &payload, 40, &mut id);

        let mut reader = &wire[..];
        let mut saw_valid = false;
        let message = read_tds_message(&mut reader, &[TdsPacketType::TabularResult], &mut saw_valid)
            .await
            .unwrap();
        assert_eq!(message, payload);
        assert!(saw_valid);
    }

    #[tokio::test]
    async fn test_read_flags_nothing_for_non_tds() {
        let wire = b"SSH-2.0-OpenSSH_9.6\r\n".to_vec();
        let mut reader = &wire[..];
        let mut saw_valid = false;
        let err = read_tds_message(&mut reader, &[TdsPacketType::TabularResult], &mut saw_valid)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidTdsHeader(_)));
        assert!(!saw_valid);
    }
}
