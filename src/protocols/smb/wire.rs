//! SMB2 wire codec: NetBIOS session framing, the 64-byte SMB2 header, and
//! the NEGOTIATE / SESSION_SETUP bodies the probe needs. All SMB2 integers
//! are little-endian.

use crate::error::{ScanError, ScanResult};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

pub const NETBIOS_HEADER_SIZE: usize = 4;
pub const SMB2_HEADER_SIZE: usize = 64;
pub const SMB1_PROTOCOL_ID: [u8; 4] = [0xFF, b'S', b'M', b'B'];
pub const SMB2_PROTOCOL_ID: [u8; 4] = [0xFE, b'S', b'M', b'B'];

pub const COMMAND_NEGOTIATE: u16 = 0x0000;
pub const COMMAND_SESSION_SETUP: u16 = 0x0001;

pub const DIALECT_SMB_2_1: u16 = 0x0210;
pub const SECURITY_MODE_SIGNING_ENABLED: u16 = 0x0001;

pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;

const NEGOTIATE_REQUEST_SIZE: u16 = 36;
const NEGOTIATE_RESPONSE_SIZE: u16 = 65;
const NEGOTIATE_RESPONSE_FIXED: usize = 64;
const SESSION_SETUP_REQUEST_SIZE: u16 = 25;
const SESSION_SETUP_REQUEST_FIXED: usize = 24;
const SESSION_SETUP_RESPONSE_SIZE: u16 = 9;
const SESSION_SETUP_RESPONSE_FIXED: usize = 8;

/// Largest NetBIOS payload accepted from a server
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub protocol_id: [u8; 4],
    pub credit_charge: u16,
    pub status: u32,
    pub command: u16,
    pub credits: u16,
    pub flags: u32,
    pub next_command: u32,
    pub message_id: u64,
    pub process_id: u32,
    pub tree_id: u32,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Smb2Header {
    pub fn request(command: u16, message_id: u64) -> Self {
        Self {
            protocol_id: SMB2_PROTOCOL_ID,
            credit_charge: 0,
            status: 0,
            command,
            credits: 1,
            flags: 0,
            next_command: 0,
            message_id,
            process_id: 0,
            tree_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(&self.protocol_id);
        out.put_u16_le(SMB2_HEADER_SIZE as u16);
        out.put_u16_le(self.credit_charge);
        out.put_u32_le(self.status);
        out.put_u16_le(self.command);
        out.put_u16_le(self.credits);
        out.put_u32_le(self.flags);
        out.put_u32_le(self.next_command);
        out.put_u64_le(self.message_id);
        out.put_u32_le(self.process_id);
        out.put_u32_le(self.tree_id);
        out.put_u64_le(self.session_id);
        out.put_slice(&self.signature);
    }

    pub fn decode(message: &[u8]) -> ScanResult<Self> {
        if message.len() < SMB2_HEADER_SIZE {
            return Err(ScanError::protocol(format!(
                "SMB2 header truncated ({} bytes)",
                message.len()
            )));
        }

        let mut buf = &message[..SMB2_HEADER_SIZE];
        let mut protocol_id = [0u8; 4];
        buf.copy_to_slice(&mut protocol_id);
        if protocol_id != SMB2_PROTOCOL_ID {
            return Err(ScanError::protocol(format!(
                "not an SMB2 response (protocol id {:02x?})",
                protocol_id
            )));
        }
        let structure_size = buf.get_u16_le();
        if usize::from(structure_size) != SMB2_HEADER_SIZE {
            return Err(ScanError::protocol(format!(
                "bad SMB2 header size {}",
                structure_size
            )));
        }

        let credit_charge = buf.get_u16_le();
        let status = buf.get_u32_le();
        let command = buf.get_u16_le();
        let credits = buf.get_u16_le();
        let flags = buf.get_u32_le();
        let next_command = buf.get_u32_le();
        let message_id = buf.get_u64_le();
        let process_id = buf.get_u32_le();
        let tree_id = buf.get_u32_le();
        let session_id = buf.get_u64_le();
        let mut signature = [0u8; 16];
        buf.copy_to_slice(&mut signature);

        Ok(Self {
            protocol_id,
            credit_charge,
            status,
            command,
            credits,
            flags,
            next_command,
            message_id,
            process_id,
            tree_id,
            session_id,
            signature,
        })
    }
}

/// NEGOTIATE request offering only SMB 2.1 with signing enabled
pub fn negotiate_request(client_guid: Uuid) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(SMB2_HEADER_SIZE + 38);
    Smb2Header::request(COMMAND_NEGOTIATE, 0).encode(&mut out);
    out.put_u16_le(NEGOTIATE_REQUEST_SIZE);
    out.put_u16_le(1); // dialect count
    out.put_u16_le(SECURITY_MODE_SIGNING_ENABLED);
    out.put_u16_le(0);
    out.put_u32_le(0); // capabilities
    out.put_slice(&client_guid.to_bytes_le());
    out.put_u64_le(0); // client start time
    out.put_u16_le(DIALECT_SMB_2_1);
    out.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    pub security_mode: u16,
    pub dialect_revision: u16,
    pub server_guid: Uuid,
    pub capabilities: u32,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: u64,
    pub server_start_time: u64,
    pub security_blob: Vec<u8>,
}

impl NegotiateResponse {
    /// Decode from a whole SMB2 message (header included)
    pub fn decode(message: &[u8]) -> ScanResult<Self> {
        let body = message
            .get(SMB2_HEADER_SIZE..SMB2_HEADER_SIZE + NEGOTIATE_RESPONSE_FIXED)
            .ok_or_else(|| ScanError::protocol("SMB2 NEGOTIATE response truncated"))?;

        let mut buf = body;
        let structure_size = buf.get_u16_le();
        if structure_size != NEGOTIATE_RESPONSE_SIZE {
            return Err(ScanError::protocol(format!(
                "bad NEGOTIATE response size {}",
                structure_size
            )));
        }
        let security_mode = buf.get_u16_le();
        let dialect_revision = buf.get_u16_le();
        buf.advance(2); // negotiate context count
        let mut guid = [0u8; 16];
        buf.copy_to_slice(&mut guid);
        let capabilities = buf.get_u32_le();
        let max_transact_size = buf.get_u32_le();
        let max_read_size = buf.get_u32_le();
        let max_write_size = buf.get_u32_le();
        let system_time = buf.get_u64_le();
        let server_start_time = buf.get_u64_le();
        let blob_offset = usize::from(buf.get_u16_le());
        let blob_len = usize::from(buf.get_u16_le());

        Ok(Self {
            security_mode,
            dialect_revision,
            server_guid: Uuid::from_bytes_le(guid),
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_blob: security_buffer(message, blob_offset, blob_len)?,
        })
    }
}

/// SESSION_SETUP request carrying one security token
pub fn session_setup_request(message_id: u64, security_blob: &[u8]) -> Vec<u8> {
    let mut out =
        BytesMut::with_capacity(SMB2_HEADER_SIZE + SESSION_SETUP_REQUEST_FIXED + security_blob.len());
    Smb2Header::request(COMMAND_SESSION_SETUP, message_id).encode(&mut out);
    out.put_u16_le(SESSION_SETUP_REQUEST_SIZE);
    out.put_u8(0); // flags
    out.put_u8(SECURITY_MODE_SIGNING_ENABLED as u8);
    out.put_u32_le(0); // capabilities
    out.put_u32_le(0); // channel
    out.put_u16_le((SMB2_HEADER_SIZE + SESSION_SETUP_REQUEST_FIXED) as u16);
    out.put_u16_le(security_blob.len() as u16);
    out.put_u64_le(0); // previous session id
    out.put_slice(security_blob);
    out.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupResponse {
    pub session_flags: u16,
    pub security_blob: Vec<u8>,
}

impl SessionSetupResponse {
    pub fn decode(message: &[u8]) -> ScanResult<Self> {
        let mut buf = message
            .get(SMB2_HEADER_SIZE..SMB2_HEADER_SIZE + SESSION_SETUP_RESPONSE_FIXED)
            .ok_or_else(|| ScanError::protocol("SMB2 SESSION_SETUP response truncated"))?;

        let structure_size = buf.get_u16_le();
        if structure_size != SESSION_SETUP_RESPONSE_SIZE {
            return Err(ScanError::protocol(format!(
                "bad SESSION_SETUP response size {}",
                structure_size
            )));
        }
        let session_flags = buf.get_u16_le();
        let blob_offset = usize::from(buf.get_u16_le());
        let blob_len = usize::from(buf.get_u16_le());

        Ok(Self {
            session_flags,
            security_blob: security_buffer(message, blob_offset, blob_len)?,
        })
    }
}

/// Security buffers are addressed from the start of the SMB2 header
fn security_buffer(message: &[u8], offset: usize, len: usize) -> ScanResult<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    offset
        .checked_add(len)
        .and_then(|end| message.get(offset..end))
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            ScanError::protocol(format!(
                "security buffer {}+{} outside the {}-byte message",
                offset,
                len,
                message.len()
            ))
        })
}

/// Prefix `message` with a NetBIOS session header
pub fn frame(message: &[u8]) -> Vec<u8> {
    let len = message.len() as u32;
    let mut out = Vec::with_capacity(NETBIOS_HEADER_SIZE + message.len());
    out.push(0x00);
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(message);
    out
}

pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> ScanResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame(message)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one NetBIOS session message and return its payload
pub async fn read_message<R>(reader: &mut R) -> ScanResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; NETBIOS_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    if header[0] != 0x00 {
        return Err(ScanError::protocol(format!(
            "unexpected NetBIOS message type 0x{:02x}",
            header[0]
        )));
    }

    let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    if len < SMB1_PROTOCOL_ID.len() {
        return Err(ScanError::protocol(format!("SMB message too short ({} bytes)", len)));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(ScanError::protocol(format!("SMB message too large ({} bytes)", len)));
    }

    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).await?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_request_layout() {
        let guid = Uuid::from_bytes([7; 16]);
        let request = negotiate_request(guid);
        assert_eq!(request.len(), SMB2_HEADER_SIZE + 38);
        assert_eq!(&request[..4], &SMB2_PROTOCOL_ID);
        assert_eq!(&request[4..6], &[64, 0]);
        assert_eq!(&request[12..14], &[0, 0]); // NEGOTIATE
        assert_eq!(&request[64..66], &[36, 0]);
        assert_eq!(&request[66..68], &[1, 0]);
        assert_eq!(&request[68..70], &[1, 0]);
        assert_eq!(&request[100..102], &[0x10, 0x02]);
    }

    #[test]
    fn test_header_decode_matches_encode() {
        let mut header = Smb2Header::request(COMMAND_SESSION_SETUP, 9);
        header.status = STATUS_MORE_PROCESSING_REQUIRED;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), SMB2_HEADER_SIZE);
        assert_eq!(Smb2Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_smb1_and_garbage() {
        let mut smb1 = vec![0u8; 64];
        smb1[..4].copy_from_slice(&SMB1_PROTOCOL_ID);
        assert!(Smb2Header::decode(&smb1).is_err());
        assert!(Smb2Header::decode(b"short").is_err());
    }

    #[test]
    fn test_frame_length_is_24_bit_big_endian() {
        let framed = frame(&[0xAA; 0x0102]);
        assert_eq!(&framed[..4], &[0x00, 0x00, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_read_message_rejects_session_request_type() {
        let wire = [0x81u8, 0x00, 0x00, 0x04, 0xFF, b'S', b'M', b'B'];
        let mut reader = &wire[..];
        assert!(matches!(read_message(&mut reader).await, Err(ScanError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_message_truncated_is_eof() {
        let wire = [0x00u8, 0x00, 0x00, 0x40, 0xFE, b'S'];
        let mut reader = &wire[..];
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_security_buffer_bounds() {
        let message = vec![0u8; 80];
        assert_eq!(security_buffer(&message, 72, 8).unwrap().len(), 8);
        assert!(security_buffer(&message, 72, 9).is_err());
        assert!(security_buffer(&message, 500, 0).unwrap().is_empty());
        assert!(security_buffer(&message, usize::MAX, 2).is_err());
    }
}
