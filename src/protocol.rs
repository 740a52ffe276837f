//! The wire format shared by every connection, pairing or TLS: a fixed
//! 10-byte header (magic, length, type, request-id length) followed by a
//! request-id string and a payload. JSON is used for control/device-info/
//! pairing/index/search payloads; file chunks use a small binary header.
use crate::error::{FamilyVaultError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x4656_4C54; // "FVLT"
pub const MAX_FRAME: usize = 16 * 1024 * 1024;
pub const HEADER_LEN: usize = 10;
pub const FILE_CHUNK_HEADER_LEN: usize = 29;
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Heartbeat,
    HeartbeatAck,
    Disconnect,
    Error,
    DeviceInfo,
    DeviceInfoRequest,
    IndexSyncRequest,
    IndexSyncResponse,
    IndexDelta,
    IndexDeltaAck,
    FileRequest,
    FileResponse,
    FileChunk,
    FileChunkAck,
    FileNotFound,
    SearchRequest,
    SearchResponse,
    PairingRequest,
    PairingResponse,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::Heartbeat => 0x00,
            MessageType::HeartbeatAck => 0x01,
            MessageType::Disconnect => 0x02,
            MessageType::Error => 0x0F,
            MessageType::DeviceInfo => 0x10,
            MessageType::DeviceInfoRequest => 0x11,
            MessageType::IndexSyncRequest => 0x20,
            MessageType::IndexSyncResponse => 0x21,
            MessageType::IndexDelta => 0x22,
            MessageType::IndexDeltaAck => 0x23,
            MessageType::FileRequest => 0x30,
            MessageType::FileResponse => 0x31,
            MessageType::FileChunk => 0x32,
            MessageType::FileChunkAck => 0x33,
            MessageType::FileNotFound => 0x34,
            MessageType::SearchRequest => 0x40,
            MessageType::SearchResponse => 0x41,
            MessageType::PairingRequest => 0x50,
            MessageType::PairingResponse => 0x51,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0x00 => MessageType::Heartbeat,
            0x01 => MessageType::HeartbeatAck,
            0x02 => MessageType::Disconnect,
            0x0F => MessageType::Error,
            0x10 => MessageType::DeviceInfo,
            0x11 => MessageType::DeviceInfoRequest,
            0x20 => MessageType::IndexSyncRequest,
            0x21 => MessageType::IndexSyncResponse,
            0x22 => MessageType::IndexDelta,
            0x23 => MessageType::IndexDeltaAck,
            0x30 => MessageType::FileRequest,
            0x31 => MessageType::FileResponse,
            0x32 => MessageType::FileChunk,
            0x33 => MessageType::FileChunkAck,
            0x34 => MessageType::FileNotFound,
            0x40 => MessageType::SearchRequest,
            0x41 => MessageType::SearchResponse,
            0x50 => MessageType::PairingRequest,
            0x51 => MessageType::PairingResponse,
            other => {
                return Err(FamilyVaultError::Protocol(format!(
                    "unknown message type 0x{other:02x}"
                )));
            }
        })
    }
}

/// One decoded frame: type, correlation id (empty or a UUIDv4), and payload
/// bytes (JSON for most types, a binary `FileChunkHeader` + data for chunks).
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MessageType,
    pub request_id: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, request_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn json(msg_type: MessageType, request_id: impl Into<String>, value: &impl Serialize) -> Result<Self> {
        Ok(Self::new(msg_type, request_id, serde_json::to_vec(value)?))
    }

    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(FamilyVaultError::from)
    }

    /// Serialize this frame to the wire format. Fails if `request_id` does
    /// not fit in a single byte length prefix, or the total frame would
    /// exceed `MAX_FRAME`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let req_id_bytes = self.request_id.as_bytes();
        if req_id_bytes.len() > u8::MAX as usize {
            return Err(FamilyVaultError::InvalidArgument(
                "request id longer than 255 bytes".into(),
            ));
        }
        let total_len = HEADER_LEN + req_id_bytes.len() + self.payload.len();
        if total_len > MAX_FRAME {
            return Err(FamilyVaultError::InvalidArgument(format!(
                "frame of {total_len} bytes exceeds MAX_FRAME"
            )));
        }

        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_u32(MAGIC);
        buf.put_u32(total_len as u32);
        buf.put_u8(self.msg_type.code());
        buf.put_u8(req_id_bytes.len() as u8);
        buf.put_slice(req_id_bytes);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }
}

/// Computes the total frame length encoded in a buffer that already
/// contains at least `HEADER_LEN` bytes, validating magic and the
/// `MAX_FRAME` ceiling. Returns `0` if the header is malformed or missing
/// a prerequisite (never silently truncates or exceeds `MAX_FRAME`).
pub fn message_size(buf: &[u8]) -> usize {
    if buf.len() < HEADER_LEN {
        return 0;
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return 0;
    }
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if len < HEADER_LEN || len > MAX_FRAME {
        return 0;
    }
    len
}

/// Decodes exactly one frame from the front of `buf`, which must contain at
/// least `message_size(buf)` bytes. Caller owns buffer draining.
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    let len = message_size(buf);
    if len == 0 || buf.len() < len {
        return Err(FamilyVaultError::Protocol(
            "incomplete or malformed frame".into(),
        ));
    }
    let msg_type = MessageType::from_code(buf[8])?;
    let req_id_len = buf[9] as usize;
    if HEADER_LEN + req_id_len > len {
        return Err(FamilyVaultError::Protocol(
            "request id length exceeds frame".into(),
        ));
    }
    let request_id =
        String::from_utf8(buf[HEADER_LEN..HEADER_LEN + req_id_len].to_vec()).map_err(|_| {
            FamilyVaultError::Protocol("request id is not valid utf-8".into())
        })?;
    let payload = buf[HEADER_LEN + req_id_len..len].to_vec();
    Ok(Frame {
        msg_type,
        request_id,
        payload,
    })
}

/// Accumulates bytes from a live stream and emits complete frames, one at a
/// time, as enough bytes arrive (TLS and TCP may both fragment or coalesce
/// writes arbitrarily).
#[derive(Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if any. A frame that would exceed
    /// `MAX_FRAME` or carries bad magic is a fatal `Protocol` error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let magic = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if magic != MAGIC {
            return Err(FamilyVaultError::Protocol("bad frame magic".into()));
        }
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if len < HEADER_LEN {
            return Err(FamilyVaultError::Protocol("frame shorter than header".into()));
        }
        if len > MAX_FRAME {
            return Err(FamilyVaultError::Protocol(format!(
                "frame of {len} bytes exceeds MAX_FRAME"
            )));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame_bytes = self.buf.split_to(len);
        decode_frame(&frame_bytes).map(Some)
    }
}

// ---------------------------------------------------------------------
// Binary file-chunk header
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunkHeader {
    pub file_id: i64,
    pub offset: i64,
    pub total_size: i64,
    pub chunk_size: i32,
    pub is_last: bool,
}

impl FileChunkHeader {
    pub fn encode(&self) -> [u8; FILE_CHUNK_HEADER_LEN] {
        let mut out = [0u8; FILE_CHUNK_HEADER_LEN];
        out[0..8].copy_from_slice(&self.file_id.to_be_bytes());
        out[8..16].copy_from_slice(&self.offset.to_be_bytes());
        out[16..24].copy_from_slice(&self.total_size.to_be_bytes());
        out[24..28].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[28] = self.is_last as u8;
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_CHUNK_HEADER_LEN {
            return Err(FamilyVaultError::Protocol(
                "file chunk header truncated".into(),
            ));
        }
        Ok(Self {
            file_id: i64::from_be_bytes(buf[0..8].try_into().unwrap()),
            offset: i64::from_be_bytes(buf[8..16].try_into().unwrap()),
            total_size: i64::from_be_bytes(buf[16..24].try_into().unwrap()),
            chunk_size: i32::from_be_bytes(buf[24..28].try_into().unwrap()),
            is_last: buf[28] != 0,
        })
    }
}

// ---------------------------------------------------------------------
// JSON payload types
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfoPayload {
    pub device_id: String,
    pub device_name: String,
    pub device_type: i32,
    pub protocol_version: i32,
    pub file_count: i64,
    pub last_sync_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequestPayload {
    pub pin: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PairingResponsePayload {
    Success {
        success: bool,
        family_secret: String,
    },
    Failure {
        success: bool,
        error_code: String,
        error_message: String,
    },
}

impl PairingResponsePayload {
    pub fn success(family_secret_hex: String) -> Self {
        PairingResponsePayload::Success {
            success: true,
            family_secret: family_secret_hex,
        }
    }

    pub fn failure(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        PairingResponsePayload::Failure {
            success: false,
            error_code: error_code.into(),
            error_message: error_message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSyncRequestPayload {
    pub since_timestamp: i64,
    pub folder_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDeltaPayload {
    pub file_id: i64,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    pub checksum: String,
    pub extracted_text: Option<String>,
    pub is_deleted: bool,
    pub device_id: String,
    pub sync_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequestPayload {
    pub file_id: i64,
    pub checksum: String,
    pub offset: i64,
    pub length: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequestPayload {
    pub query: String,
    pub limit: i32,
    pub offset: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponsePayload {
    pub results: Vec<IndexDeltaPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg_type: MessageType, request_id: &str, payload: Vec<u8>) {
        let frame = Frame::new(msg_type, request_id, payload.clone());
        let encoded = frame.encode().unwrap();
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.msg_type, msg_type);
        assert_eq!(decoded.request_id, request_id);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn frame_roundtrips() {
        roundtrip(MessageType::Heartbeat, "", vec![]);
        roundtrip(MessageType::DeviceInfo, &crate::pairing::crypto::generate_uuid_v4(), b"{}".to_vec());
    }

    #[test]
    fn max_frame_boundary_accepted_one_byte_over_rejected() {
        let req_id = "";
        let payload_len = MAX_FRAME - HEADER_LEN;
        let frame = Frame::new(MessageType::FileChunk, req_id, vec![0u8; payload_len]);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), MAX_FRAME);
        decode_frame(&encoded).unwrap();

        let over = Frame::new(MessageType::FileChunk, req_id, vec![0u8; payload_len + 1]);
        assert!(over.encode().is_err());
    }

    #[test]
    fn framer_reassembles_fragmented_stream() {
        let frame = Frame::new(
            MessageType::FileChunk,
            "",
            vec![0xAB; 100 * 1024],
        );
        let encoded = frame.encode().unwrap();

        let mut framer = Framer::new();
        let mut decoded = Vec::new();
        for chunk in encoded.chunks(4096) {
            framer.feed(chunk);
            while let Some(f) = framer.next_frame().unwrap() {
                decoded.push(f);
            }
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].payload.len(), 100 * 1024);
    }

    #[test]
    fn message_size_zero_for_malformed() {
        assert_eq!(message_size(&[0u8; 4]), 0);
        assert_eq!(message_size(&[0xFFu8; HEADER_LEN]), 0);
        let mut oversize_header = [0u8; HEADER_LEN];
        oversize_header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        oversize_header[4..8].copy_from_slice(&((MAX_FRAME + 1) as u32).to_be_bytes());
        assert_eq!(message_size(&oversize_header), 0);
    }

    #[test]
    fn file_chunk_header_roundtrips() {
        let header = FileChunkHeader {
            file_id: 42,
            offset: 1024,
            total_size: 1_572_864,
            chunk_size: 65536,
            is_last: true,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), FILE_CHUNK_HEADER_LEN);
        assert_eq!(FileChunkHeader::decode(&encoded).unwrap(), header);
    }
}
