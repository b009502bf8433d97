//! On-wire byte layouts: the chunk header, the legacy BLE binary frame, and
//! the Security1 handshake messages.
//!
//! These are treated as byte layouts, never as reinterpreted records — every
//! multi-byte field is encoded/decoded explicitly with a defined endianness.
//! The chunk header is little-endian; SESSION_VERIFY's `payload_len` is
//! big-endian. Relying on host endianness here would silently break on any
//! big-endian target.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid chunk size: expected {expected}, got {got}")]
    InvalidSize { expected: usize, got: usize },
    #[error("chunk_idx {chunk_idx} out of range for total_chunks {total_chunks}")]
    IndexOutOfRange { chunk_idx: u8, total_chunks: u8 },
    #[error("op_len out of range: {0}")]
    InvalidOpLen(u8),
    #[error("unexpected protocol version: {0}")]
    BadVersion(u8),
    #[error("unexpected message type: {0}")]
    BadType(u8),
    #[error("unexpected key_len: {0}")]
    BadKeyLen(u8),
}

// ── Chunk header ─────────────────────────────────────────────────────────────

pub const CHUNK_HEADER_LEN: usize = 7;
pub const MAX_CHUNKS_PER_FRAME: u8 = 8;

pub mod chunk_flags {
    pub const CHUNKED: u8 = 0x01;
    pub const FINAL: u8 = 0x02;
    pub const MORE: u8 = 0x04;
}

/// Fixed 7-byte header prefixing every on-wire chunk.
///
/// `flags:u8 chunk_idx:u8 total_chunks:u8 frame_id:u16 chunk_size:u16`,
/// all multi-byte fields little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: u8,
    pub chunk_idx: u8,
    pub total_chunks: u8,
    pub frame_id: u16,
    pub chunk_size: u16,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        buf[0] = self.flags;
        buf[1] = self.chunk_idx;
        buf[2] = self.total_chunks;
        buf[3..5].copy_from_slice(&self.frame_id.to_le_bytes());
        buf[5..7].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf
    }

    /// Decode and validate the header's self-consistency (indices, not the
    /// relationship to the enclosing buffer's actual length — callers check
    /// `chunk_size == payload.len()` themselves since that depends on the
    /// full on-wire chunk, not just the header).
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < CHUNK_HEADER_LEN {
            return Err(WireError::TooShort(buf.len()));
        }
        let flags = buf[0];
        let chunk_idx = buf[1];
        let total_chunks = buf[2];
        let frame_id = u16::from_le_bytes([buf[3], buf[4]]);
        let chunk_size = u16::from_le_bytes([buf[5], buf[6]]);
        if chunk_idx >= total_chunks {
            return Err(WireError::IndexOutOfRange {
                chunk_idx,
                total_chunks,
            });
        }
        Ok(Self {
            flags,
            chunk_idx,
            total_chunks,
            frame_id,
            chunk_size,
        })
    }

    pub fn is_final(&self) -> bool {
        self.flags & chunk_flags::FINAL != 0
    }
}

/// Looks like a valid chunk header: the flags/index/size fields are all in
/// range. Transports use this to decide between feeding a payload to the
/// chunk manager or attempting a direct frame decode.
pub fn looks_like_chunk(buf: &[u8]) -> bool {
    if buf.len() < CHUNK_HEADER_LEN {
        return false;
    }
    match ChunkHeader::decode(buf) {
        Ok(h) => {
            h.flags & chunk_flags::CHUNKED != 0
                && h.total_chunks >= 1
                && h.total_chunks <= MAX_CHUNKS_PER_FRAME
                && h.frame_id != 0
                && (h.chunk_size as usize) == buf.len() - CHUNK_HEADER_LEN
        }
        Err(_) => false,
    }
}

// ── Legacy BLE binary frame ──────────────────────────────────────────────────

pub const MAX_OP_LEN: usize = 15;

/// `id:u16 LE | op_len:u8 (1..15) | op:op_len ASCII | payload:rest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFrame {
    pub id: u16,
    pub op: String,
    pub payload: Vec<u8>,
}

impl LegacyFrame {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 3 {
            return Err(WireError::TooShort(buf.len()));
        }
        let id = u16::from_le_bytes([buf[0], buf[1]]);
        let op_len = buf[2];
        if op_len == 0 || op_len as usize > MAX_OP_LEN {
            return Err(WireError::InvalidOpLen(op_len));
        }
        if 3 + op_len as usize > buf.len() {
            return Err(WireError::TooShort(buf.len()));
        }
        let op_bytes = &buf[3..3 + op_len as usize];
        let op = String::from_utf8_lossy(op_bytes).into_owned();
        let payload = buf[3 + op_len as usize..].to_vec();
        Ok(Self { id, op, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let op_bytes = self.op.as_bytes();
        let mut buf = Vec::with_capacity(3 + op_bytes.len() + self.payload.len());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.push(op_bytes.len() as u8);
        buf.extend_from_slice(op_bytes);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// `id:u16 LE | op_len:u8 | "ok"|"err" | status:u8 | payload:rest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyResponse {
    pub id: u16,
    pub status: i8,
    pub payload: Vec<u8>,
}

impl LegacyResponse {
    pub fn encode(&self) -> Vec<u8> {
        let tag: &[u8] = if self.status >= 0 { b"ok" } else { b"err" };
        let mut buf = Vec::with_capacity(4 + tag.len() + self.payload.len());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.push(tag.len() as u8);
        buf.extend_from_slice(tag);
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 3 {
            return Err(WireError::TooShort(buf.len()));
        }
        let id = u16::from_le_bytes([buf[0], buf[1]]);
        let tag_len = buf[2] as usize;
        if tag_len == 0 || 3 + tag_len + 1 > buf.len() {
            return Err(WireError::InvalidOpLen(buf[2]));
        }
        let status = buf[3 + tag_len] as i8;
        let payload = buf[3 + tag_len + 1..].to_vec();
        Ok(Self { id, status, payload })
    }
}

// ── Security1 handshake messages ─────────────────────────────────────────────

pub const SECURITY1_VERSION: u8 = 1;
pub const MSG_SESSION_ESTABLISH: u8 = 1;
pub const MSG_SESSION_VERIFY: u8 = 2;
pub const X25519_KEY_LEN: u8 = 32;

/// `version:u8(=1) | type:u8(=1) | key_len:u8(=32) | client_pub:32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablishRequest {
    pub client_pub: [u8; 32],
}

impl SessionEstablishRequest {
    pub const LEN: usize = 35;

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::TooShort(buf.len()));
        }
        if buf[0] != SECURITY1_VERSION {
            return Err(WireError::BadVersion(buf[0]));
        }
        if buf[1] != MSG_SESSION_ESTABLISH {
            return Err(WireError::BadType(buf[1]));
        }
        if buf[2] != X25519_KEY_LEN {
            return Err(WireError::BadKeyLen(buf[2]));
        }
        let mut client_pub = [0u8; 32];
        client_pub.copy_from_slice(&buf[3..35]);
        Ok(Self { client_pub })
    }
}

/// `version:u8(=1) | type:u8(=1) | key_len:u8(=32) | device_pub:32 | device_random:16`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablishResponse {
    pub device_pub: [u8; 32],
    pub device_random: [u8; 16],
}

impl SessionEstablishResponse {
    pub const LEN: usize = 51;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = SECURITY1_VERSION;
        buf[1] = MSG_SESSION_ESTABLISH;
        buf[2] = X25519_KEY_LEN;
        buf[3..35].copy_from_slice(&self.device_pub);
        buf[35..51].copy_from_slice(&self.device_random);
        buf
    }
}

/// `version:u8 | type:u8(=2) | payload_len:u16 BE | token:32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVerifyRequest {
    pub token: [u8; 32],
}

impl SessionVerifyRequest {
    pub const LEN: usize = 36;

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::TooShort(buf.len()));
        }
        if buf[0] != SECURITY1_VERSION {
            return Err(WireError::BadVersion(buf[0]));
        }
        if buf[1] != MSG_SESSION_VERIFY {
            return Err(WireError::BadType(buf[1]));
        }
        // payload_len is big-endian, unlike every other multi-byte field on
        // this device's wire formats.
        let payload_len = u16::from_be_bytes([buf[2], buf[3]]);
        if payload_len as usize != 32 {
            return Err(WireError::InvalidSize {
                expected: 32,
                got: payload_len as usize,
            });
        }
        let mut token = [0u8; 32];
        token.copy_from_slice(&buf[4..36]);
        Ok(Self { token })
    }
}

/// `version:u8 | type:u8(=2) | status:u8(=0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionVerifyResponse {
    pub status: u8,
}

impl SessionVerifyResponse {
    pub const LEN: usize = 3;

    pub fn encode(&self) -> [u8; Self::LEN] {
        [SECURITY1_VERSION, MSG_SESSION_VERIFY, self.status]
    }
}
