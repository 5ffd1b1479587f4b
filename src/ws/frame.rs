//! WebSocket frame codec (RFC 6455 Section 5.2-5.3)
//!
//! Pure conversion between payloads and wire bytes. The codec performs no
//! buffering of its own; [`decode`] pulls exactly the bytes a frame declares
//! from the reader it is given.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload that fits in the 7-bit length field
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Largest payload that fits in the 16-bit extended length field
pub const MAX_MEDIUM_PAYLOAD: usize = 65535;

/// Length indicator announcing a 16-bit extended length
const LENGTH_16: u8 = 126;

/// Length indicator announcing a 64-bit extended length
const LENGTH_64: u8 = 127;

/// Normal closure status code
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint is going away (server shutdown)
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Peer was refused admission
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Errors produced while decoding a frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Stream ended before a frame header")]
    Eof,

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Close, Ping and Pong are control opcodes
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// Which end of the connection is producing frames.
///
/// Clients must mask every frame they send; servers must never mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A single decoded frame. The payload is always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    pub opcode: Opcode,
    /// Mask key the sender used, present iff the MASK bit was set
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }
}

/// XOR the payload with the key, cycling every four bytes.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Encode a final frame for the given role.
///
/// Client frames get a fresh random mask key, server frames are sent verbatim.
pub fn encode(payload: &[u8], opcode: Opcode, role: Role) -> Vec<u8> {
    let mask_key = match role {
        Role::Client => Some(rand::random::<[u8; 4]>()),
        Role::Server => None,
    };
    encode_frame(payload, opcode, true, mask_key)
}

/// Encode a frame with explicit FIN bit and mask key.
///
/// The length field always uses the shortest form that fits the payload.
pub fn encode_frame(
    payload: &[u8],
    opcode: Opcode,
    fin: bool,
    mask_key: Option<[u8; 4]>,
) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);

    let fin_bit = if fin { 0x80 } else { 0x00 };
    out.push(fin_bit | opcode as u8);

    let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
    if len <= MAX_SHORT_PAYLOAD {
        out.push(mask_bit | len as u8);
    } else if len <= MAX_MEDIUM_PAYLOAD {
        out.push(mask_bit | LENGTH_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LENGTH_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }

    out
}

/// Decode one frame from the reader.
///
/// Fails with [`FrameError::Eof`] if the stream ends cleanly before the first
/// header byte, and with [`FrameError::Malformed`] if it ends anywhere after
/// that or the header violates the wire format.
pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R, max_payload: u64) -> FrameResult<Frame> {
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Err(FrameError::Eof);
    }

    let mut second = [0u8; 1];
    read_exact(reader, &mut second, "header").await?;

    let fin = first[0] & 0x80 != 0;
    if first[0] & 0x70 != 0 {
        return Err(FrameError::Malformed(
            "reserved bits set without a negotiated extension".to_string(),
        ));
    }
    let opcode = Opcode::from_u8(first[0] & 0x0F).ok_or_else(|| {
        FrameError::Malformed(format!("unknown opcode 0x{:X}", first[0] & 0x0F))
    })?;

    let masked = second[0] & 0x80 != 0;
    let payload_len = match second[0] & 0x7F {
        LENGTH_16 => {
            let mut buf = [0u8; 2];
            read_exact(reader, &mut buf, "16-bit length").await?;
            u16::from_be_bytes(buf) as u64
        }
        LENGTH_64 => {
            let mut buf = [0u8; 8];
            read_exact(reader, &mut buf, "64-bit length").await?;
            let len = u64::from_be_bytes(buf);
            if len >> 63 != 0 {
                return Err(FrameError::Malformed(
                    "most significant bit of 64-bit length is set".to_string(),
                ));
            }
            len
        }
        short => short as u64,
    };

    if payload_len > max_payload {
        return Err(FrameError::Malformed(format!(
            "payload length {} exceeds maximum {}",
            payload_len, max_payload
        )));
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        read_exact(reader, &mut key, "mask key").await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    read_exact(reader, &mut payload, "payload").await?;

    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Frame {
        fin,
        opcode,
        mask_key,
        payload,
    })
}

async fn read_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> FrameResult<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Malformed(
            format!("stream ended while reading {}", what),
        )),
        Err(e) => Err(FrameError::Io(e)),
    }
}

/// Build a Close payload: 2-byte big-endian status code followed by a UTF-8 reason
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Status code carried by a Close payload, if any
pub fn close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}
