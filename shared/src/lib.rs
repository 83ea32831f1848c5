//! Wire protocol and message types shared by the chat server and client.
//!
//! A frame on the wire is `type(1) | length(4, big-endian) | payload`.
//! Broadcast frames carry a structured payload built by [`make_broadcast`].

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: 1 type byte + 4 length bytes.
pub const FRAME_HEADER_LEN: usize = 5;

/// Upper bound a peer may declare for a single frame payload (1 MiB).
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Fixed overhead a broadcast payload adds on top of the message text:
/// timestamp, username length field, maximum username, text length field.
/// Clients accept `MAX_PAYLOAD_LEN + BROADCAST_OVERHEAD` so a maximal
/// message survives the trip back.
pub const BROADCAST_OVERHEAD: u32 = 8 + 2 + u16::MAX as u32 + 4;

/// Upper bound for a HELLO payload (username bytes).
pub const MAX_HELLO_LEN: usize = 1024;

/// Wire frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Msg = 0x02,
    Err = 0x05,
    Ok = 0x06,
    Broadcast = 0x12,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(FrameType::Hello),
            0x02 => Some(FrameType::Msg),
            0x05 => Some(FrameType::Err),
            0x06 => Some(FrameType::Ok),
            0x12 => Some(FrameType::Broadcast),
            _ => None,
        }
    }
}

/// One decoded frame. The type byte is kept raw so unknown types can be
/// carried (and ignored) instead of failing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type: frame_type as u8,
            payload,
        }
    }

    pub fn is(&self, frame_type: FrameType) -> bool {
        self.frame_type == frame_type as u8
    }

    /// Serializes the frame header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.frame_type, &self.payload)
    }
}

pub fn encode_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.push(frame_type);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Outcome of reading one frame off a stream.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// The peer closed the connection (short read on header or payload).
    Closed,
    /// The header declared a payload above [`MAX_PAYLOAD_LEN`]. No payload
    /// bytes have been consumed.
    Oversized(u32),
}

/// Reads exactly one frame under the default [`MAX_PAYLOAD_LEN`] ceiling.
/// A short read is reported as `Closed`, not as an error; an oversized
/// declared length is reported before any payload byte is read so the
/// caller can answer and tear the connection down.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<FrameRead> {
    read_frame_limited(reader, MAX_PAYLOAD_LEN).await
}

/// [`read_frame`] with an explicit payload ceiling.
pub async fn read_frame_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: u32,
) -> io::Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameRead::Closed),
        Err(e) => return Err(e),
    }

    let frame_type = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > limit {
        return Ok(FrameRead::Oversized(len));
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        match reader.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameRead::Closed),
            Err(e) => return Err(e),
        }
    }

    Ok(FrameRead::Frame(Frame {
        frame_type,
        payload,
    }))
}

/// Writes one frame (header + payload) as a single buffer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_type: FrameType,
    payload: &[u8],
) -> io::Result<()> {
    let buf = encode_frame(frame_type as u8, payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Builds the broadcast payload:
/// `ts_ms(8 BE) | ulen(2 BE) | username | mlen(4 BE) | text`.
///
/// The username is truncated to 65535 bytes since the wire field is 16 bits;
/// the text length field is 32 bits and is not clamped.
pub fn make_broadcast(ts_ms: u64, user: &str, text: &str) -> Vec<u8> {
    let user = user.as_bytes();
    let text = text.as_bytes();
    let ulen = user.len().min(u16::MAX as usize);

    let mut payload = Vec::with_capacity(8 + 2 + ulen + 4 + text.len());
    payload.extend_from_slice(&ts_ms.to_be_bytes());
    payload.extend_from_slice(&(ulen as u16).to_be_bytes());
    payload.extend_from_slice(&user[..ulen]);
    payload.extend_from_slice(&(text.len() as u32).to_be_bytes());
    payload.extend_from_slice(text);
    payload
}

/// Parses a broadcast payload back into `(ts_ms, username, text)`.
/// Returns `None` on any truncated or length-inconsistent layout.
pub fn parse_broadcast(payload: &[u8]) -> Option<(u64, String, String)> {
    if payload.len() < 8 + 2 {
        return None;
    }
    let ts_ms = u64::from_be_bytes(payload[0..8].try_into().ok()?);
    let ulen = u16::from_be_bytes(payload[8..10].try_into().ok()?) as usize;

    let text_len_at = 10 + ulen;
    if payload.len() < text_len_at + 4 {
        return None;
    }
    let user = String::from_utf8_lossy(&payload[10..text_len_at]).into_owned();

    let mlen = u32::from_be_bytes(payload[text_len_at..text_len_at + 4].try_into().ok()?) as usize;
    let text_at = text_len_at + 4;
    if payload.len() != text_at + mlen {
        return None;
    }
    let text = String::from_utf8_lossy(&payload[text_at..]).into_owned();

    Some((ts_ms, user, text))
}

/// One chat message as stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub ts_ms: u64,
    pub user: String,
    pub text: String,
    /// FNV-1a-64 digest over `ts|user|text|secret`, hex-encoded. A
    /// tamper-evidence stamp against casual log edits, not a MAC.
    pub tag_hex: String,
}

impl Message {
    /// Creates a message and stamps its integrity tag.
    pub fn signed(ts_ms: u64, user: String, text: String, secret: &str) -> Self {
        let tag_hex = integrity_tag(ts_ms, &user, &text, secret);
        Self {
            ts_ms,
            user,
            text,
            tag_hex,
        }
    }
}

pub fn integrity_tag(ts_ms: u64, user: &str, text: &str, secret: &str) -> String {
    let signed = format!("{}|{}|{}|{}", ts_ms, user, text, secret);
    hex64(fnv1a64(signed.as_bytes()))
}

pub fn fnv1a64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn hex64(value: u64) -> String {
    format!("{:016x}", value)
}

/// Escapes a field for one tab-separated log record.
pub fn escape_tsv(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverses [`escape_tsv`]. Unknown escapes are kept verbatim.
pub fn unescape_tsv(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
