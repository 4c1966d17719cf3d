use base64::{engine::general_purpose, Engine as _};
use std::fmt;

pub const FRAME_MARKER: u8 = 0x00;
/// Marker byte plus the two u16 length fields.
pub const MIN_FRAME_LEN: usize = 5;
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

const KEY_PREFIX: [u8; 3] = [0x00, 0x00, 0x00];
const AUTH_PREFIX: [u8; 2] = [0x64, 0x00];

const WAITING: &[u8] = &[0x0A, 0x00, 0x01, 0x00, 0x00, 0x00];
const REQUESTED: &[u8] = &[0x0A, 0x00, 0x02, 0x00, 0x00, 0x00];
const DISCONNECTED: &[u8] = &[0x0A, 0x00, 0x15, 0x00, 0x00, 0x00];
const DENIED: &[u8] = &[0x64, 0x00, 0x00, 0x00];
const GRANTED: &[u8] = &[0x64, 0x00, 0x01, 0x00];
const TIMEOUT: &[u8] = &[0x65, 0x00];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    FieldTooLong { field: &'static str, len: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldTooLong { field, len } => {
                write!(f, "{field} is {len} bytes (max {MAX_FIELD_LEN})")
            }
        }
    }
}

impl std::error::Error for CodecError {}

fn put_prefixed(buf: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_b64(buf: &mut Vec<u8>, field: &'static str, raw: &str) -> Result<(), CodecError> {
    let encoded = general_purpose::STANDARD.encode(raw.as_bytes());
    put_prefixed(buf, field, encoded.as_bytes())
}

/// `0x00 | u16le len(tag) | tag | u16le len(payload) | payload`
pub fn encode_frame(tag: &[u8], payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + tag.len() + payload.len());
    frame.push(FRAME_MARKER);
    put_prefixed(&mut frame, "tag", tag)?;
    put_prefixed(&mut frame, "payload", payload)?;
    Ok(frame)
}

pub fn key_payload(key_code: &str) -> Result<Vec<u8>, CodecError> {
    let mut payload = KEY_PREFIX.to_vec();
    put_b64(&mut payload, "key code", key_code)?;
    Ok(payload)
}

pub fn auth_payload(
    client_ip: &str,
    hardware_address: &str,
    remote_name: &str,
) -> Result<Vec<u8>, CodecError> {
    let mut payload = AUTH_PREFIX.to_vec();
    put_b64(&mut payload, "client address", client_ip)?;
    put_b64(&mut payload, "hardware address", hardware_address)?;
    put_b64(&mut payload, "remote name", remote_name)?;
    Ok(payload)
}

/// Iterates the payloads of every complete frame in `buf`.
pub fn decode_frames(buf: &[u8]) -> Payloads<'_> {
    Payloads {
        rest: buf,
        truncated: false,
    }
}

/// Lazy payload sequence over a receive buffer.
///
/// Iteration stops at the first frame whose declared lengths run past the end
/// of the buffer; that tail stays in [`Payloads::remainder`] and
/// [`Payloads::is_truncated`] reports it. A tail shorter than
/// [`MIN_FRAME_LEN`] is left in the remainder without being flagged.
#[derive(Debug, Clone)]
pub struct Payloads<'a> {
    rest: &'a [u8],
    truncated: bool,
}

impl<'a> Payloads<'a> {
    pub fn remainder(&self) -> &'a [u8] {
        self.rest
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

fn read_u16_le(buf: &[u8], at: usize) -> Option<usize> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
}

impl<'a> Iterator for Payloads<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.truncated || self.rest.len() < MIN_FRAME_LEN {
            return None;
        }
        let buf = self.rest;
        let tag_len = read_u16_le(buf, 1)?;
        let payload_len_at = 3 + tag_len;
        let Some(payload_len) = read_u16_le(buf, payload_len_at) else {
            self.truncated = true;
            return None;
        };
        let start = payload_len_at + 2;
        let end = start + payload_len;
        if end > buf.len() {
            self.truncated = true;
            return None;
        }
        self.rest = &buf[end..];
        Some(&buf[start..end])
    }
}

/// Status payloads the TV sends during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMarker {
    Waiting,
    Requested,
    Disconnected,
    Denied,
    Granted,
    Timeout,
    Other,
}

impl ResponseMarker {
    const KNOWN: [Self; 6] = [
        Self::Waiting,
        Self::Requested,
        Self::Disconnected,
        Self::Granted,
        Self::Denied,
        Self::Timeout,
    ];

    /// Matched as prefixes; the TV may append status bytes.
    pub fn classify(payload: &[u8]) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|marker| payload.starts_with(marker.as_bytes()))
            .unwrap_or(Self::Other)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Waiting | Self::Requested)
    }

    /// The TV has answered the pairing request one way or the other.
    pub fn is_verdict(self) -> bool {
        matches!(self, Self::Granted | Self::Denied | Self::Timeout)
    }

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Waiting => WAITING,
            Self::Requested => REQUESTED,
            Self::Disconnected => DISCONNECTED,
            Self::Denied => DENIED,
            Self::Granted => GRANTED,
            Self::Timeout => TIMEOUT,
            Self::Other => &[],
        }
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
