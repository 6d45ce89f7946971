use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{decode_message, encode_message, CodecLimits};
use crate::error::{FrameError, Result};
use crate::message::Message;

/// Length prefix (4) + kind (1) + correlation id (8).
pub const HEADER_SIZE: usize = 13;

/// Bytes counted by the length prefix before the message body: kind + correlation id.
const ENVELOPE_PREFIX: usize = 9;

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    Request = 1,
    Response = 2,
    Notification = 3,
    Heartbeat = 4,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Notification => "NOTIFICATION",
            Self::Heartbeat => "HEARTBEAT",
        }
    }
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Notification),
            4 => Ok(Self::Heartbeat),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message plus its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Pairs a REQUEST with its RESPONSE. Zero for notifications.
    pub correlation_id: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, correlation_id: u64, message: Message) -> Self {
        Self {
            kind,
            correlation_id,
            message,
        }
    }

    pub fn request(correlation_id: u64, message: Message) -> Self {
        Self::new(EnvelopeKind::Request, correlation_id, message)
    }

    pub fn response(correlation_id: u64, message: Message) -> Self {
        Self::new(EnvelopeKind::Response, correlation_id, message)
    }

    pub fn notification(message: Message) -> Self {
        Self::new(EnvelopeKind::Notification, 0, message)
    }

    pub fn heartbeat(sequence: u64, message: Message) -> Self {
        Self::new(EnvelopeKind::Heartbeat, sequence, message)
    }

    /// Total wire size of this envelope.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.message.encoded_len()
    }
}

/// Encode an envelope into the wire format.
///
/// Wire format (little-endian):
/// ```text
/// ┌──────────────┬──────────┬─────────────────┬──────────────────────┐
/// │ Length (4B)  │ Kind (1B)│ Correlation (8B)│ Message (Length-9 B) │
/// └──────────────┴──────────┴─────────────────┴──────────────────────┘
/// ```
/// `Length` counts every byte after itself and is bounded by
/// `limits.max_message_size`.
pub fn encode_envelope(envelope: &Envelope, limits: &CodecLimits, dst: &mut BytesMut) -> Result<()> {
    let frame_len = ENVELOPE_PREFIX + envelope.message.encoded_len();
    let cap = limits.max_message_size.min(u32::MAX as usize);
    if frame_len > cap {
        return Err(FrameError::OversizedMessage {
            size: frame_len,
            max: cap,
        });
    }

    dst.reserve(4 + frame_len);
    let start = dst.len();
    dst.put_u32_le(frame_len as u32);
    dst.put_u8(envelope.kind as u8);
    dst.put_u64_le(envelope.correlation_id);
    if let Err(err) = encode_message(&envelope.message, limits, dst) {
        dst.truncate(start);
        return Err(err);
    }
    Ok(())
}

/// Decode an envelope from the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// A frame that is complete but invalid is consumed before the error is
/// returned, so the stream stays aligned on the next frame. An oversized
/// declared length is reported before any payload is buffered; see
/// [`rejected_frame_len`] for how readers skip it.
pub fn decode_envelope(src: &mut BytesMut, limits: &CodecLimits) -> Result<Option<Envelope>> {
    if src.len() < 4 {
        return Ok(None);
    }

    let frame_len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if let Some(err) = check_frame_len(frame_len, limits) {
        return Err(err);
    }

    if src.len() < 4 + frame_len {
        return Ok(None);
    }

    src.advance(4);
    let mut frame = src.split_to(frame_len).freeze();
    let kind = EnvelopeKind::try_from(frame.get_u8())?;
    let correlation_id = frame.get_u64_le();
    let message = decode_message(frame, limits)?;

    Ok(Some(Envelope {
        kind,
        correlation_id,
        message,
    }))
}

fn check_frame_len(frame_len: usize, limits: &CodecLimits) -> Option<FrameError> {
    let cap = limits.max_message_size.min(u32::MAX as usize);
    if frame_len > cap {
        return Some(FrameError::OversizedMessage {
            size: frame_len,
            max: cap,
        });
    }
    if frame_len < ENVELOPE_PREFIX + 4 {
        return Some(FrameError::malformed(format!(
            "frame length {frame_len} is shorter than the minimum envelope"
        )));
    }
    None
}

/// If `src` starts with a header that [`decode_envelope`] rejects without
/// consuming (declared length oversized or too short to be an envelope),
/// return the number of bytes, header included, a reader must discard to
/// get back in step with the stream.
pub fn rejected_frame_len(src: &[u8], limits: &CodecLimits) -> Option<usize> {
    let header: [u8; 4] = src.get(..4)?.try_into().ok()?;
    let frame_len = u32::from_le_bytes(header) as usize;
    check_frame_len(frame_len, limits).map(|_| 4 + frame_len)
}
