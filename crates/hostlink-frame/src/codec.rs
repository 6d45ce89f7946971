use std::collections::HashSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::message::{
    Field, Message, Value, FIELD_HEADER_SIZE, MESSAGE_HEADER_SIZE, TYPE_BYTES, TYPE_DOUBLE,
    TYPE_INT32, TYPE_INT64, TYPE_MESSAGE, TYPE_STRING,
};

/// Default maximum frame size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum nesting depth (a flat message has depth 1).
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 16;

/// Size and depth bounds applied by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Upper bound for an encoded message and for a frame's declared length.
    pub max_message_size: usize,
    /// Deepest accepted nesting.
    pub max_nesting_depth: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

impl CodecLimits {
    /// Effective size bound (lengths are 32-bit on the wire).
    fn size_cap(&self) -> usize {
        self.max_message_size.min(u32::MAX as usize)
    }
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    pub limits: CodecLimits,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

/// Encode a message body.
///
/// Wire format (all integers little-endian):
/// ```text
/// message := body_len:u32  field*
/// field   := tag:u32  type:u8  value_len:u32  value[value_len]
/// ```
/// Nested messages are encoded recursively as the value of a type-6 field,
/// so every level carries its own total length.
pub fn encode_message(message: &Message, limits: &CodecLimits, dst: &mut BytesMut) -> Result<()> {
    let size = message.encoded_len();
    if size > limits.size_cap() {
        return Err(FrameError::OversizedMessage {
            size,
            max: limits.size_cap(),
        });
    }
    let depth = message.depth();
    if depth > limits.max_nesting_depth {
        return Err(FrameError::malformed(format!(
            "nesting depth {depth} exceeds limit {}",
            limits.max_nesting_depth
        )));
    }

    dst.reserve(size);
    write_message(message, dst);
    Ok(())
}

// Sizes were validated against a u32 cap before writing.
fn write_message(message: &Message, dst: &mut BytesMut) {
    dst.put_u32_le((message.encoded_len() - MESSAGE_HEADER_SIZE) as u32);
    for field in message {
        dst.put_u32_le(field.tag);
        dst.put_u8(field.value.type_code());
        dst.put_u32_le(field.value.encoded_len() as u32);
        match &field.value {
            Value::Int32(v) => dst.put_i32_le(*v),
            Value::Int64(v) => dst.put_i64_le(*v),
            Value::Double(v) => dst.put_f64_le(*v),
            Value::String(v) => dst.put_slice(v.as_bytes()),
            Value::Bytes(v) => dst.put_slice(v),
            Value::Message(v) => write_message(v, dst),
        }
    }
}

/// Decode one message occupying exactly `src`.
///
/// Every declared length is checked against the bytes actually present (and
/// the configured maximum) before anything is read or copied.
pub fn decode_message(src: Bytes, limits: &CodecLimits) -> Result<Message> {
    decode_at(src, 1, limits)
}

fn decode_at(mut src: Bytes, depth: usize, limits: &CodecLimits) -> Result<Message> {
    if depth > limits.max_nesting_depth {
        return Err(FrameError::malformed(format!(
            "nesting depth exceeds limit {}",
            limits.max_nesting_depth
        )));
    }
    if src.len() < MESSAGE_HEADER_SIZE {
        return Err(FrameError::malformed("truncated message header"));
    }

    let body_len = src.get_u32_le() as usize;
    let declared = body_len.saturating_add(MESSAGE_HEADER_SIZE);
    if declared > limits.size_cap() {
        return Err(FrameError::OversizedMessage {
            size: declared,
            max: limits.size_cap(),
        });
    }
    if body_len != src.len() {
        return Err(FrameError::malformed(format!(
            "declared body length {body_len} but {} bytes present",
            src.len()
        )));
    }

    let mut fields = Vec::new();
    let mut seen = HashSet::new();
    while src.has_remaining() {
        if src.len() < FIELD_HEADER_SIZE {
            return Err(FrameError::malformed("truncated field header"));
        }
        let tag = src.get_u32_le();
        let type_code = src.get_u8();
        let value_len = src.get_u32_le() as usize;
        if value_len > src.len() {
            return Err(FrameError::malformed(format!(
                "field {tag} declares {value_len} bytes but {} remain",
                src.len()
            )));
        }
        if !seen.insert(tag) {
            return Err(FrameError::malformed(format!("duplicate tag {tag}")));
        }

        let raw = src.split_to(value_len);
        let value = decode_value(tag, type_code, raw, depth, limits)?;
        fields.push(Field { tag, value });
    }

    Ok(Message::from_fields(fields))
}

fn decode_value(
    tag: u32,
    type_code: u8,
    mut raw: Bytes,
    depth: usize,
    limits: &CodecLimits,
) -> Result<Value> {
    let actual = raw.len();
    let expect_width = move |width: usize| {
        if actual == width {
            Ok(())
        } else {
            Err(FrameError::malformed(format!(
                "field {tag}: type {type_code} needs {width} bytes, got {actual}"
            )))
        }
    };

    match type_code {
        TYPE_INT32 => {
            expect_width(4)?;
            Ok(Value::Int32(raw.get_i32_le()))
        }
        TYPE_INT64 => {
            expect_width(8)?;
            Ok(Value::Int64(raw.get_i64_le()))
        }
        TYPE_DOUBLE => {
            expect_width(8)?;
            Ok(Value::Double(raw.get_f64_le()))
        }
        TYPE_STRING => std::str::from_utf8(&raw)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| FrameError::malformed(format!("field {tag}: invalid utf-8: {e}"))),
        TYPE_BYTES => Ok(Value::Bytes(raw)),
        TYPE_MESSAGE => decode_at(raw, depth + 1, limits).map(Value::Message),
        other => Err(FrameError::malformed(format!(
            "field {tag}: unknown type code {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let limits = CodecLimits::default();
        let mut buf = BytesMut::new();
        encode_message(msg, &limits, &mut buf).unwrap();
        assert_eq!(buf.len(), msg.encoded_len());
        decode_message(buf.freeze(), &limits).unwrap()
    }

    fn nested(depth: usize) -> Message {
        let mut msg = Message::new().with(1, "leaf");
        for level in 1..depth {
            msg = Message::new().with(level as u32, msg);
        }
        msg
    }

    #[test]
    fn roundtrip_all_types() {
        let msg = Message::new()
            .with(1, i32::MIN)
            .with(2, i64::MAX)
            .with(3, -0.125f64)
            .with(4, "héllo")
            .with(5, Bytes::from_static(b"\x00\x01\x00"))
            .with(6, Message::new().with(1, 7i32).with(2, "inner"));
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn roundtrip_empty_and_embedded_nulls() {
        assert_eq!(roundtrip(&Message::new()), Message::new());

        let msg = Message::new().with(1, "a\0b\0").with(2, "");
        let back = roundtrip(&msg);
        assert_eq!(back.get_str(1), Some("a\0b\0"));
        assert_eq!(back.get_str(2), Some(""));
    }

    #[test]
    fn roundtrip_at_depth_limit() {
        let msg = nested(DEFAULT_MAX_NESTING_DEPTH);
        assert_eq!(msg.depth(), DEFAULT_MAX_NESTING_DEPTH);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn encode_rejects_excess_depth() {
        let msg = nested(DEFAULT_MAX_NESTING_DEPTH + 1);
        let mut buf = BytesMut::new();
        let err = encode_message(&msg, &CodecLimits::default(), &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_excess_depth() {
        let msg = nested(5);
        let loose = CodecLimits::default();
        let mut buf = BytesMut::new();
        encode_message(&msg, &loose, &mut buf).unwrap();

        let strict = CodecLimits {
            max_nesting_depth: 4,
            ..loose
        };
        let err = decode_message(buf.freeze(), &strict).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
    }

    #[test]
    fn encode_rejects_oversized() {
        let limits = CodecLimits {
            max_message_size: 32,
            ..CodecLimits::default()
        };
        let msg = Message::new().with(1, "x".repeat(64));
        let mut buf = BytesMut::new();
        let err = encode_message(&msg, &limits, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::OversizedMessage { size, max: 32 } if size == msg.encoded_len()
        ));
    }

    #[test]
    fn decode_rejects_oversized_declared_length() {
        let limits = CodecLimits {
            max_message_size: 64,
            ..CodecLimits::default()
        };
        // Only the header is present; the claim alone must be rejected.
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX - 8);
        let err = decode_message(buf.freeze(), &limits).unwrap_err();
        assert!(matches!(err, FrameError::OversizedMessage { max: 64, .. }));
    }

    #[test]
    fn decode_rejects_truncation() {
        let msg = Message::new().with(1, "truncate me");
        let mut buf = BytesMut::new();
        encode_message(&msg, &CodecLimits::default(), &mut buf).unwrap();
        let full = buf.freeze();

        for cut in [0, 3, 4, 8, full.len() - 1] {
            let err = decode_message(full.slice(..cut), &CodecLimits::default()).unwrap_err();
            assert!(
                matches!(err, FrameError::MalformedMessage(_)),
                "cut at {cut}: {err:?}"
            );
        }
    }

    #[test]
    fn decode_rejects_inconsistent_width() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(9 + 3);
        buf.put_u32_le(1);
        buf.put_u8(TYPE_INT32);
        buf.put_u32_le(3);
        buf.put_slice(&[1, 2, 3]);
        let err = decode_message(buf.freeze(), &CodecLimits::default()).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
    }

    #[test]
    fn decode_rejects_field_overrun() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(9 + 2);
        buf.put_u32_le(1);
        buf.put_u8(TYPE_BYTES);
        buf.put_u32_le(1_000);
        buf.put_slice(&[1, 2]);
        let err = decode_message(buf.freeze(), &CodecLimits::default()).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
    }

    #[test]
    fn decode_rejects_unknown_type_duplicate_tag_and_bad_utf8() {
        let field = |buf: &mut BytesMut, tag: u32, ty: u8, value: &[u8]| {
            buf.put_u32_le(tag);
            buf.put_u8(ty);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value);
        };

        let mut unknown = BytesMut::new();
        unknown.put_u32_le(9 + 1);
        field(&mut unknown, 1, 99, &[0]);

        let mut dup = BytesMut::new();
        dup.put_u32_le(2 * (9 + 1));
        field(&mut dup, 1, TYPE_BYTES, &[0]);
        field(&mut dup, 1, TYPE_BYTES, &[1]);

        let mut utf8 = BytesMut::new();
        utf8.put_u32_le(9 + 2);
        field(&mut utf8, 1, TYPE_STRING, &[0xC3, 0x28]);

        for buf in [unknown, dup, utf8] {
            let err = decode_message(buf.freeze(), &CodecLimits::default()).unwrap_err();
            assert!(matches!(err, FrameError::MalformedMessage(_)), "{err:?}");
        }
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        encode_message(&Message::new().with(1, 1i32), &CodecLimits::default(), &mut buf).unwrap();
        buf.put_u8(0);
        let err = decode_message(buf.freeze(), &CodecLimits::default()).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
    }

    #[test]
    fn encoding_is_little_endian() {
        let mut buf = BytesMut::new();
        let msg = Message::new().with(0x0102, 0x0A0B0C0Di32);
        encode_message(&msg, &CodecLimits::default(), &mut buf).unwrap();
        assert_eq!(
            buf.as_ref(),
            &[
                13, 0, 0, 0, // body length
                0x02, 0x01, 0, 0, // tag
                TYPE_INT32, // type
                4, 0, 0, 0, // value length
                0x0D, 0x0C, 0x0B, 0x0A, // value
            ]
        );
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn scalar() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<i32>().prop_map(Value::Int32),
                any::<i64>().prop_map(Value::Int64),
                (-1.0e12f64..1.0e12).prop_map(Value::Double),
                ".{0,16}".prop_map(Value::String),
                prop::collection::vec(any::<u8>(), 0..32)
                    .prop_map(|raw| Value::Bytes(Bytes::from(raw))),
            ]
        }

        fn build(fields: Vec<(u32, Value)>) -> Message {
            fields
                .into_iter()
                .fold(Message::new(), |msg, (tag, value)| msg.with(tag, value))
        }

        /// Messages of every value type, nested up to the default depth limit.
        fn message() -> impl Strategy<Value = Message> {
            let leaf = prop::collection::vec((any::<u32>(), scalar()), 0..6).prop_map(build);
            leaf.prop_recursive(DEFAULT_MAX_NESTING_DEPTH as u32 - 1, 64, 4, |inner| {
                prop::collection::vec(
                    (
                        any::<u32>(),
                        prop_oneof![scalar(), inner.prop_map(Value::Message)],
                    ),
                    0..4,
                )
                .prop_map(build)
            })
        }

        proptest! {
            #[test]
            fn encode_then_decode_is_identity(msg in message()) {
                prop_assert!(msg.depth() <= DEFAULT_MAX_NESTING_DEPTH);
                let limits = CodecLimits::default();
                let mut buf = BytesMut::new();
                encode_message(&msg, &limits, &mut buf).unwrap();
                prop_assert_eq!(buf.len(), msg.encoded_len());
                prop_assert_eq!(decode_message(buf.freeze(), &limits).unwrap(), msg);
            }

            #[test]
            fn truncated_encoding_never_decodes(msg in message(), cut in any::<prop::sample::Index>()) {
                let limits = CodecLimits::default();
                let mut buf = BytesMut::new();
                encode_message(&msg, &limits, &mut buf).unwrap();
                let keep = cut.index(buf.len());
                prop_assert!(decode_message(buf.freeze().slice(..keep), &limits).is_err());
            }
        }
    }
}
