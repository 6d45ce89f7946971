//! Tagged binary messages and correlated envelope framing.
//!
//! Two layers live here:
//! - [`Message`]: an ordered set of tagged, typed fields with a compact
//!   little-endian encoding (`[u32 body_len]` then `[u32 tag][u8 type][u32 len][value]` per field).
//! - [`Envelope`]: a message plus its kind and correlation id, framed with a
//!   4-byte length prefix so it can be carried over any byte stream.
//!
//! [`FrameReader`] and [`FrameWriter`] move whole envelopes over blocking
//! streams. With the `async` feature, [`EnvelopeCodec`] does the same for
//! tokio streams.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::EnvelopeCodec;
pub use codec::{
    decode_message, encode_message, CodecLimits, FrameConfig, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_MAX_NESTING_DEPTH,
};
pub use envelope::{
    decode_envelope, encode_envelope, rejected_frame_len, Envelope, EnvelopeKind, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use message::{
    Field, Message, Value, TYPE_BYTES, TYPE_DOUBLE, TYPE_INT32, TYPE_INT64, TYPE_MESSAGE,
    TYPE_STRING,
};
pub use reader::FrameReader;
pub use writer::FrameWriter;
