//! Tokio codec for envelopes, for use with `tokio_util::codec::Framed`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::CodecLimits;
use crate::envelope::{decode_envelope, encode_envelope, rejected_frame_len, Envelope};
use crate::error::FrameError;

/// Envelope framing over any `AsyncRead`/`AsyncWrite`.
///
/// Rejected frames are reported once as an item error and skipped; the
/// stream can keep being polled afterwards.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    limits: CodecLimits,
    discard: usize,
}

impl EnvelopeCodec {
    pub fn new(limits: CodecLimits) -> Self {
        Self { limits, discard: 0 }
    }

    pub fn limits(&self) -> &CodecLimits {
        &self.limits
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.discard > 0 {
            let n = self.discard.min(src.len());
            src.advance(n);
            self.discard -= n;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        match decode_envelope(src, &self.limits) {
            Ok(item) => Ok(item),
            Err(err) => {
                if let Some(skip) = rejected_frame_len(src, &self.limits) {
                    let n = skip.min(src.len());
                    src.advance(n);
                    self.discard = skip - n;
                }
                Err(err)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() && self.discard == 0 => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_envelope(&item, &self.limits, dst)
    }
}

impl Encoder<&Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_envelope(item, &self.limits, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::message::Message;

    #[test]
    fn codec_roundtrip() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();

        let env = Envelope::request(11, Message::new().with(1, "ping"));
        codec.encode(env.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, env);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_skipped_across_chunks() {
        let small = CodecLimits {
            max_message_size: 64,
            ..CodecLimits::default()
        };
        let mut codec = EnvelopeCodec::new(small);

        let mut wire = BytesMut::new();
        let big = Envelope::request(1, Message::new().with(1, vec![1u8; 512]));
        encode_envelope(&big, &CodecLimits::default(), &mut wire).unwrap();
        encode_envelope(&Envelope::response(2, Message::new()), &small, &mut wire).unwrap();

        let mut src = BytesMut::from(&wire[..100]);
        let rest = wire.split_off(100);

        assert!(matches!(
            codec.decode(&mut src),
            Err(FrameError::OversizedMessage { .. })
        ));
        assert!(src.is_empty());

        src.extend_from_slice(&rest);
        let next = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(next.kind, EnvelopeKind::Response);
        assert_eq!(next.correlation_id, 2);
    }

    #[test]
    fn truncated_stream_at_eof_is_error() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Envelope::notification(Message::new()), &mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn framed_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(client, EnvelopeCodec::default());
        let mut stream = FramedRead::new(server, EnvelopeCodec::default());

        let writer = tokio::spawn(async move {
            for id in 1..=5u64 {
                let msg = Message::new().with(1, id as i64);
                sink.send(Envelope::request(id, msg)).await.unwrap();
            }
        });

        for id in 1..=5u64 {
            let env = stream.next().await.unwrap().unwrap();
            assert_eq!(env.correlation_id, id);
            assert_eq!(env.message.get_i64(1), Some(id as i64));
        }
        writer.await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
