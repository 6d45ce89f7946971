use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};
use hostlink_transport::IpcStream;
use tracing::trace;

use crate::codec::{CodecLimits, FrameConfig};
use crate::envelope::{decode_envelope, rejected_frame_len, Envelope};
use crate::error::{FrameError, Result};

const BUFFER_CAPACITY: usize = 8 * 1024;
const CHUNK: usize = 8 * 1024;

/// Reads complete envelopes from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete envelopes.
/// A rejected frame is reported once and then dropped from the stream; for
/// an oversized frame the payload is discarded as it arrives instead of
/// being buffered.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    /// Bytes of a rejected frame still to be thrown away.
    discard: usize,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(BUFFER_CAPACITY),
            config,
            discard: 0,
        }
    }

    /// Read the next complete envelope (blocking).
    ///
    /// EOF surfaces as [`FrameError::ConnectionClosed`], including EOF in
    /// the middle of a frame.
    /// Protocol errors ([`FrameError::is_protocol`]) affect only the frame
    /// they describe; the next call continues with the following frame.
    pub fn read_envelope(&mut self) -> Result<Envelope> {
        loop {
            self.drain_discard();
            if self.discard == 0 {
                match decode_envelope(&mut self.buf, &self.config.limits) {
                    Ok(Some(envelope)) => return Ok(envelope),
                    Ok(None) => {}
                    Err(err) => {
                        if let Some(skip) = rejected_frame_len(&self.buf, &self.config.limits) {
                            self.discard = skip;
                            self.drain_discard();
                        }
                        return Err(err);
                    }
                }
            }

            self.fill()?;
        }
    }

    /// Append at least one byte from the stream to the buffer.
    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn drain_discard(&mut self) {
        if self.discard == 0 {
            return;
        }
        let n = self.discard.min(self.buf.len());
        self.buf.advance(n);
        self.discard -= n;
        if n > 0 {
            trace!(dropped = n, remaining = self.discard, "discarding rejected frame bytes");
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap the stream. Buffered bytes are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Replace the codec limits; applies from the next frame header on.
    pub fn set_limits(&mut self, limits: CodecLimits) {
        self.config.limits = limits;
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Like [`with_config`](Self::with_config), also applying
    /// `config.read_timeout` to the socket.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout of the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.config.read_timeout = timeout;
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)
    }
}

pub(crate) fn transport_to_frame_error(err: hostlink_transport::TransportError) -> FrameError {
    match err {
        hostlink_transport::TransportError::Io(io)
        | hostlink_transport::TransportError::Accept(io) => FrameError::Io(io),
        hostlink_transport::TransportError::Bind { source, .. }
        | hostlink_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        hostlink_transport::TransportError::BrokenPipe => {
            FrameError::Io(std::io::Error::from(ErrorKind::BrokenPipe))
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::envelope::{encode_envelope, EnvelopeKind};
    use crate::message::Message;
    use crate::writer::FrameWriter;

    fn wire(envelopes: &[Envelope]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for env in envelopes {
            encode_envelope(env, &CodecLimits::default(), &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_multiple_envelopes() {
        let bytes = wire(&[
            Envelope::request(1, Message::new().with(1, "one")),
            Envelope::response(1, Message::new().with(1, "two")),
            Envelope::notification(Message::new().with(0, "topic")),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let a = reader.read_envelope().unwrap();
        let b = reader.read_envelope().unwrap();
        let c = reader.read_envelope().unwrap();
        assert_eq!((a.kind, a.message.get_str(1)), (EnvelopeKind::Request, Some("one")));
        assert_eq!((b.kind, b.message.get_str(1)), (EnvelopeKind::Response, Some("two")));
        assert_eq!(c.kind, EnvelopeKind::Notification);
        assert!(matches!(
            reader.read_envelope(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn large_payload() {
        let payload = vec![0xAB; 64 * 1024];
        let bytes = wire(&[Envelope::request(9, Message::new().with(1, payload.clone()))]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let env = reader.read_envelope().unwrap();
        assert_eq!(env.correlation_id, 9);
        assert_eq!(env.message.get_bytes(1).unwrap().as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let bytes = wire(&[Envelope::request(4, Message::new().with(1, "slow"))]);
        let mut reader = FrameReader::new(ByteByByteReader { bytes, pos: 0 });

        let env = reader.read_envelope().unwrap();
        assert_eq!(env.correlation_id, 4);
        assert_eq!(env.message.get_str(1), Some("slow"));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut bytes = wire(&[Envelope::request(1, Message::new().with(1, "cut"))]);
        bytes.truncate(bytes.len() - 2);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_envelope(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn oversized_frame_skipped_without_desync() {
        let small = CodecLimits {
            max_message_size: 128,
            ..CodecLimits::default()
        };
        let mut bytes = BytesMut::new();
        encode_envelope(
            &Envelope::request(1, Message::new().with(1, vec![7u8; 4096])),
            &CodecLimits::default(),
            &mut bytes,
        )
        .unwrap();
        encode_envelope(&Envelope::request(2, Message::new().with(1, "ok")), &small, &mut bytes)
            .unwrap();

        let cfg = FrameConfig {
            limits: small,
            ..FrameConfig::default()
        };
        let reader = ByteByByteReader {
            bytes: bytes.to_vec(),
            pos: 0,
        };
        let mut reader = FrameReader::with_config(reader, cfg);

        let err = reader.read_envelope().unwrap_err();
        assert!(matches!(err, FrameError::OversizedMessage { .. }));
        let next = reader.read_envelope().unwrap();
        assert_eq!(next.correlation_id, 2);
        assert_eq!(next.message.get_str(1), Some("ok"));
    }

    #[test]
    fn malformed_frame_skipped_without_desync() {
        let mut bytes = BytesMut::new();
        bytes.put_u32_le(9 + 4);
        bytes.put_u8(0xEE);
        bytes.put_u64_le(1);
        bytes.put_u32_le(0);
        encode_envelope(&Envelope::response(5, Message::new()), &CodecLimits::default(), &mut bytes)
            .unwrap();

        let mut reader = FrameReader::new(Cursor::new(bytes.to_vec()));
        assert!(matches!(
            reader.read_envelope(),
            Err(FrameError::UnknownKind(0xEE))
        ));
        assert_eq!(reader.read_envelope().unwrap().correlation_id, 5);
    }

    #[test]
    fn interrupted_read_retries() {
        let bytes = wire(&[Envelope::heartbeat(8, Message::new())]);
        let mut framed = FrameReader::new(FlakyReader {
            fail_with: Some(ErrorKind::Interrupted),
            bytes,
            pos: 0,
        });
        assert_eq!(framed.read_envelope().unwrap().correlation_id, 8);
    }

    #[test]
    fn would_block_propagates_and_resumes() {
        let bytes = wire(&[Envelope::heartbeat(3, Message::new())]);
        let mut framed = FrameReader::new(FlakyReader {
            fail_with: Some(ErrorKind::WouldBlock),
            bytes,
            pos: 0,
        });
        let err = framed.read_envelope().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(framed.read_envelope().unwrap().correlation_id, 3);
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_socket_pair() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let sender = std::thread::spawn(move || {
            for id in 0..64u64 {
                let msg = Message::new().with(1, format!("msg-{id}"));
                writer.write_envelope(&Envelope::request(id, msg)).unwrap();
            }
        });

        for id in 0..64u64 {
            let env = reader.read_envelope().unwrap();
            assert_eq!(env.correlation_id, id);
            assert_eq!(env.message.get_str(1), Some(format!("msg-{id}").as_str()));
        }
        sender.join().unwrap();
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        reader.set_limits(CodecLimits {
            max_message_size: 99,
            max_nesting_depth: 2,
        });
        assert_eq!(reader.config().limits.max_message_size, 99);
        let _inner = reader.into_inner();
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct FlakyReader {
        fail_with: Option<ErrorKind>,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.fail_with.take() {
                return Err(std::io::Error::from(kind));
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
