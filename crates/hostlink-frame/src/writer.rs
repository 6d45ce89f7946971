use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use hostlink_transport::IpcStream;

use crate::codec::{CodecLimits, FrameConfig};
use crate::envelope::{encode_envelope, Envelope, EnvelopeKind};
use crate::error::{FrameError, Result};
use crate::message::Message;
use crate::reader::transport_to_frame_error;

const SCRATCH_CAPACITY: usize = 8 * 1024;

/// Writes complete envelopes to any `Write` stream.
///
/// Each envelope is encoded in full before the first byte goes out, so an
/// encoding failure never leaves a partial frame on the wire.
///
/// `Interrupted` is always retried. `WouldBlock` is retried only when no
/// write timeout is configured; with one, it means the timeout fired and is
/// returned to the caller (see [`FrameError::is_timeout`]).
pub struct FrameWriter<T> {
    inner: T,
    scratch: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            scratch: BytesMut::with_capacity(SCRATCH_CAPACITY),
            config,
        }
    }

    /// Encode `envelope` and write it out completely (blocking).
    pub fn write_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        self.scratch.clear();
        encode_envelope(envelope, &self.config.limits, &mut self.scratch)?;

        let mut remaining = &self.scratch[..];
        while !remaining.is_empty() {
            match self.inner.write(remaining) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => remaining = &remaining[n..],
                Err(err) if self.retryable(&err) => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Shorthand for building the envelope and writing it.
    pub fn send(&mut self, kind: EnvelopeKind, correlation_id: u64, message: Message) -> Result<()> {
        self.write_envelope(&Envelope::new(kind, correlation_id, message))
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if self.retryable(&err) => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn retryable(&self, err: &std::io::Error) -> bool {
        match err.kind() {
            ErrorKind::Interrupted => true,
            ErrorKind::WouldBlock => self.config.write_timeout.is_none(),
            _ => false,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Replace the codec limits applied to later envelopes.
    pub fn set_limits(&mut self, limits: CodecLimits) {
        self.config.limits = limits;
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<IpcStream> {
    /// Like [`with_config`](Self::with_config), also applying
    /// `config.write_timeout` to the socket.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::time::Duration;

    use super::*;
    use crate::envelope::decode_envelope;
    use crate::reader::FrameReader;

    fn decode_all(wire: &[u8]) -> Vec<Envelope> {
        let mut buf = BytesMut::from(wire);
        let mut out = Vec::new();
        while let Some(env) = decode_envelope(&mut buf, &CodecLimits::default()).unwrap() {
            out.push(env);
        }
        assert!(buf.is_empty());
        out
    }

    fn to_vec() -> FrameWriter<Cursor<Vec<u8>>> {
        FrameWriter::new(Cursor::new(Vec::new()))
    }

    /// Sink that fails calls according to a script, then accepts at most
    /// `chunk` bytes per write.
    #[derive(Default)]
    struct ScriptedSink {
        write_errors: VecDeque<ErrorKind>,
        flush_errors: VecDeque<ErrorKind>,
        chunk: Option<usize>,
        flushes: usize,
        data: Vec<u8>,
    }

    impl Write for ScriptedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.write_errors.pop_front() {
                return Err(kind.into());
            }
            let n = self.chunk.map_or(buf.len(), |chunk| chunk.min(buf.len()));
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if let Some(kind) = self.flush_errors.pop_front() {
                return Err(kind.into());
            }
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn envelopes_decode_in_order() {
        let mut writer = to_vec();
        writer
            .write_envelope(&Envelope::request(1, Message::new().with(1, "hello")))
            .unwrap();
        writer.send(EnvelopeKind::Response, 1, Message::new().with(1, "two")).unwrap();
        writer.send(EnvelopeKind::Heartbeat, 9, Message::new()).unwrap();

        let envs = decode_all(writer.get_ref().get_ref());
        let kinds: Vec<EnvelopeKind> = envs.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EnvelopeKind::Request, EnvelopeKind::Response, EnvelopeKind::Heartbeat]
        );
        assert_eq!(envs[0].message.get_str(1), Some("hello"));
        assert_eq!(envs[2].correlation_id, 9);
    }

    #[test]
    fn nothing_written_when_encoding_fails() {
        let too_small = FrameConfig {
            limits: CodecLimits {
                max_message_size: 16,
                ..CodecLimits::default()
            },
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), too_small);
        let err = writer
            .send(EnvelopeKind::Request, 1, Message::new().with(1, "oversized payload"))
            .unwrap_err();
        assert!(matches!(err, FrameError::OversizedMessage { .. }));
        assert!(writer.get_ref().get_ref().is_empty());

        let shallow = FrameConfig {
            limits: CodecLimits {
                max_nesting_depth: 1,
                ..CodecLimits::default()
            },
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), shallow);
        let err = writer
            .send(EnvelopeKind::Request, 1, Message::new().with(1, Message::new()))
            .unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn short_writes_and_interrupts_are_retried() {
        let sink = ScriptedSink {
            write_errors: VecDeque::from([ErrorKind::Interrupted]),
            flush_errors: VecDeque::from([ErrorKind::Interrupted]),
            chunk: Some(3),
            ..ScriptedSink::default()
        };
        let mut writer = FrameWriter::new(sink);
        writer.send(EnvelopeKind::Request, 5, Message::new().with(1, "retry")).unwrap();

        let sink = writer.into_inner();
        assert_eq!(sink.flushes, 1);
        assert_eq!(decode_all(&sink.data)[0].correlation_id, 5);
    }

    #[test]
    fn would_block_depends_on_write_timeout() {
        let blocking_once = || ScriptedSink {
            write_errors: VecDeque::from([ErrorKind::WouldBlock]),
            ..ScriptedSink::default()
        };

        let mut writer = FrameWriter::new(blocking_once());
        writer.send(EnvelopeKind::Request, 6, Message::new()).unwrap();
        assert!(!writer.get_ref().data.is_empty());

        let timed = FrameConfig {
            write_timeout: Some(Duration::from_millis(5)),
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(blocking_once(), timed);
        let err = writer.send(EnvelopeKind::Request, 6, Message::new()).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn zero_length_write_means_closed() {
        let sink = ScriptedSink {
            chunk: Some(0),
            ..ScriptedSink::default()
        };
        let mut writer = FrameWriter::new(sink);
        let err = writer.send(EnvelopeKind::Request, 1, Message::new()).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn set_limits_applies_to_next_envelope() {
        let mut writer = to_vec();
        writer.set_limits(CodecLimits {
            max_message_size: 24,
            max_nesting_depth: 4,
        });
        assert_eq!(writer.config().limits.max_nesting_depth, 4);

        let big = Message::new().with(1, "x".repeat(64));
        assert!(writer.send(EnvelopeKind::Notification, 0, big).is_err());
        writer.send(EnvelopeKind::Notification, 0, Message::new()).unwrap();
        assert_eq!(decode_all(writer.get_mut().get_ref()).len(), 1);
    }

    #[test]
    fn reader_accepts_writer_output() {
        let mut writer = to_vec();
        writer.send(EnvelopeKind::Response, 3, Message::new().with(2, 7i64)).unwrap();

        let mut reader = FrameReader::new(Cursor::new(writer.into_inner().into_inner()));
        let env = reader.read_envelope().unwrap();
        assert_eq!(env.kind, EnvelopeKind::Response);
        assert_eq!(env.message.get_i64(2), Some(7));
    }

    #[test]
    #[cfg(unix)]
    fn ipc_writer_applies_socket_timeout() {
        let dir = std::env::temp_dir().join(format!("hostlink-frame-writer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let endpoint = hostlink_transport::Endpoint::Unix(dir.join("w.sock"));
        let listener = hostlink_transport::IpcListener::bind(&endpoint).unwrap();

        let target = endpoint.clone();
        let client = std::thread::spawn(move || {
            hostlink_transport::connect(&target, Duration::from_secs(1)).unwrap()
        });
        let stream = listener.accept().unwrap();
        let _client = client.join().unwrap();

        let cfg = FrameConfig {
            write_timeout: Some(Duration::from_millis(10)),
            ..FrameConfig::default()
        };
        let writer = FrameWriter::with_config_ipc(stream, cfg).unwrap();
        assert_eq!(writer.config().write_timeout, Some(Duration::from_millis(10)));

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
