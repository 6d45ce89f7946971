use std::collections::HashSet;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use hostlink_frame::{Envelope, EnvelopeKind, FrameError, FrameReader, FrameWriter, Message};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::millis;
use crate::control::{topic_of, with_topic, TOPIC_HELLO, TOPIC_REJECT, TOPIC_WELCOME};
use crate::error::{ConnectorError, Result};

const MAX_CAPABILITIES: usize = 64;
const MAX_CAPABILITY_LEN: usize = 64;
const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_PEER_ID_LEN: usize = 128;

/// Handshake field: protocol name (string).
pub const FIELD_PROTOCOL: u32 = 1;
/// Handshake field: `major.minor` version (string).
pub const FIELD_VERSION: u32 = 2;
/// Handshake field: capability list (nested message of strings, tags 1..).
pub const FIELD_CAPABILITIES: u32 = 3;
/// Handshake field: service-assigned peer id (string).
pub const FIELD_PEER_ID: u32 = 4;
/// Handshake field: refusal reason (string).
pub const FIELD_REASON: u32 = 5;

/// Configuration for handshake negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct HandshakeConfig {
    /// Bound on the whole exchange.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version, `major.minor`.
    pub protocol_version: String,
    /// Capabilities offered (client) or supported (service).
    pub capabilities: Vec<String>,
    /// Frame size cap while the peer is still unauthenticated.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "hostlink".to_string(),
            protocol_version: "1.0".to_string(),
            capabilities: Vec::new(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

impl HandshakeConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let check = || -> Result<()> {
            validate_protocol_name(&self.protocol_name)?;
            validate_version(&self.protocol_version)?;
            normalize_capabilities(&self.capabilities)?;
            Ok(())
        };
        check().map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        if self.timeout.is_zero() {
            return Err(ConnectorError::InvalidConfig(
                "handshake timeout must be positive".to_string(),
            ));
        }
        if self.max_handshake_payload < 64 {
            return Err(ConnectorError::InvalidConfig(format!(
                "maxHandshakePayload too small: {}",
                self.max_handshake_payload
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful handshake, as seen by either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Service-assigned identifier of this connection.
    pub peer_id: String,
    pub protocol: String,
    /// The service's protocol version.
    pub protocol_version: String,
    /// Capabilities both sides support, in the client's order.
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Hello {
    protocol: String,
    version: String,
    capabilities: Vec<String>,
}

impl Hello {
    fn to_message(&self) -> Message {
        with_topic(
            TOPIC_HELLO,
            Message::new()
                .with(FIELD_PROTOCOL, self.protocol.as_str())
                .with(FIELD_VERSION, self.version.as_str())
                .with(FIELD_CAPABILITIES, capabilities_message(&self.capabilities)),
        )
    }

    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            protocol: required_str(message, FIELD_PROTOCOL, "protocol")?,
            version: required_str(message, FIELD_VERSION, "version")?,
            capabilities: read_capabilities(message)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Welcome {
    protocol: String,
    version: String,
    capabilities: Vec<String>,
    peer_id: String,
}

impl Welcome {
    fn to_message(&self) -> Message {
        with_topic(
            TOPIC_WELCOME,
            Message::new()
                .with(FIELD_PROTOCOL, self.protocol.as_str())
                .with(FIELD_VERSION, self.version.as_str())
                .with(FIELD_CAPABILITIES, capabilities_message(&self.capabilities))
                .with(FIELD_PEER_ID, self.peer_id.as_str()),
        )
    }

    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            protocol: required_str(message, FIELD_PROTOCOL, "protocol")?,
            version: required_str(message, FIELD_VERSION, "version")?,
            capabilities: read_capabilities(message)?,
            peer_id: required_str(message, FIELD_PEER_ID, "peer id")?,
        })
    }
}

fn reject_message(config: &HandshakeConfig, reason: &str) -> Message {
    with_topic(
        TOPIC_REJECT,
        Message::new()
            .with(FIELD_PROTOCOL, config.protocol_name.as_str())
            .with(FIELD_VERSION, config.protocol_version.as_str())
            .with(FIELD_REASON, reason),
    )
}

/// Perform the client half: send `$hello`, wait for `$welcome`.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    config.validate()?;
    let offered = normalize_capabilities(&config.capabilities)?;

    let hello = Hello {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        capabilities: offered.clone(),
    };
    writer.write_envelope(&Envelope::notification(hello.to_message()))?;

    let reply = recv_handshake_message(reader, Instant::now() + config.timeout, config)?;

    match topic_of(&reply) {
        Some(TOPIC_WELCOME) => {}
        Some(TOPIC_REJECT) => {
            let reason = reply.get_str(FIELD_REASON).unwrap_or("no reason given");
            return Err(ConnectorError::IncompatiblePeer(format!(
                "service refused handshake: {reason}"
            )));
        }
        other => {
            return Err(ConnectorError::HandshakeFailed(format!(
                "expected {TOPIC_WELCOME}, got {}",
                other.unwrap_or("<no topic>")
            )))
        }
    }

    let welcome = Welcome::from_message(&reply)?;
    validate_protocol_name(&welcome.protocol)?;
    validate_version(&welcome.version)?;
    validate_peer_id(&welcome.peer_id)?;

    if welcome.protocol != config.protocol_name {
        return Err(ConnectorError::IncompatiblePeer(format!(
            "unknown protocol '{}' (expected '{}')",
            welcome.protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&config.protocol_version, &welcome.version)? {
        return Err(ConnectorError::IncompatiblePeer(format!(
            "incompatible version '{}' (local '{}')",
            welcome.version, config.protocol_version
        )));
    }

    let negotiated = normalize_capabilities(&welcome.capabilities)?;
    let offered_set: HashSet<&str> = offered.iter().map(String::as_str).collect();
    if negotiated.iter().any(|cap| !offered_set.contains(cap.as_str())) {
        return Err(ConnectorError::HandshakeFailed(
            "service returned capabilities that were not offered".to_string(),
        ));
    }

    debug!(
        peer_id = %welcome.peer_id,
        version = %welcome.version,
        capabilities = negotiated.len(),
        "handshake complete"
    );
    Ok(HandshakeResult {
        peer_id: welcome.peer_id,
        protocol: welcome.protocol,
        protocol_version: welcome.version,
        capabilities: negotiated,
    })
}

/// Perform the service half: wait for `$hello`, answer `$welcome` or `$reject`.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    peer_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    config.validate()?;
    validate_peer_id(peer_id)?;
    let supported = normalize_capabilities(&config.capabilities)?;

    let request = recv_handshake_message(reader, Instant::now() + config.timeout, config)?;
    if topic_of(&request) != Some(TOPIC_HELLO) {
        return Err(ConnectorError::HandshakeFailed(format!(
            "expected {TOPIC_HELLO}, got {}",
            topic_of(&request).unwrap_or("<no topic>")
        )));
    }

    let hello = Hello::from_message(&request)?;
    validate_protocol_name(&hello.protocol)?;
    validate_version(&hello.version)?;
    let requested = normalize_capabilities(&hello.capabilities)?;

    let refusal = if hello.protocol != config.protocol_name {
        Some(format!(
            "unknown protocol '{}' (expected '{}')",
            hello.protocol, config.protocol_name
        ))
    } else if !is_version_compatible(&hello.version, &config.protocol_version)? {
        Some(format!(
            "incompatible version '{}' (service '{}')",
            hello.version, config.protocol_version
        ))
    } else {
        None
    };
    if let Some(reason) = refusal {
        warn!(%reason, "refusing handshake");
        let _ = writer.write_envelope(&Envelope::notification(reject_message(config, &reason)));
        return Err(ConnectorError::IncompatiblePeer(reason));
    }

    let supported_set: HashSet<&str> = supported.iter().map(String::as_str).collect();
    let negotiated: Vec<String> = requested
        .into_iter()
        .filter(|cap| supported_set.contains(cap.as_str()))
        .collect();

    let welcome = Welcome {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        capabilities: negotiated.clone(),
        peer_id: peer_id.to_string(),
    };
    writer.write_envelope(&Envelope::notification(welcome.to_message()))?;

    Ok(HandshakeResult {
        peer_id: peer_id.to_string(),
        protocol: config.protocol_name.clone(),
        protocol_version: config.protocol_version.clone(),
        capabilities: negotiated,
    })
}

fn recv_handshake_message<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    config: &HandshakeConfig,
) -> Result<Message> {
    loop {
        if deadline <= Instant::now() {
            return Err(ConnectorError::Timeout(config.timeout));
        }

        match reader.read_envelope() {
            Ok(envelope) if envelope.kind == EnvelopeKind::Notification => {
                return Ok(envelope.message)
            }
            Ok(envelope) => {
                return Err(ConnectorError::HandshakeFailed(format!(
                    "expected NOTIFICATION during handshake, got {}",
                    envelope.kind
                )))
            }
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                return Err(ConnectorError::Disconnected(
                    "peer hung up mid-handshake".to_string(),
                ));
            }
            Err(FrameError::OversizedMessage { size, .. }) => {
                return Err(ConnectorError::HandshakeFailed(format!(
                    "handshake payload too large: {size} (max {})",
                    config.max_handshake_payload
                )));
            }
            Err(err) => return Err(ConnectorError::Frame(err)),
        }
    }
}

fn capabilities_message(capabilities: &[String]) -> Message {
    let mut list = Message::new();
    for (idx, cap) in capabilities.iter().enumerate() {
        list.set(idx as u32 + 1, cap.as_str());
    }
    list
}

fn read_capabilities(message: &Message) -> Result<Vec<String>> {
    let Some(list) = message.get_message(FIELD_CAPABILITIES) else {
        return Ok(Vec::new());
    };
    list.iter()
        .map(|field| match &field.value {
            hostlink_frame::Value::String(cap) => Ok(cap.clone()),
            other => Err(ConnectorError::HandshakeFailed(format!(
                "capability must be a string, got {}",
                other.type_name()
            ))),
        })
        .collect()
}

fn required_str(message: &Message, tag: u32, what: &str) -> Result<String> {
    message
        .get_str(tag)
        .map(str::to_string)
        .ok_or_else(|| ConnectorError::HandshakeFailed(format!("missing {what}")))
}

fn normalize_capabilities(capabilities: &[String]) -> Result<Vec<String>> {
    if capabilities.len() > MAX_CAPABILITIES {
        return Err(ConnectorError::HandshakeFailed(format!(
            "too many capabilities: {} (max {MAX_CAPABILITIES})",
            capabilities.len()
        )));
    }

    let mut seen = HashSet::with_capacity(capabilities.len());
    let mut out = Vec::with_capacity(capabilities.len());
    for cap in capabilities {
        if cap.is_empty() || cap.len() > MAX_CAPABILITY_LEN {
            return Err(ConnectorError::HandshakeFailed(format!(
                "invalid capability length: {}",
                cap.len()
            )));
        }
        if seen.insert(cap.as_str()) {
            out.push(cap.clone());
        }
    }
    Ok(out)
}

fn check_len(what: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() || value.len() > max {
        return Err(ConnectorError::HandshakeFailed(format!(
            "{what} must be 1..={max} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    check_len("protocol name", protocol, MAX_PROTOCOL_LEN)
}

fn validate_version(version: &str) -> Result<()> {
    check_len("protocol version", version, MAX_VERSION_LEN)?;
    parse_version(version).map(|_| ())
}

fn validate_peer_id(peer_id: &str) -> Result<()> {
    check_len("peer id", peer_id, MAX_PEER_ID_LEN)
}

/// Same major, and the client is at least as new as the service.
pub fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (major, minor) = parse_version(client_version)?;
    let (service_major, service_minor) = parse_version(server_version)?;
    Ok(major == service_major && minor >= service_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |why: &str| {
        ConnectorError::HandshakeFailed(format!("invalid version '{version}': {why}"))
    };

    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    if minor.contains('.') {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{Cursor, ErrorKind};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    fn pair() -> (
        (FrameReader<UnixStream>, FrameWriter<UnixStream>),
        (FrameReader<UnixStream>, FrameWriter<UnixStream>),
    ) {
        let (left, right) = UnixStream::pair().unwrap();
        (
            (FrameReader::new(left.try_clone().unwrap()), FrameWriter::new(left)),
            (FrameReader::new(right.try_clone().unwrap()), FrameWriter::new(right)),
        )
    }

    fn with_caps(caps: &[&str]) -> HandshakeConfig {
        HandshakeConfig {
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            ..HandshakeConfig::default()
        }
    }

    #[test]
    fn successful_handshake_negotiates_capabilities() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();

        let server = thread::spawn(move || {
            let cfg = with_caps(&["quotes", "history"]);
            handshake_server(&mut sr, &mut sw, "svc-1", &cfg).unwrap()
        });

        let cfg = with_caps(&["history", "trades", "quotes"]);
        let client = handshake_client(&mut cr, &mut cw, &cfg).unwrap();
        let served = server.join().unwrap();

        assert_eq!(client.peer_id, "svc-1");
        assert_eq!(client.protocol_version, "1.0");
        assert_eq!(client.capabilities, vec!["history", "quotes"]);
        assert_eq!(served.capabilities, client.capabilities);
    }

    #[test]
    fn newer_client_minor_accepted() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();

        let server = thread::spawn(move || {
            handshake_server(&mut sr, &mut sw, "svc-2", &HandshakeConfig::default())
        });

        let cfg = HandshakeConfig {
            protocol_version: "1.4".to_string(),
            ..HandshakeConfig::default()
        };
        let client = handshake_client(&mut cr, &mut cw, &cfg).unwrap();
        assert_eq!(client.protocol_version, "1.0");
        assert!(server.join().unwrap().is_ok());
    }

    #[test]
    fn major_mismatch_is_incompatible_on_both_sides() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();

        let server = thread::spawn(move || {
            let cfg = HandshakeConfig {
                protocol_version: "2.0".to_string(),
                ..HandshakeConfig::default()
            };
            handshake_server(&mut sr, &mut sw, "svc-3", &cfg)
        });

        let result = handshake_client(&mut cr, &mut cw, &HandshakeConfig::default());
        assert!(matches!(result, Err(ConnectorError::IncompatiblePeer(_))));
        assert!(matches!(
            server.join().unwrap(),
            Err(ConnectorError::IncompatiblePeer(_))
        ));
    }

    #[test]
    fn wrong_protocol_name_rejected() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();

        let server = thread::spawn(move || {
            handshake_server(&mut sr, &mut sw, "svc-4", &HandshakeConfig::default())
        });

        let cfg = HandshakeConfig {
            protocol_name: "foobar".to_string(),
            ..HandshakeConfig::default()
        };
        let result = handshake_client(&mut cr, &mut cw, &cfg);
        assert!(matches!(result, Err(ConnectorError::IncompatiblePeer(_))));
        assert!(server.join().unwrap().is_err());
    }

    #[test]
    fn client_checks_welcome_version_itself() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();

        let server = thread::spawn(move || {
            let _ = sr.read_envelope().unwrap();
            let welcome = Welcome {
                protocol: "hostlink".to_string(),
                version: "1.9".to_string(),
                capabilities: Vec::new(),
                peer_id: "rogue".to_string(),
            };
            sw.write_envelope(&Envelope::notification(welcome.to_message()))
                .unwrap();
        });

        let result = handshake_client(&mut cr, &mut cw, &HandshakeConfig::default());
        assert!(matches!(result, Err(ConnectorError::IncompatiblePeer(_))));
        server.join().unwrap();
    }

    #[test]
    fn non_hello_first_message_fails() {
        let ((mut sr, mut sw), (_cr, mut cw)) = pair();
        cw.write_envelope(&Envelope::request(1, Message::new())).unwrap();

        let result = handshake_server(&mut sr, &mut sw, "svc-5", &HandshakeConfig::default());
        assert!(matches!(result, Err(ConnectorError::HandshakeFailed(_))));
    }

    #[test]
    fn oversized_handshake_payload_rejected() {
        let ((mut sr, mut sw), (_cr, mut cw)) = pair();
        let hello = Hello {
            protocol: "hostlink".to_string(),
            version: "1.0".to_string(),
            capabilities: vec!["x".repeat(60); 40],
        };
        cw.write_envelope(&Envelope::notification(hello.to_message()))
            .unwrap();

        let cfg = HandshakeConfig {
            max_handshake_payload: 256,
            ..HandshakeConfig::default()
        };
        sr.set_limits(hostlink_frame::CodecLimits {
            max_message_size: cfg.max_handshake_payload,
            ..hostlink_frame::CodecLimits::default()
        });
        let result = handshake_server(&mut sr, &mut sw, "svc-6", &cfg);
        assert!(matches!(result, Err(ConnectorError::HandshakeFailed(_))));
    }

    #[test]
    fn closed_peer_is_disconnected() {
        let ((mut sr, mut sw), (cr, cw)) = pair();
        drop((cr, cw));
        let result = handshake_server(&mut sr, &mut sw, "svc-7", &HandshakeConfig::default());
        assert!(matches!(result, Err(ConnectorError::Disconnected(_))));
    }

    #[test]
    fn handshake_timeout() {
        let mut reader = FrameReader::new(AlwaysTimedOutReader);
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };

        let result = handshake_client(&mut reader, &mut writer, &cfg);
        assert!(matches!(result, Err(ConnectorError::Timeout(_))));
    }

    #[test]
    fn rejects_bad_local_config() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let cfg = with_caps(&[""]);
        let result = handshake_client(&mut reader, &mut writer, &cfg);
        assert!(matches!(result, Err(ConnectorError::InvalidConfig(_))));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn version_rules() {
        assert!(is_version_compatible("1.0", "1.0").unwrap());
        assert!(is_version_compatible("1.3", "1.2").unwrap());
        assert!(!is_version_compatible("1.1", "1.2").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.2.3").is_err());
        assert!(parse_version("a.b").is_err());
    }

    struct AlwaysTimedOutReader;

    impl Read for AlwaysTimedOutReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }
}
