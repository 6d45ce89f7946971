use hostlink_frame::Message;

use crate::error::{ConnectorError, Result};

/// Field tag carrying a notification's topic.
pub const TOPIC_TAG: u32 = 0;
/// Topics starting with this prefix belong to the protocol itself.
pub const RESERVED_TOPIC_PREFIX: char = '$';
/// Handshake: client greeting.
pub const TOPIC_HELLO: &str = "$hello";
/// Handshake: service acceptance.
pub const TOPIC_WELCOME: &str = "$welcome";
/// Handshake: service refusal.
pub const TOPIC_REJECT: &str = "$reject";

/// Field tag of the probe/ack marker in a HEARTBEAT envelope.
pub const HEARTBEAT_MARKER_TAG: u32 = 1;

/// Which half of a heartbeat exchange an envelope is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMarker {
    Probe = 0,
    Ack = 1,
}

impl HeartbeatMarker {
    pub fn to_message(self) -> Message {
        Message::new().with(HEARTBEAT_MARKER_TAG, self as i32)
    }

    /// A heartbeat without a recognizable marker is treated as a probe.
    pub fn from_message(message: &Message) -> Self {
        match message.get_i32(HEARTBEAT_MARKER_TAG) {
            Some(1) => Self::Ack,
            _ => Self::Probe,
        }
    }
}

/// Topic of a notification, if it carries one.
pub fn topic_of(message: &Message) -> Option<&str> {
    message.get_str(TOPIC_TAG)
}

/// Stamp `topic` onto `message`, replacing any existing topic field.
pub fn with_topic(topic: &str, mut message: Message) -> Message {
    message.set(TOPIC_TAG, topic);
    message
}

pub fn is_reserved_topic(topic: &str) -> bool {
    topic.starts_with(RESERVED_TOPIC_PREFIX)
}

/// Reject topics a host may not subscribe or publish to.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || is_reserved_topic(topic) {
        return Err(ConnectorError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_roundtrip_and_replace() {
        let msg = with_topic("quotes", Message::new().with(1, 3i32));
        assert_eq!(topic_of(&msg), Some("quotes"));
        let msg = with_topic("trades", msg);
        assert_eq!(topic_of(&msg), Some("trades"));
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn reserved_and_empty_topics_rejected() {
        assert!(validate_topic("quotes").is_ok());
        assert!(matches!(validate_topic(""), Err(ConnectorError::InvalidTopic(_))));
        assert!(matches!(
            validate_topic(TOPIC_HELLO),
            Err(ConnectorError::InvalidTopic(_))
        ));
    }

    #[test]
    fn heartbeat_marker() {
        let probe = HeartbeatMarker::Probe.to_message();
        let ack = HeartbeatMarker::Ack.to_message();
        assert_eq!(HeartbeatMarker::from_message(&probe), HeartbeatMarker::Probe);
        assert_eq!(HeartbeatMarker::from_message(&ack), HeartbeatMarker::Ack);
        assert_eq!(HeartbeatMarker::from_message(&Message::new()), HeartbeatMarker::Probe);
    }
}
