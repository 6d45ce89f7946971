use hostlink_frame::Message;

/// Connection-level happenings surfaced to the host asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// The connection is gone for good; no further retries will be made.
    ConnectionLost { reason: String },
    /// The connection was re-established after degrading.
    Reconnected { attempts: u32 },
    /// A notification arrived on a subscribed topic.
    NotificationReceived { topic: String, message: Message },
}
