use esb_ota_common::TransportEvent;

/// Owned form of [`TransportEvent`] so it can cross a channel to the control task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    Data(Vec<u8>),
    Error(String),
    Timeout,
    Disconnected,
}

impl SocketEvent {
    pub fn as_event(&self) -> TransportEvent<'_> {
        match self {
            Self::Connected => TransportEvent::Connected,
            Self::Data(bytes) => TransportEvent::Data(bytes),
            Self::Error(reason) => TransportEvent::Error(reason),
            Self::Timeout => TransportEvent::Timeout,
            Self::Disconnected => TransportEvent::Disconnected,
        }
    }
}

/// Socket event stamped with the attempt that produced it, so late events from a torn-down
/// connection can be told apart from the current one.
#[derive(Debug)]
pub struct TaggedEvent {
    pub attempt: u64,
    pub event: SocketEvent,
}
