/// Raw stream connection the engine issues its request on.
pub trait Transport {
    /// Starts connecting; the outcome arrives later as a [`TransportEvent`].
    fn connect(&mut self, host: &str, port: u16) -> bool;

    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Free bytes in the send buffer.
    fn space(&self) -> usize;

    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent<'a> {
    Connected,
    Data(&'a [u8]),
    Error(&'a str),
    Timeout,
    Disconnected,
}

impl TransportEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Data(_) => "data",
            Self::Error(_) => "error",
            Self::Timeout => "timeout",
            Self::Disconnected => "disconnected",
        }
    }
}
