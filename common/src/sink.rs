use crate::checksum::Checksum;

/// Flash write/verify/commit primitive the engine streams an image into.
///
/// The engine calls `begin` once, then `set_checksum`, then `write` once per received chunk.
/// `abort` must be safe to call from any state and more than once.
pub trait UpdateSink {
    /// `false` means the image does not fit.
    fn begin(&mut self, size: u64) -> bool;

    fn set_checksum(&mut self, expected: &Checksum);

    /// Returns how many bytes were committed.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Every byte announced to `begin` has been written.
    fn is_finished(&self) -> bool;

    /// Verifies the checksum and commits the image; `false` on mismatch or commit failure.
    fn finish(&mut self) -> bool;

    fn abort(&mut self);
}
