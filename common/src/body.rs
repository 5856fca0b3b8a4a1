use log::debug;

use crate::{checksum::Checksum, error::UpdateError, sink::UpdateSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyProgress {
    Streaming,
    /// The expected length has been written and the sink reports finished.
    Complete,
}

/// Forwards response body bytes to a sink, never past the announced length.
#[derive(Debug, Clone)]
pub struct BodyStreamer {
    expected: u64,
    written: u64,
    begun: bool,
}

impl BodyStreamer {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            written: 0,
            begun: false,
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Whether the sink has accepted `begin` and may hold a partial image.
    pub fn is_begun(&self) -> bool {
        self.begun
    }

    pub fn start<S: UpdateSink>(
        &mut self,
        sink: &mut S,
        checksum: &Checksum,
    ) -> Result<(), UpdateError> {
        if !sink.begin(self.expected) {
            return Err(UpdateError::InsufficientSpace {
                size: self.expected,
            });
        }
        self.begun = true;
        sink.set_checksum(checksum);
        Ok(())
    }

    pub fn stream<S: UpdateSink>(
        &mut self,
        sink: &mut S,
        bytes: &[u8],
    ) -> Result<BodyProgress, UpdateError> {
        let remaining = self.expected.saturating_sub(self.written);
        let take = usize::try_from(remaining).map_or(bytes.len(), |left| left.min(bytes.len()));
        let accepted = &bytes[..take];

        if !accepted.is_empty() {
            let written = sink.write(accepted);
            if written != accepted.len() {
                return Err(UpdateError::ShortSinkWrite {
                    written,
                    expected: accepted.len(),
                });
            }
            self.written += written as u64;
        }
        if take < bytes.len() {
            debug!(
                "ota: dropping {} bytes past Content-Length",
                bytes.len() - take
            );
        }

        if self.written < self.expected {
            return Ok(BodyProgress::Streaming);
        }
        if sink.is_finished() {
            Ok(BodyProgress::Complete)
        } else {
            Err(UpdateError::SinkIncomplete {
                written: self.written,
            })
        }
    }
}
