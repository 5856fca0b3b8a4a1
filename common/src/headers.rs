use heapless::Vec;

use crate::error::ProtocolError;

pub const SCRATCH_CAPACITY: usize = 128;

/// Result of feeding one chunk to the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Every byte of the chunk was header data; more is needed.
    NeedMore,
    /// Headers ended inside the chunk; `body_start` is the offset of the first body byte.
    Complete { body_start: usize },
}

/// Reassembles response header lines from arbitrarily split reads.
///
/// Only the line currently being received is held, in a fixed `N` byte scratch buffer.
#[derive(Debug, Default)]
pub struct HeaderAccumulator<const N: usize = SCRATCH_CAPACITY> {
    scratch: Vec<u8, N>,
    complete: bool,
}

impl<const N: usize> HeaderAccumulator<N> {
    pub fn new() -> Self {
        Self {
            scratch: Vec::new(),
            complete: false,
        }
    }

    #[cfg(test)]
    fn is_complete(&self) -> bool {
        self.complete
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.scratch.len()
    }

    /// Hands every complete line (without its `\r\n`) to `on_line`, in order.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_line: F) -> Result<Feed, ProtocolError>
    where
        F: FnMut(&str) -> Result<(), ProtocolError>,
    {
        if self.complete {
            return Ok(Feed::Complete { body_start: 0 });
        }

        for (index, &byte) in chunk.iter().enumerate() {
            match byte {
                b'\n' => {
                    let line = self
                        .scratch
                        .strip_suffix(b"\r")
                        .unwrap_or(&self.scratch[..]);
                    if line.is_empty() {
                        self.scratch.clear();
                        self.complete = true;
                        return Ok(Feed::Complete {
                            body_start: index + 1,
                        });
                    }
                    on_line(&String::from_utf8_lossy(line))?;
                    self.scratch.clear();
                }
                0 => return Err(ProtocolError::NullByte),
                _ => self
                    .scratch
                    .push(byte)
                    .map_err(|_| ProtocolError::HeaderLineTooLong { capacity: N })?,
            }
        }

        Ok(Feed::NeedMore)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: 6\r\n\r\nbody!!";

    fn collect(
        accumulator: &mut HeaderAccumulator,
        chunk: &[u8],
        lines: &mut std::vec::Vec<String>,
    ) -> Result<Feed, ProtocolError> {
        accumulator.feed(chunk, |line| {
            lines.push(line.to_string());
            Ok(())
        })
    }

    fn expected_lines() -> std::vec::Vec<String> {
        vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Type: application/octet-stream".to_string(),
            "Content-Length: 6".to_string(),
        ]
    }

    #[test]
    fn single_chunk_yields_lines_and_body_offset() {
        let mut accumulator: HeaderAccumulator = HeaderAccumulator::new();
        let mut lines = std::vec::Vec::new();

        let feed = collect(&mut accumulator, RESPONSE, &mut lines).unwrap();

        assert_eq!(lines, expected_lines());
        assert_eq!(
            feed,
            Feed::Complete {
                body_start: RESPONSE.len() - 6
            }
        );
        assert!(accumulator.is_complete());
    }

    #[test]
    fn every_split_point_finds_same_lines_and_body() {
        for split in 0..=RESPONSE.len() {
            let (first, second) = RESPONSE.split_at(split);
            let mut accumulator: HeaderAccumulator = HeaderAccumulator::new();
            let mut lines = std::vec::Vec::new();
            let mut body = std::vec::Vec::new();

            for chunk in [first, second] {
                if accumulator.is_complete() {
                    body.extend_from_slice(chunk);
                    continue;
                }
                if let Feed::Complete { body_start } =
                    collect(&mut accumulator, chunk, &mut lines).unwrap()
                {
                    body.extend_from_slice(&chunk[body_start..]);
                }
            }

            assert_eq!(lines, expected_lines(), "split at {split}");
            assert_eq!(body, b"body!!".to_vec(), "split at {split}");
        }
    }

    #[test]
    fn bare_newlines_terminate_lines() {
        let mut accumulator: HeaderAccumulator = HeaderAccumulator::new();
        let mut lines = std::vec::Vec::new();

        let feed = collect(&mut accumulator, b"HTTP/1.1 200 OK\nX: y\n\nrest", &mut lines).unwrap();

        assert_eq!(lines, vec!["HTTP/1.1 200 OK", "X: y"]);
        assert_eq!(feed, Feed::Complete { body_start: 22 });
    }

    #[test]
    fn oversized_line_is_fatal() {
        let mut accumulator: HeaderAccumulator<16> = HeaderAccumulator::new();
        let line = [b'a'; 17];

        let result = accumulator.feed(&line, |_| Ok(()));

        assert_eq!(
            result,
            Err(ProtocolError::HeaderLineTooLong { capacity: 16 })
        );
    }

    #[test]
    fn line_filling_scratch_exactly_is_accepted() {
        let mut accumulator: HeaderAccumulator<16> = HeaderAccumulator::new();
        let mut chunk = [b'a'; 18];
        chunk[16] = b'\r';
        chunk[17] = b'\n';

        // 16 bytes of text plus `\r` overflows; 15 plus `\r` fits.
        assert!(accumulator.feed(&chunk, |_| Ok(())).is_err());

        let mut accumulator: HeaderAccumulator<16> = HeaderAccumulator::new();
        assert_eq!(
            accumulator.feed(&chunk[1..], |_| Ok(())),
            Ok(Feed::NeedMore)
        );
        assert_eq!(accumulator.pending(), 0);
    }

    #[test]
    fn null_byte_is_fatal() {
        let mut accumulator: HeaderAccumulator = HeaderAccumulator::new();

        let result = accumulator.feed(b"HTTP/1.1 200\0OK\r\n", |_| Ok(()));

        assert_eq!(result, Err(ProtocolError::NullByte));
    }

    #[test]
    fn line_errors_stop_the_scan() {
        let mut accumulator: HeaderAccumulator = HeaderAccumulator::new();
        let mut seen = 0;

        let result = accumulator.feed(b"HTTP/1.1 404 Not Found\r\nA: b\r\n", |line| {
            seen += 1;
            Err(ProtocolError::BadStatus(line.to_string()))
        });

        assert_eq!(seen, 1);
        assert_eq!(
            result,
            Err(ProtocolError::BadStatus("HTTP/1.1 404 Not Found".to_string()))
        );
    }

    #[test]
    fn completion_is_sticky() {
        let mut accumulator: HeaderAccumulator = HeaderAccumulator::new();
        accumulator.feed(b"HTTP/1.1 200 OK\r\n\r\n", |_| Ok(())).unwrap();

        let feed = accumulator.feed(b"\r\n\r\nmore", |_| panic!("no more lines"));

        assert_eq!(feed, Ok(Feed::Complete { body_start: 0 }));
    }
}
