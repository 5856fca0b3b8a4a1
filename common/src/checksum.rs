use core::fmt;

use crate::error::InputError;

pub const CHECKSUM_HEX_LEN: usize = 32;

/// Expected MD5 of a firmware image, kept as 32 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; CHECKSUM_HEX_LEN]);

impl Checksum {
    /// Reads exactly the first 32 bytes of `raw`; anything after them is ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, InputError> {
        let digits = raw
            .get(..CHECKSUM_HEX_LEN)
            .ok_or(InputError::InvalidChecksum)?;
        if !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(InputError::InvalidChecksum);
        }

        let mut hex = [0_u8; CHECKSUM_HEX_LEN];
        for (dst, src) in hex.iter_mut().zip(digits) {
            *dst = src.to_ascii_lowercase();
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap_or_default()
    }

    pub fn matches(&self, digest: &md5::Digest) -> bool {
        format!("{digest:x}") == self.as_str()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.as_str())
    }
}

/// Running MD5 over the bytes a sink has committed so far.
pub struct ChecksumTracker {
    context: md5::Context,
}

impl ChecksumTracker {
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.context.consume(bytes);
    }

    pub fn digest(self) -> md5::Digest {
        self.context.compute()
    }

    pub fn verify(self, expected: &Checksum) -> Result<(), String> {
        let digest = self.digest();
        if expected.matches(&digest) {
            Ok(())
        } else {
            Err(format!("{digest:x}"))
        }
    }
}

impl Default for ChecksumTracker {
    fn default() -> Self {
        Self::new()
    }
}
