use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use esb_ota_common::{Checksum, ChecksumTracker, UpdateSink};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub const STAGING_FILE: &str = "firmware.bin.partial";
pub const IMAGE_FILE: &str = "firmware.bin";

/// Update slot backed by a file: bytes land in a staging file that only replaces the live image
/// once its MD5 checks out.
pub struct FileSink {
    staging_path: PathBuf,
    image_path: PathBuf,
    capacity: u64,

    file: Option<File>,
    size: u64,
    written: u64,
    md5: ChecksumTracker,
    sha256: Sha256,
    expected: Option<Checksum>,
}

impl FileSink {
    pub fn new(dir: &Path, capacity: u64) -> Self {
        Self {
            staging_path: dir.join(STAGING_FILE),
            image_path: dir.join(IMAGE_FILE),
            capacity,
            file: None,
            size: 0,
            written: 0,
            md5: ChecksumTracker::new(),
            sha256: Sha256::new(),
            expected: None,
        }
    }

    fn reset(&mut self) {
        self.file = None;
        self.size = 0;
        self.written = 0;
        self.md5 = ChecksumTracker::new();
        self.sha256 = Sha256::new();
        self.expected = None;
    }

    fn remove_staging(&self) {
        match fs::remove_file(&self.staging_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove staging file {}: {err}",
                self.staging_path.display()
            ),
        }
    }

    fn commit(&mut self, mut file: File) -> std::io::Result<String> {
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.staging_path, &self.image_path)?;

        let digest = std::mem::take(&mut self.sha256).finalize();
        let mut digest_hex = String::with_capacity(64);
        for byte in digest {
            use core::fmt::Write as _;
            let _ = write!(&mut digest_hex, "{byte:02x}");
        }
        Ok(digest_hex)
    }
}

impl UpdateSink for FileSink {
    fn begin(&mut self, size: u64) -> bool {
        self.reset();
        if size > self.capacity {
            warn!(
                "image of {size} bytes does not fit the {} byte slot",
                self.capacity
            );
            return false;
        }
        if let Some(parent) = self.staging_path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("failed to create {}: {err}", parent.display());
                return false;
            }
        }
        match File::create(&self.staging_path) {
            Ok(file) => {
                self.file = Some(file);
                self.size = size;
                true
            }
            Err(err) => {
                warn!(
                    "failed to create staging file {}: {err}",
                    self.staging_path.display()
                );
                false
            }
        }
    }

    fn set_checksum(&mut self, expected: &Checksum) {
        self.expected = Some(*expected);
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        let room = usize::try_from(self.size - self.written).unwrap_or(usize::MAX);
        let accepted = &bytes[..bytes.len().min(room)];
        if let Err(err) = file.write_all(accepted) {
            warn!("staging write failed: {err}");
            return 0;
        }
        self.md5.update(accepted);
        self.sha256.update(accepted);
        self.written += accepted.len() as u64;
        accepted.len()
    }

    fn is_finished(&self) -> bool {
        self.file.is_some() && self.written == self.size
    }

    fn finish(&mut self) -> bool {
        if !self.is_finished() {
            warn!(
                "refusing to commit partial image ({} of {} bytes)",
                self.written, self.size
            );
            return false;
        }
        let Some(expected) = self.expected else {
            warn!("no checksum configured, refusing to commit");
            return false;
        };
        let Some(file) = self.file.take() else {
            return false;
        };

        let md5 = std::mem::take(&mut self.md5);
        if let Err(actual) = md5.verify(&expected) {
            warn!("md5 mismatch (expected {expected}, got {actual})");
            drop(file);
            self.remove_staging();
            self.reset();
            return false;
        }

        match self.commit(file) {
            Ok(sha256) => {
                info!(
                    "image committed to {} ({} bytes, sha256={sha256})",
                    self.image_path.display(),
                    self.written
                );
                true
            }
            Err(err) => {
                warn!("failed to commit image: {err}");
                self.remove_staging();
                self.reset();
                false
            }
        }
    }

    fn abort(&mut self) {
        let had_file = self.file.is_some();
        self.reset();
        if had_file {
            self.remove_staging();
        }
    }
}
