use core::ptr;

use esb_ota_common::{Checksum, ChecksumTracker, UpdateSink};
use esp_idf_svc::sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t,
};
use log::{info, warn};

/// Writes an image into the next OTA app partition through the ESP-IDF OTA API.
pub struct PartitionSink {
    partition: *const esp_partition_t,
    handle: Option<esp_ota_handle_t>,
    size: u64,
    written: u64,
    md5: ChecksumTracker,
    expected: Option<Checksum>,
}

impl PartitionSink {
    pub fn new() -> Self {
        Self {
            partition: ptr::null(),
            handle: None,
            size: 0,
            written: 0,
            md5: ChecksumTracker::new(),
            expected: None,
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = esp!(unsafe { esp_ota_abort(handle) }) {
                warn!("esp_ota_abort failed: {err}");
            }
        }
        self.size = 0;
        self.written = 0;
        self.md5 = ChecksumTracker::new();
        self.expected = None;
    }
}

impl UpdateSink for PartitionSink {
    fn begin(&mut self, size: u64) -> bool {
        self.release();

        let partition = unsafe { esp_ota_get_next_update_partition(ptr::null()) };
        if partition.is_null() {
            warn!("no OTA update partition available");
            return false;
        }
        let capacity = u64::from(unsafe { (*partition).size });
        if size > capacity {
            warn!("image of {size} bytes does not fit the {capacity} byte partition");
            return false;
        }
        let Ok(image_size) = usize::try_from(size) else {
            return false;
        };

        let mut handle: esp_ota_handle_t = 0;
        if let Err(err) = esp!(unsafe { esp_ota_begin(partition, image_size, &mut handle) }) {
            warn!("esp_ota_begin failed: {err}");
            return false;
        }

        self.partition = partition;
        self.handle = Some(handle);
        self.size = size;
        true
    }

    fn set_checksum(&mut self, expected: &Checksum) {
        self.expected = Some(*expected);
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let Some(handle) = self.handle else {
            return 0;
        };
        let result = esp!(unsafe { esp_ota_write(handle, bytes.as_ptr().cast(), bytes.len()) });
        if let Err(err) = result {
            warn!("esp_ota_write failed: {err}");
            return 0;
        }
        self.md5.update(bytes);
        self.written += bytes.len() as u64;
        bytes.len()
    }

    fn is_finished(&self) -> bool {
        self.handle.is_some() && self.written == self.size
    }

    fn finish(&mut self) -> bool {
        if !self.is_finished() {
            return false;
        }
        let Some(expected) = self.expected else {
            warn!("no checksum configured, refusing to commit");
            return false;
        };

        let md5 = std::mem::take(&mut self.md5);
        if let Err(actual) = md5.verify(&expected) {
            warn!("md5 mismatch (expected {expected}, got {actual})");
            return false;
        }

        let Some(handle) = self.handle.take() else {
            return false;
        };
        if let Err(err) = esp!(unsafe { esp_ota_end(handle) }) {
            warn!("esp_ota_end failed: {err}");
            return false;
        }
        if let Err(err) = esp!(unsafe { esp_ota_set_boot_partition(self.partition) }) {
            warn!("esp_ota_set_boot_partition failed: {err}");
            return false;
        }

        info!("image of {} bytes committed, boot partition switched", self.written);
        true
    }

    fn abort(&mut self) {
        self.release();
    }
}

impl Drop for PartitionSink {
    fn drop(&mut self) {
        self.release();
    }
}
