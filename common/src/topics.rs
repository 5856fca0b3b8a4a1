pub const OTA_TOPIC_SUFFIX: &str = "/ota";
pub const OTA_STATUS_TOPIC_SUFFIX: &str = "/ota/status";

pub fn ota_topic(device_topic: &str) -> String {
    format!("{device_topic}{OTA_TOPIC_SUFFIX}")
}

pub fn ota_status_topic(device_topic: &str) -> String {
    format!("{device_topic}{OTA_STATUS_TOPIC_SUFFIX}")
}
