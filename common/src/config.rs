use serde::{Deserialize, Serialize};

pub const ACCEPTED_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub min_content_length: u64,
    pub max_content_length: u64,
    pub accepted_content_type: String,
    pub attempt_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub min_send_space: usize,
    pub max_url_len: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            min_content_length: 1024,
            max_content_length: 8 * 1024 * 1024,
            accepted_content_type: ACCEPTED_CONTENT_TYPE.to_string(),
            attempt_timeout_ms: 20_000,
            restart_delay_ms: 500,
            min_send_space: 512,
            max_url_len: 127,
        }
    }
}

impl OtaConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.min_content_length = self.min_content_length.max(1);
        if self.max_content_length < self.min_content_length {
            self.max_content_length = self.min_content_length;
        }
        if self.accepted_content_type.trim().is_empty() {
            self.accepted_content_type = defaults.accepted_content_type;
        }
        if self.attempt_timeout_ms == 0 {
            self.attempt_timeout_ms = defaults.attempt_timeout_ms;
        }
        self.restart_delay_ms = self.restart_delay_ms.min(10_000);
        if self.max_url_len == 0 {
            self.max_url_len = defaults.max_url_len;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub device_topic: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            device_topic: "esb/device".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.device_topic.trim().trim_end_matches('/');
        self.device_topic = if trimmed.is_empty() {
            Self::default().device_topic
        } else {
            trimmed.to_string()
        };
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Capacity of the update slot in bytes.
    pub partition_size: u64,
    /// Host builds only; staging files land in the data directory when unset.
    pub staging_dir: Option<String>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            partition_size: 0x1E_0000,
            staging_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub read_timeout_ms: u64,
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            send_buffer_size: 5_744,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub ota: OtaConfig,
    pub network: NetworkConfig,
    pub flash: FlashConfig,
    pub transport: TransportConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.ota.sanitize();
        self.network.sanitize();
        if self.transport.read_timeout_ms == 0 {
            self.transport.read_timeout_ms = TransportConfig::default().read_timeout_ms;
        }
    }
}
