use core::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Connecting,
    AwaitingHeaders,
    StreamingBody,
    Finalizing,
    Rebooting,
    Failed,
}

impl UpdatePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::AwaitingHeaders => "AWAITING_HEADERS",
            Self::StreamingBody => "STREAMING_BODY",
            Self::Finalizing => "FINALIZING",
            Self::Rebooting => "REBOOTING",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateStatus {
    pub state: UpdatePhase,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSourceUrl")]
    pub last_source_url: Option<String>,
    #[serde(rename = "lastChecksum")]
    pub last_checksum: Option<String>,
    #[serde(rename = "lastElapsedMs")]
    pub last_elapsed_ms: Option<u64>,
}

impl UpdateStatus {
    pub fn set_progress(&mut self, written: u64, total: Option<u64>) {
        self.bytes_written = written;
        self.total_bytes = total;
        self.progress_pct = total
            .filter(|value| *value > 0)
            .map(|total| (written.saturating_mul(100) / total).min(100) as u8);
    }
}
