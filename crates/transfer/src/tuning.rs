use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_SEND_WATERMARK: u64 = 1024 * 1024;
pub const DEFAULT_ACK_INTERVAL_BYTES: u64 = 256 * 1024;
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MAX_ATTEMPTS: u8 = 3;
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTuning {
    pub chunk_size: usize,
    pub send_watermark: u64,
    pub ack_interval_bytes: u64,
    pub ack_timeout: Duration,
    pub max_attempts: u8,
    pub negotiation_timeout: Duration,
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_watermark: DEFAULT_SEND_WATERMARK,
            ack_interval_bytes: DEFAULT_ACK_INTERVAL_BYTES,
            ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS),
        }
    }
}

impl TransferTuning {
    pub fn clamped(self) -> Self {
        Self {
            chunk_size: self.chunk_size.clamp(4 * 1024, 1024 * 1024),
            send_watermark: self.send_watermark.clamp(64 * 1024, 8 * 1024 * 1024),
            ack_interval_bytes: self.ack_interval_bytes.clamp(16 * 1024, 4 * 1024 * 1024),
            ack_timeout: Duration::from_secs(self.ack_timeout.as_secs().clamp(1, 60)),
            max_attempts: self.max_attempts.clamp(1, 10),
            negotiation_timeout: Duration::from_secs(
                self.negotiation_timeout.as_secs().clamp(1, 30),
            ),
        }
    }
}
