use protocol::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Announced,
    Sending,
    AwaitingAck,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub name: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub attempt: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

pub trait TransferEventSink: Send + Sync {
    fn emit_phase(&self, name: &str, phase: TransferPhase) -> AppResult<()>;
    fn emit_send_progress(&self, progress: &TransferProgress) -> AppResult<()>;
    fn emit_receive_progress(&self, progress: &TransferProgress) -> AppResult<()>;
    fn emit_received_file(&self, file: ReceivedFile) -> AppResult<()>;
}

pub struct NoopTransferEventSink;

impl TransferEventSink for NoopTransferEventSink {
    fn emit_phase(&self, _name: &str, _phase: TransferPhase) -> AppResult<()> {
        Ok(())
    }

    fn emit_send_progress(&self, _progress: &TransferProgress) -> AppResult<()> {
        Ok(())
    }

    fn emit_receive_progress(&self, _progress: &TransferProgress) -> AppResult<()> {
        Ok(())
    }

    fn emit_received_file(&self, _file: ReceivedFile) -> AppResult<()> {
        Ok(())
    }
}
