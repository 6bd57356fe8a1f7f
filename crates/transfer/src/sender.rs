use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

use protocol::{AppResult, ControlFrame, REASON_HASH_MISMATCH, ResultExt};

use crate::channel::{PeerChannel, PeerMessage};
use crate::events::{TransferEventSink, TransferPhase, TransferProgress};
use crate::offset::{clamp_resume_offset, next_chunk_len};
use crate::tuning::TransferTuning;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub name: String,
    pub path: PathBuf,
}

impl SendRequest {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        Self { name, path }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub name: String,
    pub size: u64,
    pub phase: TransferPhase,
    pub acked_offset: u64,
    pub attempts: u8,
}

#[derive(Debug)]
struct Transfer {
    name: String,
    size: u64,
    sent_offset: u64,
    acked_offset: u64,
    attempt: u8,
    phase: TransferPhase,
}

impl Transfer {
    fn new(name: String, size: u64) -> Self {
        Self {
            name,
            size,
            sent_offset: 0,
            acked_offset: 0,
            attempt: 0,
            phase: TransferPhase::Announced,
        }
    }

    fn outcome(&self) -> TransferOutcome {
        TransferOutcome {
            name: self.name.clone(),
            size: self.size,
            phase: self.phase,
            acked_offset: self.acked_offset,
            attempts: self.attempt,
        }
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            name: self.name.clone(),
            total_bytes: self.size,
            transferred_bytes: self.sent_offset,
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum InboundEffect {
    Ignored,
    AckUpdated,
    TransferComplete,
    PeerError(String),
    LinkClosed,
}

fn apply_message(transfer: &mut Transfer, message: PeerMessage) -> InboundEffect {
    match message {
        PeerMessage::Control(ControlFrame::Ack {
            name,
            received_bytes,
            complete,
        }) if name == transfer.name => {
            let confirmed = clamp_resume_offset(transfer.size, received_bytes);
            if confirmed > transfer.acked_offset {
                transfer.acked_offset = confirmed;
            }
            if complete || received_bytes >= transfer.size {
                InboundEffect::TransferComplete
            } else {
                InboundEffect::AckUpdated
            }
        }
        PeerMessage::Control(ControlFrame::Error { name, reason }) if name == transfer.name => {
            if reason == REASON_HASH_MISMATCH {
                transfer.acked_offset = 0;
            }
            InboundEffect::PeerError(reason)
        }
        PeerMessage::Closed => InboundEffect::LinkClosed,
        _ => InboundEffect::Ignored,
    }
}

enum AttemptEnd {
    Completed,
    Retry(String),
}

pub struct SenderPipeline {
    channel: PeerChannel,
    inbound: mpsc::Receiver<PeerMessage>,
    sink: Arc<dyn TransferEventSink>,
    tuning: TransferTuning,
}

impl SenderPipeline {
    pub fn new(
        channel: PeerChannel,
        inbound: mpsc::Receiver<PeerMessage>,
        sink: Arc<dyn TransferEventSink>,
        tuning: TransferTuning,
    ) -> Self {
        Self {
            channel,
            inbound,
            sink,
            tuning: tuning.clamped(),
        }
    }

    pub async fn send_files(&mut self, requests: Vec<SendRequest>) -> Vec<TransferOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.send_file(&request).await);
        }
        outcomes
    }

    pub async fn send_file(&mut self, request: &SendRequest) -> TransferOutcome {
        let size = match tokio::fs::metadata(request.path.as_path()).await {
            Ok(metadata) => metadata.len(),
            Err(error) => {
                tracing::warn!(
                    event = "transfer_source_missing",
                    name = request.name,
                    error = error.to_string()
                );
                let mut transfer = Transfer::new(request.name.clone(), 0);
                transfer.phase = TransferPhase::Failed;
                self.emit_phase(request.name.as_str(), TransferPhase::Failed);
                return transfer.outcome();
            }
        };
        let hash = match file_digest(request.path.as_path()).await {
            Ok(hash) => Some(hash),
            Err(error) => {
                tracing::warn!(
                    event = "transfer_digest_failed",
                    name = request.name,
                    code = error.code,
                    error = error.to_string()
                );
                None
            }
        };

        let mut transfer = Transfer::new(request.name.clone(), size);
        loop {
            match self.run_attempt(&mut transfer, request.path.as_path(), hash.clone()).await {
                AttemptEnd::Completed => {
                    transfer.phase = TransferPhase::Completed;
                    self.emit_phase(transfer.name.as_str(), TransferPhase::Completed);
                    tracing::info!(
                        event = "transfer_completed",
                        name = transfer.name,
                        size,
                        attempts = transfer.attempt
                    );
                    break;
                }
                AttemptEnd::Retry(reason) => {
                    transfer.attempt += 1;
                    tracing::warn!(
                        event = "transfer_attempt_failed",
                        name = transfer.name,
                        attempt = transfer.attempt,
                        acked_offset = transfer.acked_offset,
                        reason
                    );
                    if transfer.attempt > self.tuning.max_attempts {
                        transfer.phase = TransferPhase::Failed;
                        self.emit_phase(transfer.name.as_str(), TransferPhase::Failed);
                        break;
                    }
                }
            }
        }
        transfer.outcome()
    }

    async fn run_attempt(
        &mut self,
        transfer: &mut Transfer,
        path: &Path,
        hash: Option<String>,
    ) -> AttemptEnd {
        let start = clamp_resume_offset(transfer.size, transfer.acked_offset);

        transfer.phase = TransferPhase::Announced;
        self.emit_phase(transfer.name.as_str(), TransferPhase::Announced);
        let announce = ControlFrame::FileAnnounce {
            name: transfer.name.clone(),
            size: transfer.size,
            offset: start,
            hash,
        };
        if self.channel.send_control(announce).await.is_err() {
            return AttemptEnd::Retry("announce_send_failed".to_string());
        }

        transfer.phase = TransferPhase::Sending;
        self.emit_phase(transfer.name.as_str(), TransferPhase::Sending);
        if transfer.size > 0 {
            if let Some(end) = self.stream_chunks(transfer, path, start).await {
                return end;
            }
        }

        let complete = ControlFrame::FileComplete {
            name: transfer.name.clone(),
            size: transfer.size,
        };
        if self.channel.send_control(complete).await.is_err() {
            return AttemptEnd::Retry("complete_send_failed".to_string());
        }

        transfer.phase = TransferPhase::AwaitingAck;
        self.emit_phase(transfer.name.as_str(), TransferPhase::AwaitingAck);
        self.await_ack(transfer).await
    }

    async fn stream_chunks(
        &mut self,
        transfer: &mut Transfer,
        path: &Path,
        start: u64,
    ) -> Option<AttemptEnd> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!(
                    event = "transfer_source_open_failed",
                    name = transfer.name,
                    error = error.to_string()
                );
                return Some(AttemptEnd::Retry("source_open_failed".to_string()));
            }
        };
        if file.seek(SeekFrom::Start(start)).await.is_err() {
            return Some(AttemptEnd::Retry("source_seek_failed".to_string()));
        }

        let mut offset = start;
        while offset < transfer.size {
            while let Ok(message) = self.inbound.try_recv() {
                match apply_message(transfer, message) {
                    InboundEffect::TransferComplete => return Some(AttemptEnd::Completed),
                    InboundEffect::PeerError(reason) => {
                        return Some(AttemptEnd::Retry(format!("peer_error:{reason}")));
                    }
                    InboundEffect::LinkClosed => {
                        return Some(AttemptEnd::Retry("channel_closed".to_string()));
                    }
                    InboundEffect::AckUpdated | InboundEffect::Ignored => {}
                }
            }

            let len = next_chunk_len(transfer.size, offset, self.tuning.chunk_size);
            let mut buffer = vec![0u8; len];
            if file.read_exact(buffer.as_mut_slice()).await.is_err() {
                return Some(AttemptEnd::Retry("source_read_failed".to_string()));
            }
            if self.channel.send_chunk(offset, buffer).await.is_err() {
                return Some(AttemptEnd::Retry("chunk_send_failed".to_string()));
            }

            offset += len as u64;
            if offset > transfer.sent_offset {
                transfer.sent_offset = offset;
            }
            self.emit_send_progress(transfer);
        }
        None
    }

    async fn await_ack(&mut self, transfer: &mut Transfer) -> AttemptEnd {
        let deadline = Instant::now() + self.tuning.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AttemptEnd::Retry("ack_timeout".to_string());
            }
            match timeout(remaining, self.inbound.recv()).await {
                Err(_) => return AttemptEnd::Retry("ack_timeout".to_string()),
                Ok(None) => return AttemptEnd::Retry("channel_closed".to_string()),
                Ok(Some(message)) => match apply_message(transfer, message) {
                    InboundEffect::TransferComplete => return AttemptEnd::Completed,
                    InboundEffect::PeerError(reason) => {
                        return AttemptEnd::Retry(format!("peer_error:{reason}"));
                    }
                    InboundEffect::LinkClosed => {
                        return AttemptEnd::Retry("channel_closed".to_string());
                    }
                    InboundEffect::AckUpdated | InboundEffect::Ignored => {}
                },
            }
        }
    }

    fn emit_phase(&self, name: &str, phase: TransferPhase) {
        if let Err(error) = self.sink.emit_phase(name, phase) {
            tracing::warn!(
                event = "transfer_event_emit_failed",
                event_name = "phase",
                error = error.to_string()
            );
        }
    }

    fn emit_send_progress(&self, transfer: &Transfer) {
        if let Err(error) = self.sink.emit_send_progress(&transfer.progress()) {
            tracing::warn!(
                event = "transfer_event_emit_failed",
                event_name = "send_progress",
                error = error.to_string()
            );
        }
    }
}

async fn file_digest(path: &Path) -> AppResult<String> {
    let mut file = File::open(path)
        .await
        .with_code("transfer_source_open_failed", "无法打开待发送文件")?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(buffer.as_mut_slice())
            .await
            .with_code("transfer_source_read_failed", "读取待发送文件失败")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
