use std::sync::Arc;

use tokio::sync::mpsc;

use protocol::{
    AppResult, ControlFrame, REASON_CHUNK_GAP, REASON_HASH_MISMATCH, REASON_INCOMPLETE,
    REASON_OFFSET_GAP,
};

use crate::channel::{PeerChannel, PeerMessage};
use crate::events::{ReceivedFile, TransferEventSink, TransferProgress};
use crate::tuning::TransferTuning;

struct Accumulation {
    name: String,
    size: u64,
    expected_hash: Option<String>,
    buffer: Vec<u8>,
    bytes_since_ack: u64,
}

enum ChunkAction {
    Appended,
    Duplicate { name: String, received: u64 },
    Gap { name: String },
}

pub struct ReceiverPipeline {
    channel: PeerChannel,
    inbound: mpsc::Receiver<PeerMessage>,
    sink: Arc<dyn TransferEventSink>,
    tuning: TransferTuning,
    current: Option<Accumulation>,
    completed: Option<(String, u64)>,
}

impl ReceiverPipeline {
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
            current: None,
            completed: None,
        }
    }

    pub async fn run(&mut self) -> AppResult<()> {
        while let Some(message) = self.inbound.recv().await {
            let result = match message {
                PeerMessage::Control(ControlFrame::FileAnnounce {
                    name,
                    size,
                    offset,
                    hash,
                }) => self.on_announce(name, size, offset, hash).await,
                PeerMessage::Chunk { offset, data } => self.on_chunk(offset, data).await,
                PeerMessage::Control(ControlFrame::FileComplete { name, size }) => {
                    self.on_complete(name, size).await
                }
                PeerMessage::Control(other) => {
                    tracing::debug!(
                        event = "receiver_unexpected_control",
                        frame = format!("{other:?}")
                    );
                    Ok(())
                }
                PeerMessage::Closed => break,
            };
            if let Err(error) = result {
                tracing::warn!(
                    event = "receiver_link_lost",
                    code = error.code,
                    error = error.to_string()
                );
                break;
            }
        }
        Ok(())
    }

    async fn on_announce(
        &mut self,
        name: String,
        size: u64,
        offset: u64,
        hash: Option<String>,
    ) -> AppResult<()> {
        if offset == 0 {
            if let Some(previous) = &self.current {
                tracing::warn!(
                    event = "receiver_announce_restart",
                    name,
                    dropped_bytes = previous.buffer.len()
                );
            }
            self.current = Some(Accumulation {
                name: name.clone(),
                size,
                expected_hash: hash,
                buffer: Vec::new(),
                bytes_since_ack: 0,
            });
            self.emit_receive_progress(name.as_str(), size, 0);
            return self.try_finalize().await;
        }

        match self.current.as_mut() {
            Some(accumulation)
                if accumulation.name == name && offset <= accumulation.buffer.len() as u64 =>
            {
                accumulation.buffer.truncate(offset as usize);
                accumulation.size = size;
                if hash.is_some() {
                    accumulation.expected_hash = hash;
                }
                accumulation.bytes_since_ack = 0;
                let resumed = accumulation.buffer.len() as u64;
                tracing::info!(event = "receiver_resume", name, offset = resumed);
                self.emit_receive_progress(name.as_str(), size, resumed);
                Ok(())
            }
            _ => {
                tracing::warn!(event = "receiver_resume_gap", name, offset);
                self.send_error(name, REASON_OFFSET_GAP).await
            }
        }
    }

    async fn on_chunk(&mut self, offset: u64, data: Vec<u8>) -> AppResult<()> {
        let Some(accumulation) = self.current.as_mut() else {
            tracing::debug!(event = "receiver_chunk_without_announce", len = data.len());
            return Ok(());
        };

        let have = accumulation.buffer.len() as u64;
        let len = data.len() as u64;
        let action = if offset > have {
            ChunkAction::Gap {
                name: accumulation.name.clone(),
            }
        } else if offset + len <= have {
            ChunkAction::Duplicate {
                name: accumulation.name.clone(),
                received: have,
            }
        } else {
            let skip = (have - offset) as usize;
            accumulation.buffer.extend_from_slice(&data[skip..]);
            accumulation.bytes_since_ack += len - skip as u64;
            ChunkAction::Appended
        };

        match action {
            ChunkAction::Gap { name } => {
                tracing::warn!(event = "receiver_chunk_gap", name, offset, have);
                self.send_error(name, REASON_CHUNK_GAP).await
            }
            ChunkAction::Duplicate { name, received } => {
                self.send_ack(name, received, false).await
            }
            ChunkAction::Appended => {
                let (name, size, received, ack_due) = {
                    let accumulation = match self.current.as_mut() {
                        Some(accumulation) => accumulation,
                        None => return Ok(()),
                    };
                    let received = accumulation.buffer.len() as u64;
                    let ack_due =
                        accumulation.bytes_since_ack >= self.tuning.ack_interval_bytes;
                    if ack_due {
                        accumulation.bytes_since_ack = 0;
                    }
                    (accumulation.name.clone(), accumulation.size, received, ack_due)
                };

                self.emit_receive_progress(name.as_str(), size, received);
                if received >= size {
                    self.try_finalize().await
                } else if ack_due {
                    self.send_ack(name, received, false).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn on_complete(&mut self, name: String, size: u64) -> AppResult<()> {
        if let Some(accumulation) = &self.current
            && accumulation.name == name
        {
            let received = accumulation.buffer.len() as u64;
            tracing::warn!(
                event = "receiver_incomplete_file",
                name,
                received,
                declared = size
            );
            self.send_ack(name.clone(), received, false).await?;
            return self.send_error(name, REASON_INCOMPLETE).await;
        }

        if self
            .completed
            .as_ref()
            .is_some_and(|(done_name, done_size)| *done_name == name && *done_size == size)
        {
            return self.send_ack(name, size, true).await;
        }

        tracing::warn!(event = "receiver_complete_without_announce", name);
        self.send_error(name, REASON_INCOMPLETE).await
    }

    async fn try_finalize(&mut self) -> AppResult<()> {
        let done = matches!(
            &self.current,
            Some(accumulation) if accumulation.buffer.len() as u64 >= accumulation.size
        );
        if !done {
            return Ok(());
        }
        let Some(mut accumulation) = self.current.take() else {
            return Ok(());
        };
        accumulation.buffer.truncate(accumulation.size as usize);

        if let Some(expected) = accumulation.expected_hash.as_deref() {
            let actual = blake3::hash(accumulation.buffer.as_slice())
                .to_hex()
                .to_string();
            if actual != expected {
                tracing::warn!(event = "receiver_hash_mismatch", name = accumulation.name);
                return self.send_error(accumulation.name, REASON_HASH_MISMATCH).await;
            }
        }

        let name = accumulation.name;
        let size = accumulation.size;
        self.send_ack(name.clone(), size, true).await?;
        if let Err(error) = self.sink.emit_received_file(ReceivedFile {
            name: name.clone(),
            size,
            bytes: accumulation.buffer,
        }) {
            tracing::warn!(
                event = "transfer_event_emit_failed",
                event_name = "received_file",
                error = error.to_string()
            );
        }
        self.completed = Some((name.clone(), size));
        self.emit_receive_progress(name.as_str(), size, size);
        tracing::info!(event = "receiver_file_completed", name, size);
        Ok(())
    }

    async fn send_ack(&self, name: String, received_bytes: u64, complete: bool) -> AppResult<()> {
        self.channel
            .send_control(ControlFrame::Ack {
                name,
                received_bytes,
                complete,
            })
            .await
    }

    async fn send_error(&self, name: String, reason: &str) -> AppResult<()> {
        self.channel
            .send_control(ControlFrame::Error {
                name,
                reason: reason.to_string(),
            })
            .await
    }

    fn emit_receive_progress(&self, name: &str, total_bytes: u64, transferred_bytes: u64) {
        let progress = TransferProgress {
            name: name.to_string(),
            total_bytes,
            transferred_bytes,
            attempt: 0,
        };
        if let Err(error) = self.sink.emit_receive_progress(&progress) {
            tracing::warn!(
                event = "transfer_event_emit_failed",
                event_name = "receive_progress",
                error = error.to_string()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{RelayChannel, decode_relay_meta};
    use protocol::ClientEvent;
    use std::sync::Mutex;

    struct CollectingSink {
        files: Mutex<Vec<ReceivedFile>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                files: Mutex::new(Vec::new()),
            })
        }

        fn files(&self) -> Vec<ReceivedFile> {
            self.files.lock().expect("files lock").clone()
        }
    }

    impl TransferEventSink for CollectingSink {
        fn emit_phase(&self, _name: &str, _phase: crate::events::TransferPhase) -> AppResult<()> {
            Ok(())
        }

        fn emit_send_progress(&self, _progress: &TransferProgress) -> AppResult<()> {
            Ok(())
        }

        fn emit_receive_progress(&self, _progress: &TransferProgress) -> AppResult<()> {
            Ok(())
        }

        fn emit_received_file(&self, file: ReceivedFile) -> AppResult<()> {
            self.files.lock().expect("files lock").push(file);
            Ok(())
        }
    }

    struct Harness {
        feed: mpsc::Sender<PeerMessage>,
        outbound: mpsc::Receiver<ClientEvent>,
        sink: Arc<CollectingSink>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_receiver() -> Harness {
        let (feed_tx, feed_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let sink = CollectingSink::new();
        let channel = PeerChannel::Relay(RelayChannel::new("000123".to_string(), outbound_tx));
        let mut pipeline = ReceiverPipeline::new(
            channel,
            feed_rx,
            sink.clone(),
            TransferTuning::default(),
        );
        let task = tokio::spawn(async move {
            pipeline.run().await.expect("receiver run");
        });
        Harness {
            feed: feed_tx,
            outbound: outbound_rx,
            sink,
            task,
        }
    }

    async fn next_control(outbound: &mut mpsc::Receiver<ClientEvent>) -> ControlFrame {
        loop {
            let event = outbound.recv().await.expect("outbound event");
            if let ClientEvent::RelayMeta { meta, .. } = event {
                return decode_relay_meta(&meta).expect("decode control");
            }
        }
    }

    fn announce(name: &str, size: u64, offset: u64) -> PeerMessage {
        PeerMessage::Control(ControlFrame::FileAnnounce {
            name: name.to_string(),
            size,
            offset,
            hash: None,
        })
    }

    fn complete(name: &str, size: u64) -> PeerMessage {
        PeerMessage::Control(ControlFrame::FileComplete {
            name: name.to_string(),
            size,
        })
    }

    #[tokio::test]
    async fn zero_byte_file_should_finalize_at_announce() {
        let mut harness = spawn_receiver();

        harness.feed.send(announce("empty.bin", 0, 0)).await.expect("announce");
        let ack = next_control(&mut harness.outbound).await;
        assert_eq!(
            ack,
            ControlFrame::Ack {
                name: "empty.bin".to_string(),
                received_bytes: 0,
                complete: true,
            }
        );

        harness.feed.send(complete("empty.bin", 0)).await.expect("complete");
        let ack = next_control(&mut harness.outbound).await;
        assert!(matches!(ack, ControlFrame::Ack { complete: true, .. }));

        let files = harness.sink.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 0);
        harness.task.abort();
    }

    #[tokio::test]
    async fn premature_complete_should_report_incomplete_and_allow_resume() {
        let mut harness = spawn_receiver();

        harness.feed.send(announce("a.bin", 1000, 0)).await.expect("announce");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 0,
                data: vec![7u8; 800],
            })
            .await
            .expect("partial chunk");
        harness.feed.send(complete("a.bin", 1000)).await.expect("premature complete");

        let ack = next_control(&mut harness.outbound).await;
        assert_eq!(
            ack,
            ControlFrame::Ack {
                name: "a.bin".to_string(),
                received_bytes: 800,
                complete: false,
            }
        );
        let error = next_control(&mut harness.outbound).await;
        assert_eq!(
            error,
            ControlFrame::Error {
                name: "a.bin".to_string(),
                reason: REASON_INCOMPLETE.to_string(),
            }
        );

        harness.feed.send(announce("a.bin", 1000, 800)).await.expect("resume announce");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 800,
                data: vec![9u8; 200],
            })
            .await
            .expect("tail chunk");
        harness.feed.send(complete("a.bin", 1000)).await.expect("final complete");

        let ack = next_control(&mut harness.outbound).await;
        assert_eq!(
            ack,
            ControlFrame::Ack {
                name: "a.bin".to_string(),
                received_bytes: 1000,
                complete: true,
            }
        );

        let files = harness.sink.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].bytes.len(), 1000);
        assert!(files[0].bytes[..800].iter().all(|byte| *byte == 7));
        assert!(files[0].bytes[800..].iter().all(|byte| *byte == 9));
        harness.task.abort();
    }

    #[tokio::test]
    async fn duplicate_announce_should_restart_accumulation() {
        let mut harness = spawn_receiver();

        harness.feed.send(announce("a.bin", 100, 0)).await.expect("announce");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 0,
                data: vec![1u8; 40],
            })
            .await
            .expect("first partial");
        harness.feed.send(announce("a.bin", 100, 0)).await.expect("restart announce");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 0,
                data: vec![2u8; 100],
            })
            .await
            .expect("full chunk");

        let ack = next_control(&mut harness.outbound).await;
        assert_eq!(
            ack,
            ControlFrame::Ack {
                name: "a.bin".to_string(),
                received_bytes: 100,
                complete: true,
            }
        );
        let files = harness.sink.files();
        assert_eq!(files.len(), 1);
        assert!(files[0].bytes.iter().all(|byte| *byte == 2));
        harness.task.abort();
    }

    #[tokio::test]
    async fn gapped_chunk_should_be_rejected_without_losing_progress() {
        let mut harness = spawn_receiver();

        harness.feed.send(announce("a.bin", 100, 0)).await.expect("announce");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 50,
                data: vec![1u8; 10],
            })
            .await
            .expect("gapped chunk");

        let error = next_control(&mut harness.outbound).await;
        assert_eq!(
            error,
            ControlFrame::Error {
                name: "a.bin".to_string(),
                reason: REASON_CHUNK_GAP.to_string(),
            }
        );
        harness.task.abort();
    }

    #[tokio::test]
    async fn duplicate_chunk_should_be_reacked_and_dropped() {
        let mut harness = spawn_receiver();

        harness.feed.send(announce("a.bin", 100, 0)).await.expect("announce");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 0,
                data: vec![1u8; 40],
            })
            .await
            .expect("first chunk");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 0,
                data: vec![1u8; 40],
            })
            .await
            .expect("duplicate chunk");

        let ack = next_control(&mut harness.outbound).await;
        assert_eq!(
            ack,
            ControlFrame::Ack {
                name: "a.bin".to_string(),
                received_bytes: 40,
                complete: false,
            }
        );
        harness.task.abort();
    }

    #[tokio::test]
    async fn hash_mismatch_should_reject_the_finished_file() {
        let mut harness = spawn_receiver();

        harness
            .feed
            .send(PeerMessage::Control(ControlFrame::FileAnnounce {
                name: "a.bin".to_string(),
                size: 4,
                offset: 0,
                hash: Some("00".repeat(32)),
            }))
            .await
            .expect("announce with hash");
        harness
            .feed
            .send(PeerMessage::Chunk {
                offset: 0,
                data: vec![1, 2, 3, 4],
            })
            .await
            .expect("chunk");

        let error = next_control(&mut harness.outbound).await;
        assert_eq!(
            error,
            ControlFrame::Error {
                name: "a.bin".to_string(),
                reason: REASON_HASH_MISMATCH.to_string(),
            }
        );
        assert!(harness.sink.files().is_empty());
        harness.task.abort();
    }

    #[tokio::test]
    async fn unexpected_ack_should_be_ignored() {
        let harness = spawn_receiver();
        harness
            .feed
            .send(PeerMessage::Control(ControlFrame::Ack {
                name: "a.bin".to_string(),
                received_bytes: 1,
                complete: false,
            }))
            .await
            .expect("stray ack");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(harness.sink.files().is_empty());
        harness.task.abort();
    }
}
