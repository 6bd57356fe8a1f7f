use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use protocol::{AppError, AppResult, ControlFrame, WireFrame, read_frame_from, write_frame_to};
use std::sync::Arc;

use crate::channel::PeerMessage;

fn channel_closed() -> AppError {
    AppError::new("peer_channel_closed", "点对点通道已关闭")
}

fn frame_cost(frame: &WireFrame) -> u64 {
    match frame {
        WireFrame::Chunk { data, .. } => data.len() as u64,
        WireFrame::Hello { .. } | WireFrame::Control(_) => 0,
    }
}

#[derive(Clone)]
pub struct DirectChannel {
    outbound: mpsc::UnboundedSender<WireFrame>,
    buffered: Arc<watch::Sender<u64>>,
    close_tx: Arc<watch::Sender<bool>>,
    watermark: u64,
}

impl DirectChannel {
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        watermark: u64,
        inbound: mpsc::Sender<PeerMessage>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(watch::channel(0u64).0);
        let close_tx = Arc::new(watch::channel(false).0);

        tokio::spawn(run_writer(
            writer,
            outbound_rx,
            buffered.clone(),
            close_tx.clone(),
        ));
        tokio::spawn(run_reader(reader, inbound, buffered.clone(), close_tx.clone()));

        Self {
            outbound: outbound_tx,
            buffered,
            close_tx,
            watermark,
        }
    }

    pub async fn send_control(&self, frame: ControlFrame) -> AppResult<()> {
        if self.is_closed() {
            return Err(channel_closed());
        }
        self.outbound
            .send(WireFrame::Control(frame))
            .map_err(|_| channel_closed())
    }

    pub async fn send_chunk(&self, offset: u64, data: Vec<u8>) -> AppResult<()> {
        self.wait_below_watermark().await?;
        let frame = WireFrame::Chunk { offset, data };
        let cost = frame_cost(&frame);
        self.buffered.send_modify(|value| *value += cost);
        self.outbound.send(frame).map_err(|_| {
            self.buffered
                .send_modify(|value| *value = value.saturating_sub(cost));
            channel_closed()
        })
    }

    pub async fn wait_below_watermark(&self) -> AppResult<()> {
        let mut buffered_rx = self.buffered.subscribe();
        loop {
            if self.is_closed() {
                return Err(channel_closed());
            }
            if *buffered_rx.borrow_and_update() < self.watermark {
                return Ok(());
            }
            buffered_rx.changed().await.map_err(|_| channel_closed())?;
        }
    }

    pub fn buffered_bytes(&self) -> u64 {
        *self.buffered.borrow()
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub fn close(&self) {
        self.close_tx.send_replace(true);
        self.buffered.send_modify(|value| *value = 0);
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut outbound_rx: mpsc::UnboundedReceiver<WireFrame>,
    buffered: Arc<watch::Sender<u64>>,
    close_tx: Arc<watch::Sender<bool>>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut close_rx = close_tx.subscribe();
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let cost = frame_cost(&frame);
                if let Err(error) = write_frame_to(&mut writer, &frame).await {
                    tracing::debug!(event = "direct_write_failed", code = error.code, error = error.to_string());
                    break;
                }
                buffered.send_modify(|value| *value = value.saturating_sub(cost));
            }
        }
    }
    close_tx.send_replace(true);
    buffered.send_modify(|value| *value = 0);
}

async fn run_reader<R>(
    mut reader: R,
    inbound: mpsc::Sender<PeerMessage>,
    buffered: Arc<watch::Sender<u64>>,
    close_tx: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut close_rx = close_tx.subscribe();
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            frame = read_frame_from(&mut reader) => {
                match frame {
                    Ok(WireFrame::Hello { .. }) => {}
                    Ok(WireFrame::Control(control)) => {
                        if inbound.send(PeerMessage::Control(control)).await.is_err() {
                            break;
                        }
                    }
                    Ok(WireFrame::Chunk { offset, data }) => {
                        if inbound.send(PeerMessage::Chunk { offset, data }).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::debug!(event = "direct_read_failed", code = error.code, error = error.to_string());
                        break;
                    }
                }
            }
        }
    }
    close_tx.send_replace(true);
    buffered.send_modify(|value| *value = 0);
    let _ = inbound.send(PeerMessage::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(
        watermark: u64,
        link_capacity: usize,
    ) -> (
        DirectChannel,
        mpsc::Receiver<PeerMessage>,
        DirectChannel,
        mpsc::Receiver<PeerMessage>,
    ) {
        let (left, right) = tokio::io::duplex(link_capacity);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        let (left_tx, left_rx) = mpsc::channel(64);
        let (right_tx, right_rx) = mpsc::channel(64);
        let left_channel = DirectChannel::spawn(left_read, left_write, watermark, left_tx);
        let right_channel = DirectChannel::spawn(right_read, right_write, watermark, right_tx);
        (left_channel, left_rx, right_channel, right_rx)
    }

    #[tokio::test]
    async fn frames_should_flow_between_both_ends() {
        let (left, _left_rx, _right, mut right_rx) = pair(1024 * 1024, 64 * 1024);

        left.send_control(ControlFrame::FileAnnounce {
            name: "a.txt".to_string(),
            size: 3,
            offset: 0,
            hash: None,
        })
        .await
        .expect("send announce");
        left.send_chunk(0, vec![1, 2, 3]).await.expect("send chunk");

        match right_rx.recv().await.expect("announce arrives") {
            PeerMessage::Control(ControlFrame::FileAnnounce { name, size, .. }) => {
                assert_eq!(name, "a.txt");
                assert_eq!(size, 3);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match right_rx.recv().await.expect("chunk arrives") {
            PeerMessage::Chunk { offset, data } => {
                assert_eq!(offset, 0);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    fn stalled_channel() -> (DirectChannel, tokio::io::DuplexStream, mpsc::Receiver<PeerMessage>) {
        let (link, peer_end) = tokio::io::duplex(16);
        let (link_read, link_write) = tokio::io::split(link);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let channel = DirectChannel::spawn(link_read, link_write, 4, inbound_tx);
        (channel, peer_end, inbound_rx)
    }

    #[tokio::test]
    async fn send_chunk_should_wait_until_buffer_drains() {
        let (channel, mut peer_end, _inbound_rx) = stalled_channel();

        channel.send_chunk(0, vec![0u8; 64]).await.expect("first chunk enqueues");

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            channel.send_chunk(64, vec![0u8; 64]),
        )
        .await;
        assert!(blocked.is_err(), "second chunk should wait at the watermark");

        let drain = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut sink = vec![0u8; 1024];
            loop {
                match peer_end.read(sink.as_mut_slice()).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            channel.send_chunk(64, vec![0u8; 64]),
        )
        .await
        .expect("wait resolves after drain")
        .expect("second chunk sends");

        channel.close();
        drain.abort();
    }

    #[tokio::test]
    async fn close_should_resolve_pending_watermark_wait_with_error() {
        let (channel, _peer_end, _inbound_rx) = stalled_channel();

        channel.send_chunk(0, vec![0u8; 64]).await.expect("fill the buffer");

        let waiter = channel.clone();
        let pending = tokio::spawn(async move { waiter.send_chunk(64, vec![0u8; 64]).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        channel.close();

        let result = pending.await.expect("waiter task finishes");
        let error = result.expect_err("pending wait should fail on close");
        assert_eq!(error.code, "peer_channel_closed");
    }

    #[tokio::test]
    async fn peer_disconnect_should_surface_closed_message() {
        let (left, _left_rx, _right, mut right_rx) = pair(1024, 1024);
        left.close();
        drop(left);

        let mut saw_closed = false;
        while let Some(message) = right_rx.recv().await {
            if matches!(message, PeerMessage::Closed) {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed, "reader should report the closed link");
    }
}
