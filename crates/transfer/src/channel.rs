use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tokio::sync::mpsc;

use protocol::{AppError, AppResult, ClientEvent, ControlFrame, RelayChunkMeta, ServerEvent};

use crate::direct::DirectChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Control(ControlFrame),
    Chunk { offset: u64, data: Vec<u8> },
    Closed,
}

#[derive(Clone)]
pub enum PeerChannel {
    Direct(DirectChannel),
    Relay(RelayChannel),
}

impl PeerChannel {
    pub async fn send_control(&self, frame: ControlFrame) -> AppResult<()> {
        match self {
            Self::Direct(channel) => channel.send_control(frame).await,
            Self::Relay(channel) => channel.send_control(frame).await,
        }
    }

    pub async fn send_chunk(&self, offset: u64, data: Vec<u8>) -> AppResult<()> {
        match self {
            Self::Direct(channel) => channel.send_chunk(offset, data).await,
            Self::Relay(channel) => channel.send_chunk(offset, data).await,
        }
    }

    pub fn close(&self) {
        if let Self::Direct(channel) = self {
            channel.close();
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }
}

#[derive(Clone)]
pub struct RelayChannel {
    code: String,
    outbound: mpsc::Sender<ClientEvent>,
}

impl RelayChannel {
    pub fn new(code: String, outbound: mpsc::Sender<ClientEvent>) -> Self {
        Self { code, outbound }
    }

    pub async fn send_control(&self, frame: ControlFrame) -> AppResult<()> {
        let meta = serde_json::to_value(&frame)
            .map_err(|error| relay_encode_error("control", error.to_string()))?;
        self.outbound
            .send(ClientEvent::RelayMeta {
                code: self.code.clone(),
                meta,
            })
            .await
            .map_err(|_| relay_closed())
    }

    pub async fn send_chunk(&self, offset: u64, data: Vec<u8>) -> AppResult<()> {
        let meta = serde_json::to_value(RelayChunkMeta { offset })
            .map_err(|error| relay_encode_error("chunk", error.to_string()))?;
        self.outbound
            .send(ClientEvent::RelayChunk {
                code: self.code.clone(),
                b64: BASE64.encode(data.as_slice()),
                meta,
            })
            .await
            .map_err(|_| relay_closed())
    }
}

fn relay_closed() -> AppError {
    AppError::new("relay_channel_closed", "中转通道已关闭")
}

fn relay_encode_error(kind: &str, cause: String) -> AppError {
    AppError::new("relay_encode_failed", "中转消息编码失败")
        .with_context("kind", kind.to_string())
        .with_cause(cause)
}

pub fn decode_relay_chunk(b64: &str, meta: &Value) -> AppResult<(u64, Vec<u8>)> {
    let meta: RelayChunkMeta = serde_json::from_value(meta.clone()).map_err(|error| {
        AppError::new("relay_chunk_meta_invalid", "中转分块元数据不合法").with_cause(error.to_string())
    })?;
    let data = BASE64.decode(b64).map_err(|error| {
        AppError::new("relay_chunk_decode_failed", "中转分块解码失败").with_cause(error.to_string())
    })?;
    Ok((meta.offset, data))
}

pub fn decode_relay_meta(meta: &Value) -> AppResult<ControlFrame> {
    serde_json::from_value(meta.clone()).map_err(|error| {
        AppError::new("relay_meta_invalid", "中转控制消息不合法").with_cause(error.to_string())
    })
}

pub fn relay_event_to_message(event: ServerEvent) -> Option<PeerMessage> {
    match event {
        ServerEvent::RelayChunk { b64, meta } => match decode_relay_chunk(b64.as_str(), &meta) {
            Ok((offset, data)) => Some(PeerMessage::Chunk { offset, data }),
            Err(error) => {
                tracing::warn!(event = "relay_chunk_dropped", code = error.code, error = error.to_string());
                None
            }
        },
        ServerEvent::RelayMeta { meta } => match decode_relay_meta(&meta) {
            Ok(frame) => Some(PeerMessage::Control(frame)),
            Err(error) => {
                tracing::warn!(event = "relay_meta_dropped", code = error.code, error = error.to_string());
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_chunk_should_roundtrip_through_wire_events() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let relay = RelayChannel::new("000123".to_string(), outbound_tx);

        relay.send_chunk(4096, vec![9u8; 17]).await.expect("send relay chunk");

        let event = outbound_rx.recv().await.expect("client event");
        let ClientEvent::RelayChunk { code, b64, meta } = event else {
            panic!("unexpected event");
        };
        assert_eq!(code, "000123");
        let (offset, data) = decode_relay_chunk(b64.as_str(), &meta).expect("decode chunk");
        assert_eq!(offset, 4096);
        assert_eq!(data, vec![9u8; 17]);
    }

    #[tokio::test]
    async fn relay_control_should_roundtrip_through_wire_events() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let relay = RelayChannel::new("000123".to_string(), outbound_tx);
        let frame = ControlFrame::Ack {
            name: "a.txt".to_string(),
            received_bytes: 10,
            complete: false,
        };

        relay.send_control(frame.clone()).await.expect("send relay control");

        let event = outbound_rx.recv().await.expect("client event");
        let ClientEvent::RelayMeta { meta, .. } = event else {
            panic!("unexpected event");
        };
        assert_eq!(decode_relay_meta(&meta).expect("decode control"), frame);
    }

    #[test]
    fn relay_event_to_message_should_drop_malformed_payloads() {
        let message = relay_event_to_message(ServerEvent::RelayChunk {
            b64: "!!!not-base64!!!".to_string(),
            meta: serde_json::json!({"offset": 0}),
        });
        assert!(message.is_none());

        let message = relay_event_to_message(ServerEvent::RelayMeta {
            meta: serde_json::json!({"type": "unknown"}),
        });
        assert!(message.is_none());
    }

    #[test]
    fn relay_event_to_message_should_convert_valid_payloads() {
        let message = relay_event_to_message(ServerEvent::RelayChunk {
            b64: BASE64.encode([1u8, 2, 3]),
            meta: serde_json::json!({"offset": 64}),
        });
        assert_eq!(
            message,
            Some(PeerMessage::Chunk {
                offset: 64,
                data: vec![1, 2, 3],
            })
        );
    }
}
