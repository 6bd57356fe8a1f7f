use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use protocol::{AppError, AppResult, ClientEvent, ResultExt, ServerEvent, normalize_room_code};

const OUTBOUND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct SignalingClient {
    code: String,
    outbound: mpsc::Sender<ClientEvent>,
    events: mpsc::Receiver<ServerEvent>,
}

impl SignalingClient {
    pub async fn connect(server_url: &str, code: &str) -> AppResult<Self> {
        let code = normalize_room_code(code)?;
        let url = format!("{}/ws", server_url.trim_end_matches('/'));
        let (stream, _response) = connect_async(url.as_str())
            .await
            .with_code("signaling_connect_failed", "无法连接信令服务器")
            .map_err(|error| error.with_context("url", url.clone()))?;
        let (sink, source) = stream.split();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        tokio::spawn(run_writer(sink, outbound_rx));
        tokio::spawn(run_reader(source, events_tx));

        outbound_tx
            .send(ClientEvent::JoinRoom { code: code.clone() })
            .await
            .map_err(|_| signaling_closed())?;

        Ok(Self {
            code,
            outbound: outbound_tx,
            events: events_rx,
        })
    }

    pub fn code(&self) -> &str {
        self.code.as_str()
    }

    pub fn sender(&self) -> mpsc::Sender<ClientEvent> {
        self.outbound.clone()
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (String, mpsc::Sender<ClientEvent>, mpsc::Receiver<ServerEvent>) {
        (self.code, self.outbound, self.events)
    }
}

fn signaling_closed() -> AppError {
    AppError::new("signaling_closed", "信令连接已断开")
}

async fn run_writer<S>(mut sink: S, mut outbound_rx: mpsc::Receiver<ClientEvent>)
where
    S: Sink<Message> + Unpin,
{
    while let Some(event) = outbound_rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(event = "signaling_serialize_failed", error = error.to_string());
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            tracing::debug!(event = "signaling_send_failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn run_reader<S>(mut source: S, events_tx: mpsc::Sender<ServerEvent>)
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                Ok(event) => {
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(event = "signaling_parse_failed", error = error.to_string());
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(event = "signaling_receive_failed", error = error.to_string());
                break;
            }
        }
    }
}
