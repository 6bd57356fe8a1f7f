use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};

use protocol::{
    AppError, AppResult, ControlFrame, ResultExt, SignalPayload, WireFrame, read_frame_from,
    write_frame_to,
};

use crate::channel::PeerMessage;
use crate::direct::DirectChannel;
use crate::tuning::TransferTuning;

const HELLO_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Connected,
    Closed,
}

struct SessionShared {
    remote_token: Option<String>,
    channel: Option<DirectChannel>,
}

struct SessionCore {
    role: SessionRole,
    local_token: String,
    watermark: u64,
    connect_timeout: Duration,
    signal_out: mpsc::UnboundedSender<SignalPayload>,
    inbound_tx: mpsc::Sender<PeerMessage>,
    state_tx: watch::Sender<SessionState>,
    shared: Mutex<SessionShared>,
}

pub struct TransportSession {
    core: Arc<SessionCore>,
    initiated: AtomicBool,
}

impl TransportSession {
    pub fn new(
        role: SessionRole,
        signal_out: mpsc::UnboundedSender<SignalPayload>,
        inbound_tx: mpsc::Sender<PeerMessage>,
        tuning: &TransferTuning,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                role,
                local_token: session_token(),
                watermark: tuning.send_watermark,
                connect_timeout: tuning.negotiation_timeout,
                signal_out,
                inbound_tx,
                state_tx: watch::channel(SessionState::Negotiating).0,
                shared: Mutex::new(SessionShared {
                    remote_token: None,
                    channel: None,
                }),
            }),
            initiated: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.core.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.core.state_tx.subscribe()
    }

    pub fn direct_channel(&self) -> Option<DirectChannel> {
        lock_shared(&self.core).channel.clone()
    }

    pub async fn initiate(&self) -> AppResult<()> {
        if self.core.role != SessionRole::Initiator {
            return Err(AppError::new("session_role_invalid", "仅发起方可以发起协商"));
        }
        if self.initiated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .with_code("session_listener_bind_failed", "无法绑定协商监听端口")?;
        let port = listener
            .local_addr()
            .with_code("session_listener_addr_failed", "无法读取协商监听地址")?
            .port();

        emit_signal(
            &self.core,
            SignalPayload::Offer {
                token: self.core.local_token.clone(),
            },
        );
        for addr in local_candidates(port) {
            emit_signal(&self.core, SignalPayload::Candidate { addr });
        }

        tokio::spawn(run_accept(self.core.clone(), listener));
        Ok(())
    }

    pub fn accept_signal(&self, payload: SignalPayload) {
        match (self.core.role, payload) {
            (SessionRole::Responder, SignalPayload::Offer { token }) => {
                lock_shared(&self.core).remote_token = Some(token);
                tracing::debug!(event = "session_offer_received");
            }
            (SessionRole::Responder, SignalPayload::Candidate { addr }) => {
                let token = match lock_shared(&self.core).remote_token.clone() {
                    Some(token) => token,
                    None => {
                        tracing::warn!(event = "session_candidate_before_offer", addr);
                        return;
                    }
                };
                if self.state() != SessionState::Negotiating {
                    return;
                }
                tokio::spawn(run_dial(self.core.clone(), addr, token));
            }
            (SessionRole::Initiator, SignalPayload::Answer { token }) => {
                if token == self.core.local_token {
                    tracing::debug!(event = "session_answer_received");
                } else {
                    tracing::warn!(event = "session_answer_token_mismatch");
                }
            }
            (role, payload) => {
                tracing::warn!(
                    event = "session_signal_unexpected",
                    role = format!("{role:?}"),
                    payload = format!("{payload:?}")
                );
            }
        }
    }

    pub async fn send_control(&self, frame: ControlFrame) -> AppResult<()> {
        self.connected_channel()?.send_control(frame).await
    }

    pub async fn send_chunk(&self, offset: u64, data: Vec<u8>) -> AppResult<()> {
        self.connected_channel()?.send_chunk(offset, data).await
    }

    pub fn close(&self) {
        let channel = lock_shared(&self.core).channel.clone();
        if let Some(channel) = channel {
            channel.close();
        }
        self.core.state_tx.send_replace(SessionState::Closed);
    }

    fn connected_channel(&self) -> AppResult<DirectChannel> {
        if self.state() != SessionState::Connected {
            return Err(AppError::new("transport_not_ready", "传输通道尚未就绪"));
        }
        self.direct_channel()
            .ok_or_else(|| AppError::new("transport_not_ready", "传输通道尚未就绪"))
    }
}

fn lock_shared(core: &SessionCore) -> std::sync::MutexGuard<'_, SessionShared> {
    match core.shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "session_lock_poisoned");
            poisoned.into_inner()
        }
    }
}

fn emit_signal(core: &SessionCore, payload: SignalPayload) {
    if core.signal_out.send(payload).is_err() {
        tracing::debug!(event = "session_signal_sink_closed");
    }
}

fn adopt_stream(core: &Arc<SessionCore>, stream: TcpStream) -> bool {
    let mut shared = lock_shared(core);
    if shared.channel.is_some() || *core.state_tx.borrow() == SessionState::Closed {
        return false;
    }

    let (read_half, write_half) = stream.into_split();
    let channel = DirectChannel::spawn(
        read_half,
        write_half,
        core.watermark,
        core.inbound_tx.clone(),
    );
    let mut close_rx = channel.closed_watch();
    shared.channel = Some(channel);
    drop(shared);

    core.state_tx.send_replace(SessionState::Connected);
    tracing::info!(event = "session_connected", role = format!("{:?}", core.role));

    let state_tx = core.state_tx.clone();
    tokio::spawn(async move {
        loop {
            if *close_rx.borrow_and_update() {
                state_tx.send_replace(SessionState::Closed);
                break;
            }
            if close_rx.changed().await.is_err() {
                break;
            }
        }
    });
    true
}

async fn run_accept(core: Arc<SessionCore>, listener: TcpListener) {
    let deadline = Instant::now() + core.connect_timeout;
    loop {
        if *core.state_tx.borrow() != SessionState::Negotiating {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!(event = "session_accept_timeout");
            return;
        }

        let (mut stream, peer_addr) = match timeout(remaining, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(error)) => {
                tracing::warn!(event = "session_accept_failed", error = error.to_string());
                return;
            }
            Err(_) => {
                tracing::debug!(event = "session_accept_timeout");
                return;
            }
        };

        match timeout(HELLO_TIMEOUT, read_frame_from(&mut stream)).await {
            Ok(Ok(WireFrame::Hello { token })) if token == core.local_token => {
                if adopt_stream(&core, stream) {
                    return;
                }
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                tracing::warn!(event = "session_hello_invalid", peer_addr = %peer_addr);
            }
            Err(_) => {
                tracing::debug!(event = "session_hello_timeout", peer_addr = %peer_addr);
            }
        }
    }
}

async fn run_dial(core: Arc<SessionCore>, addr: String, token: String) {
    let mut stream = match timeout(core.connect_timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            tracing::debug!(event = "session_dial_failed", addr, error = error.to_string());
            return;
        }
        Err(_) => {
            tracing::debug!(event = "session_dial_timeout", addr);
            return;
        }
    };

    let hello = WireFrame::Hello {
        token: token.clone(),
    };
    if let Err(error) = write_frame_to(&mut stream, &hello).await {
        tracing::debug!(event = "session_hello_send_failed", addr, code = error.code);
        return;
    }

    if adopt_stream(&core, stream) {
        emit_signal(&core, SignalPayload::Answer { token });
    }
}

fn session_token() -> String {
    let mut value = [0u8; 16];
    rand::rng().fill_bytes(&mut value);
    let mut output = String::with_capacity(value.len() * 2);
    for byte in value {
        output.push_str(format!("{byte:02x}").as_str());
    }
    output
}

fn local_candidates(port: u16) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0))
        && socket.connect(("8.8.8.8", 80)).is_ok()
        && let Ok(addr) = socket.local_addr()
        && !addr.ip().is_loopback()
    {
        candidates.push(format!("{}:{port}", addr.ip()));
    }
    candidates.push(format!("127.0.0.1:{port}"));
    candidates
}
