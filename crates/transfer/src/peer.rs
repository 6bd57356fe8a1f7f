use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use protocol::{AppError, AppResult, ClientEvent, ServerEvent, SignalPayload};

use crate::channel::{PeerChannel, PeerMessage, RelayChannel, relay_event_to_message};
use crate::session::{SessionRole, SessionState, TransportSession};
use crate::signaling::SignalingClient;
use crate::tuning::TransferTuning;

const INBOUND_CAPACITY: usize = 64;

pub struct PeerLink {
    pub channel: PeerChannel,
    pub inbound: mpsc::Receiver<PeerMessage>,
    pub guard: PeerGuard,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("direct", &self.channel.is_direct())
            .finish_non_exhaustive()
    }
}

pub struct PeerGuard {
    session: Arc<TransportSession>,
    pump: JoinHandle<()>,
}

impl PeerGuard {
    pub fn close(&self) {
        self.session.close();
        self.pump.abort();
    }
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.session.close();
        self.pump.abort();
    }
}

pub async fn establish(signaling: SignalingClient, tuning: &TransferTuning) -> AppResult<PeerLink> {
    let tuning = tuning.clone().clamped();
    let (code, outbound, mut events) = signaling.into_parts();

    let role = wait_for_peer(&code, &mut events).await?;
    tracing::info!(event = "peer_paired", code, role = format!("{role:?}"));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let session = Arc::new(TransportSession::new(
        role,
        signal_tx,
        inbound_tx.clone(),
        &tuning,
    ));

    let mut direct_possible = true;
    if role == SessionRole::Initiator
        && let Err(error) = session.initiate().await
    {
        tracing::warn!(event = "peer_initiate_failed", code = error.code, error = error.to_string());
        direct_possible = false;
    }

    let mut early_relay = Vec::new();
    let connected = if direct_possible {
        negotiate(
            &code,
            &session,
            &outbound,
            &mut events,
            &mut signal_rx,
            &mut early_relay,
            tuning.negotiation_timeout,
        )
        .await?
    } else {
        false
    };

    let channel = if connected {
        let direct = session.direct_channel().ok_or_else(|| {
            AppError::new("transport_not_ready", "传输通道尚未就绪")
        })?;
        PeerChannel::Direct(direct)
    } else {
        session.close();
        tracing::info!(event = "peer_relay_fallback", code);
        PeerChannel::Relay(RelayChannel::new(code.clone(), outbound.clone()))
    };

    for message in early_relay {
        let _ = inbound_tx.send(message).await;
    }

    let pump = tokio::spawn(run_pump(
        code,
        session.clone(),
        outbound,
        events,
        signal_rx,
        inbound_tx,
    ));

    Ok(PeerLink {
        channel,
        inbound: inbound_rx,
        guard: PeerGuard { session, pump },
    })
}

async fn wait_for_peer(
    code: &str,
    events: &mut mpsc::Receiver<ServerEvent>,
) -> AppResult<SessionRole> {
    loop {
        let event = events.recv().await.ok_or_else(signaling_closed)?;
        match event {
            ServerEvent::RoomFull => {
                return Err(AppError::new("room_full", "房间已满两名成员")
                    .with_context("code", code.to_string()));
            }
            ServerEvent::PeerJoined => return Ok(SessionRole::Initiator),
            ServerEvent::RoomSize { size } if size >= 2 => return Ok(SessionRole::Responder),
            ServerEvent::RoomSize { .. } | ServerEvent::PeerLeft => {}
            other => {
                tracing::debug!(event = "peer_event_before_pairing", detail = format!("{other:?}"));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn negotiate(
    code: &str,
    session: &Arc<TransportSession>,
    outbound: &mpsc::Sender<ClientEvent>,
    events: &mut mpsc::Receiver<ServerEvent>,
    signal_rx: &mut mpsc::UnboundedReceiver<SignalPayload>,
    early_relay: &mut Vec<PeerMessage>,
    negotiation_timeout: Duration,
) -> AppResult<bool> {
    let deadline = Instant::now() + negotiation_timeout;
    let mut state_rx = session.subscribe_state();

    loop {
        match *state_rx.borrow_and_update() {
            SessionState::Connected => return Ok(true),
            SessionState::Closed => return Ok(false),
            SessionState::Negotiating => {}
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(false);
                }
            }
            outgoing = signal_rx.recv() => {
                if let Some(payload) = outgoing {
                    forward_signal(code, outbound, &payload).await?;
                }
            }
            event = events.recv() => {
                match event {
                    None => return Err(signaling_closed()),
                    Some(ServerEvent::Signal { data }) => accept_remote_signal(session, data),
                    Some(ServerEvent::PeerLeft) => {
                        return Err(AppError::new("peer_left", "对端已离开房间")
                            .with_context("code", code.to_string()));
                    }
                    Some(event @ (ServerEvent::RelayChunk { .. } | ServerEvent::RelayMeta { .. })) => {
                        if let Some(message) = relay_event_to_message(event) {
                            early_relay.push(message);
                        }
                        return Ok(false);
                    }
                    Some(_) => {}
                }
            }
            _ = tokio::time::sleep(remaining) => {
                return Ok(false);
            }
        }
    }
}

async fn run_pump(
    code: String,
    session: Arc<TransportSession>,
    outbound: mpsc::Sender<ClientEvent>,
    mut events: mpsc::Receiver<ServerEvent>,
    mut signal_rx: mpsc::UnboundedReceiver<SignalPayload>,
    inbound_tx: mpsc::Sender<PeerMessage>,
) {
    loop {
        tokio::select! {
            outgoing = signal_rx.recv() => {
                let Some(payload) = outgoing else { break };
                if forward_signal(code.as_str(), &outbound, &payload).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    None => {
                        session.close();
                        let _ = inbound_tx.send(PeerMessage::Closed).await;
                        break;
                    }
                    Some(ServerEvent::Signal { data }) => accept_remote_signal(&session, data),
                    Some(ServerEvent::PeerLeft) => {
                        tracing::info!(event = "peer_left_room", code);
                        session.close();
                        let _ = inbound_tx.send(PeerMessage::Closed).await;
                        break;
                    }
                    Some(event @ (ServerEvent::RelayChunk { .. } | ServerEvent::RelayMeta { .. })) => {
                        if let Some(message) = relay_event_to_message(event)
                            && inbound_tx.send(message).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

async fn forward_signal(
    code: &str,
    outbound: &mpsc::Sender<ClientEvent>,
    payload: &SignalPayload,
) -> AppResult<()> {
    let data = serde_json::to_value(payload)
        .map_err(|error| {
            AppError::new("signal_encode_failed", "协商消息编码失败").with_cause(error.to_string())
        })?;
    outbound
        .send(ClientEvent::Signal {
            code: code.to_string(),
            data,
        })
        .await
        .map_err(|_| signaling_closed())
}

fn accept_remote_signal(session: &Arc<TransportSession>, data: serde_json::Value) {
    match serde_json::from_value::<SignalPayload>(data) {
        Ok(payload) => session.accept_signal(payload),
        Err(error) => {
            tracing::warn!(event = "signal_payload_invalid", error = error.to_string());
        }
    }
}

fn signaling_closed() -> AppError {
    AppError::new("signaling_closed", "信令连接已断开")
}
