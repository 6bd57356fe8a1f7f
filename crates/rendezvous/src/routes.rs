use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use protocol::{AppError, ClientEvent, ServerEvent, is_valid_room_code};

use crate::relay::dispatch_client_event;
use crate::store::RoomStore;

#[derive(Clone)]
pub struct AppState {
    pub store: RoomStore,
}

pub fn router(store: RoomStore) -> Router {
    Router::new()
        .route("/api/new-room", get(new_room))
        .route("/api/check-room/:code", get(check_room))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { store })
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    store: RoomStore,
) -> std::io::Result<()> {
    axum::serve(listener, router(store)).await
}

#[derive(Debug, Serialize)]
struct NewRoomResponse {
    code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckRoomResponse {
    exists: bool,
    size: usize,
}

#[derive(Debug)]
struct ApiError(AppError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code.as_str() {
            "room_code_space_exhausted" => StatusCode::SERVICE_UNAVAILABLE,
            "room_not_found" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.0)).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

async fn new_room(State(state): State<AppState>) -> Result<Json<NewRoomResponse>, ApiError> {
    let code = state.store.allocate_code()?;
    tracing::info!(event = "room_allocated", code);
    Ok(Json(NewRoomResponse { code }))
}

async fn check_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Json<CheckRoomResponse> {
    if !is_valid_room_code(code.as_str()) {
        return Json(CheckRoomResponse {
            exists: false,
            size: 0,
        });
    }
    Json(CheckRoomResponse {
        exists: state.store.exists(code.as_str()),
        size: state.store.size(code.as_str()),
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let member_id = uuid::Uuid::new_v4().to_string();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::debug!(event = "ws_member_connected", member_id);

    loop {
        tokio::select! {
            outgoing = outbox_rx.recv() => {
                let Some(event) = outgoing else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(error) => {
                        tracing::warn!(
                            event = "ws_event_serialize_failed",
                            member_id,
                            error = error.to_string()
                        );
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&state, member_id.as_str(), &outbox_tx, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(
                            event = "ws_receive_failed",
                            member_id,
                            error = error.to_string()
                        );
                        break;
                    }
                }
            }
        }
    }

    if let Some(outcome) = state.store.leave(member_id.as_str()) {
        tracing::debug!(
            event = "ws_member_disconnected",
            member_id,
            code = outcome.code,
            remaining = outcome.remaining
        );
    }
}

fn handle_client_text(
    state: &AppState,
    member_id: &str,
    outbox: &mpsc::UnboundedSender<ServerEvent>,
    text: &str,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(
                event = "ws_event_parse_failed",
                member_id,
                error = error.to_string()
            );
            return;
        }
    };

    if let Err(error) = dispatch_client_event(&state.store, member_id, outbox, event) {
        tracing::warn!(
            event = "ws_event_dispatch_failed",
            member_id,
            code = error.code,
            error = error.to_string()
        );
    }
}
