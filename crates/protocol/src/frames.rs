use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REASON_INCOMPLETE: &str = "incomplete";
pub const REASON_OFFSET_GAP: &str = "offset-gap";
pub const REASON_CHUNK_GAP: &str = "chunk-gap";
pub const REASON_HASH_MISMATCH: &str = "hash-mismatch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlFrame {
    #[serde(rename = "file")]
    FileAnnounce {
        name: String,
        size: u64,
        #[serde(default)]
        offset: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },
    FileComplete {
        name: String,
        size: u64,
    },
    Ack {
        name: String,
        received_bytes: u64,
        #[serde(default)]
        complete: bool,
    },
    Error {
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalPayload {
    Offer { token: String },
    Answer { token: String },
    Candidate { addr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayChunkMeta {
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom { code: String },
    Signal { code: String, data: Value },
    RelayChunk { code: String, b64: String, meta: Value },
    RelayMeta { code: String, meta: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RoomSize { size: usize },
    PeerJoined,
    PeerLeft,
    RoomFull,
    Signal { data: Value },
    RelayChunk { b64: String, meta: Value },
    RelayMeta { meta: Value },
}
