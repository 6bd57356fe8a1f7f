mod codec;
mod errors;
mod frames;
mod room_code;

pub use codec::{FRAME_MAX_BYTES, WireFrame, read_frame_from, write_frame_to};
pub use errors::{AppError, AppErrorPayload, AppResult, ErrorContextItem, ResultExt};
pub use frames::{
    ClientEvent, ControlFrame, REASON_CHUNK_GAP, REASON_HASH_MISMATCH, REASON_INCOMPLETE,
    REASON_OFFSET_GAP, RelayChunkMeta, ServerEvent, SignalPayload,
};
pub use room_code::{ROOM_CODE_LEN, generate_room_code, is_valid_room_code, normalize_room_code};
