use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{AppError, AppResult};
use crate::frames::ControlFrame;

pub const FRAME_MAX_BYTES: usize = 4 * 1024 * 1024;
const HELLO_TOKEN_MAX_BYTES: usize = 128;
const CHUNK_HEADER_BYTES: usize = 8;

const MODE_CONTROL: u8 = 0;
const MODE_CHUNK: u8 = 1;
const MODE_HELLO: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Hello { token: String },
    Control(ControlFrame),
    Chunk { offset: u64, data: Vec<u8> },
}

fn wire_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(code, "传输帧不合法").with_cause(message.into())
}

fn serialize_frame(frame: &WireFrame) -> AppResult<(u8, Vec<u8>)> {
    match frame {
        WireFrame::Hello { token } => {
            let bytes = token.as_bytes();
            if bytes.is_empty() || bytes.len() > HELLO_TOKEN_MAX_BYTES {
                return Err(wire_error(
                    "wire_hello_token_invalid",
                    format!("token length: {}", bytes.len()),
                ));
            }
            Ok((MODE_HELLO, bytes.to_vec()))
        }
        WireFrame::Control(control) => {
            let payload = serde_json::to_vec(control).map_err(|error| {
                wire_error("wire_frame_serialize_failed", error.to_string())
            })?;
            Ok((MODE_CONTROL, payload))
        }
        WireFrame::Chunk { offset, data } => {
            let mut payload = Vec::with_capacity(CHUNK_HEADER_BYTES + data.len());
            payload.extend_from_slice(&offset.to_be_bytes());
            payload.extend_from_slice(data.as_slice());
            Ok((MODE_CHUNK, payload))
        }
    }
}

fn deserialize_frame(mode: u8, payload: Vec<u8>) -> AppResult<WireFrame> {
    match mode {
        MODE_HELLO => {
            if payload.len() > HELLO_TOKEN_MAX_BYTES {
                return Err(wire_error(
                    "wire_hello_token_invalid",
                    format!("token length: {}", payload.len()),
                ));
            }
            let token = String::from_utf8(payload)
                .map_err(|error| wire_error("wire_hello_token_invalid", error.to_string()))?;
            Ok(WireFrame::Hello { token })
        }
        MODE_CONTROL => {
            let control = serde_json::from_slice::<ControlFrame>(payload.as_slice())
                .map_err(|error| wire_error("wire_frame_parse_failed", error.to_string()))?;
            Ok(WireFrame::Control(control))
        }
        MODE_CHUNK => {
            if payload.len() < CHUNK_HEADER_BYTES {
                return Err(wire_error(
                    "wire_chunk_header_invalid",
                    format!("payload length: {}", payload.len()),
                ));
            }
            let (header, data) = payload.split_at(CHUNK_HEADER_BYTES);
            let mut offset_bytes = [0u8; CHUNK_HEADER_BYTES];
            offset_bytes.copy_from_slice(header);
            Ok(WireFrame::Chunk {
                offset: u64::from_be_bytes(offset_bytes),
                data: data.to_vec(),
            })
        }
        other => Err(wire_error(
            "wire_frame_mode_invalid",
            format!("invalid frame mode: {other}"),
        )),
    }
}

pub async fn write_frame_to<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &WireFrame,
) -> AppResult<()> {
    let (mode, payload) = serialize_frame(frame)?;
    if payload.is_empty() || payload.len() > FRAME_MAX_BYTES {
        return Err(wire_error(
            "wire_frame_length_invalid",
            format!("payload length: {}", payload.len()),
        ));
    }

    let mut header = [0u8; 5];
    header[0] = mode;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    writer.write_all(&header).await.map_err(io_to_error)?;
    writer
        .write_all(payload.as_slice())
        .await
        .map_err(io_to_error)?;
    writer.flush().await.map_err(io_to_error)?;
    Ok(())
}

pub async fn read_frame_from<R: AsyncRead + Unpin>(reader: &mut R) -> AppResult<WireFrame> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await.map_err(io_to_error)?;

    let mode = header[0];
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length == 0 || length > FRAME_MAX_BYTES {
        return Err(wire_error(
            "wire_frame_length_invalid",
            format!("invalid frame length: {length}"),
        ));
    }

    let mut payload = vec![0u8; length];
    reader
        .read_exact(payload.as_mut_slice())
        .await
        .map_err(io_to_error)?;

    deserialize_frame(mode, payload)
}

fn io_to_error(error: io::Error) -> AppError {
    match error.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => {
            AppError::new("wire_connection_closed", "传输连接已断开").with_cause(error.to_string())
        }
        _ => AppError::new("wire_io_error", "传输链路 I/O 错误").with_cause(error.to_string()),
    }
}
