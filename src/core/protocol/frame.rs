//! Binary frame encoding/decoding.
//!
//! Every message on a stream transport uses this compact envelope:
//!
//!   [1 byte: frame_type] [N bytes: payload]
//!
//! Frame types:
//!   0x01 = Control (JSON-encoded metadata or control action)
//!   0x02 = Chunk   (binary: 16 bytes file_id + 4 bytes index BE + raw data)
//!
//! Chunks skip JSON entirely so bulk data carries 21 bytes of framing and no
//! base64 inflation.

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::message::{ControlAction, ControlMessage, FileMetadata, TransferMessage};
use crate::core::pipeline::chunk::Chunk;

/// Frame type marker for JSON-encoded non-bulk messages.
pub(crate) const FRAME_CONTROL: u8 = 0x01;

/// Frame type marker for binary chunk data.
pub(crate) const FRAME_CHUNK: u8 = 0x02;

/// `file_id` (16) + `index` (4).
const CHUNK_HEADER_LEN: usize = 16 + 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("chunk frame too short ({0} bytes)")]
    TruncatedChunk(usize),
    #[error("malformed control payload: {0}")]
    Control(#[from] serde_json::Error),
}

/// JSON body of a `FRAME_CONTROL` frame.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlBody {
    Metadata { metadata: FileMetadata },
    Control { file_id: Uuid, action: ControlAction },
}

/// Encode a message into a standalone frame.
pub fn encode(msg: &TransferMessage) -> Result<Vec<u8>, FrameError> {
    match msg {
        TransferMessage::Chunk(chunk) => {
            let mut buf = Vec::new();
            encode_chunk_frame_into(&mut buf, chunk.file_id, chunk.index, &chunk.data);
            Ok(buf)
        }
        TransferMessage::Metadata(metadata) => encode_control_frame(&ControlBody::Metadata {
            metadata: metadata.clone(),
        }),
        TransferMessage::Control(ctrl) => encode_control_frame(&ControlBody::Control {
            file_id: ctrl.file_id,
            action: ctrl.action,
        }),
    }
}

/// Encode a binary chunk frame into a reusable buffer, clearing it first.
/// [0x02][16 bytes uuid][4 bytes index BE][payload]
pub fn encode_chunk_frame_into(buf: &mut Vec<u8>, file_id: Uuid, index: u32, payload: &[u8]) {
    buf.clear();
    buf.reserve(1 + CHUNK_HEADER_LEN + payload.len());
    buf.put_u8(FRAME_CHUNK);
    buf.extend_from_slice(file_id.as_bytes());
    buf.put_u32(index);
    buf.extend_from_slice(payload);
}

/// Encode a control frame: [0x01][json bytes]
fn encode_control_frame(body: &ControlBody) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(body)?;
    let mut buf = Vec::with_capacity(1 + json.len());
    buf.put_u8(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode one frame into a [`TransferMessage`].
///
/// Chunk payloads are sliced out of `frame` without copying.
pub fn decode(frame: Bytes) -> Result<TransferMessage, FrameError> {
    let Some(&frame_type) = frame.first() else {
        return Err(FrameError::Empty);
    };

    match frame_type {
        FRAME_CHUNK => {
            if frame.len() < 1 + CHUNK_HEADER_LEN {
                return Err(FrameError::TruncatedChunk(frame.len()));
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&frame[1..17]);
            let index = u32::from_be_bytes([frame[17], frame[18], frame[19], frame[20]]);
            Ok(TransferMessage::Chunk(Chunk {
                file_id: Uuid::from_bytes(id),
                index,
                data: frame.slice(1 + CHUNK_HEADER_LEN..),
            }))
        }
        FRAME_CONTROL => match serde_json::from_slice::<ControlBody>(&frame[1..])? {
            ControlBody::Metadata { metadata } => Ok(TransferMessage::Metadata(metadata)),
            ControlBody::Control { file_id, action } => {
                Ok(TransferMessage::Control(ControlMessage { file_id, action }))
            }
        },
        other => Err(FrameError::UnknownType(other)),
    }
}
