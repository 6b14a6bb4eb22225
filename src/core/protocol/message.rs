//! Logical messages exchanged between peers.
//!
//! Every message on the shared channel is one of three kinds: the metadata
//! that opens a transfer, an indexed chunk of file data, or a control signal
//! referencing an existing transfer. The kind is a single discriminant,
//! decoded once at the transport boundary (see [`super::frame`]).

use crate::core::pipeline::chunk::{chunk_count, Chunk, ChunkCountError};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

// ── Metadata ──────────────────────────────────────────────────────────────────

/// Descriptor of one logical transfer, sent before any of its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Random (v4) transfer identifier chosen by the sender.
    pub id: Uuid,
    pub name: String,
    pub mime_type: String,
    /// Size of the file in bytes.
    pub total_size: u64,
    /// Number of chunks the sender will emit. Computed once at send time;
    /// the receiver uses it as the sole completion criterion.
    pub total_chunks: u32,
}

impl FileMetadata {
    /// Build metadata for a new outgoing transfer with a fresh ID.
    ///
    /// Fails when `total_size` needs more chunks than a `u32` index can
    /// address at this `chunk_size`.
    pub fn new(
        name: String,
        mime_type: String,
        total_size: u64,
        chunk_size: usize,
    ) -> Result<Self, ChunkCountError> {
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            mime_type,
            total_size,
            total_chunks: chunk_count(total_size, chunk_size)?,
        })
    }
}

// ── Control ───────────────────────────────────────────────────────────────────

/// Out-of-band action applied to a transfer by either peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl Display for ControlAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => f.write_str("pause"),
            Self::Resume => f.write_str("resume"),
            Self::Cancel => f.write_str("cancel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub file_id: Uuid,
    pub action: ControlAction,
}

impl ControlMessage {
    pub fn new(file_id: Uuid, action: ControlAction) -> Self {
        Self { file_id, action }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A message carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    Metadata(FileMetadata),
    Chunk(Chunk),
    Control(ControlMessage),
}

impl TransferMessage {
    /// Transfer this message refers to.
    pub fn file_id(&self) -> Uuid {
        match self {
            Self::Metadata(meta) => meta.id,
            Self::Chunk(chunk) => chunk.file_id,
            Self::Control(ctrl) => ctrl.file_id,
        }
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::Chunk(_) => "chunk",
            Self::Control(_) => "control",
        }
    }
}
