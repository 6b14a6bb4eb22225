//! Chunker: streams a byte source as indexed chunks through a bounded channel.
//!
//! Instead of loading the entire file into memory, the chunker reads one
//! slice at a time on its own task and hands each chunk to a bounded channel,
//! so the send loop stays fed while the next read is in flight and memory
//! per outgoing file is capped at `CHUNK_READ_AHEAD` chunks.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  bounded chan  ┌───────────┐
//! │ ByteSource │ ─────────────► │ Send loop │──► Transport
//! │ (async)    │  ChunkerEvent  └───────────┘
//! └────────────┘
//! ```
//!
//! # Event contract
//!
//! For each chunk, in index order: `ChunkReady` then `Progress`. After the
//! last chunk: exactly one `Complete`. On a read failure: exactly one `Error`
//! and no `Complete`. A stop signal or a dropped receiver ends the task
//! silently between chunk reads.

use crate::core::config::CHUNK_READ_AHEAD;
use crate::core::pipeline::chunk::{chunk_count, chunk_len, Chunk};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use sha3::{Digest, Sha3_256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

// ── Byte source ───────────────────────────────────────────────────────────────

/// Where a [`ByteSource`] reads from.
enum SourceReader {
    File(tokio::fs::File),
    Memory(Bytes),
}

/// A file-like object handed to the chunker: size, type and positional reads.
pub struct ByteSource {
    name: String,
    mime_type: String,
    size: u64,
    location: Option<PathBuf>,
    reader: SourceReader,
}

impl ByteSource {
    /// Open a file on disk. Its MIME type is guessed from the extension.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| anyhow!("Failed to open {}: {e}", path.display()))?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(anyhow!("{} is not a regular file", path.display()));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            name,
            mime_type: mime_for_path(path),
            size: meta.len(),
            location: Some(path.to_path_buf()),
            reader: SourceReader::File(file),
        })
    }

    /// Wrap an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            location: None,
            reader: SourceReader::Memory(data),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path on disk, if this source is a file.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Read exactly `len` bytes starting at `offset`.
    async fn read_slice(&mut self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        match &mut self.reader {
            SourceReader::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            SourceReader::Memory(data) => {
                let start = offset as usize;
                let end = start + len;
                if end > data.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("slice {start}..{end} past end of {} bytes", data.len()),
                    ));
                }
                Ok(data.slice(start..end))
            }
        }
    }
}

/// Guess a MIME type from the file extension.
pub fn mime_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

// ── Events / control ──────────────────────────────────────────────────────────

/// Output of a chunker task.
#[derive(Debug)]
pub enum ChunkerEvent {
    ChunkReady(Chunk),
    Progress { file_id: Uuid, percent: f64 },
    /// All chunks emitted. Carries the hex SHA3-256 of the whole source.
    Complete { file_id: Uuid, sha3_256: String },
    Error { file_id: Uuid, message: String },
}

/// Cooperative controls polled by the chunker between chunk reads.
#[derive(Clone)]
pub struct ChunkerControl {
    pub stop: SignalOfStop,
    pub paused: watch::Receiver<bool>,
}

impl ChunkerControl {
    /// New control set, not stopped and not paused. The returned sender
    /// toggles the pause flag.
    pub fn new() -> (Self, watch::Sender<bool>) {
        let (pause_tx, paused) = watch::channel(false);
        (
            Self {
                stop: SignalOfStop::new(),
                paused,
            },
            pause_tx,
        )
    }

    /// Block while paused. Returns `false` if the chunker must stop.
    async fn wait_while_paused(&mut self) -> bool {
        loop {
            if self.stop.cancelled() {
                return false;
            }
            if !*self.paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        // Pause handle dropped while paused: nobody can resume us.
                        return false;
                    }
                }
                _ = self.stop.wait() => return false,
            }
        }
    }
}

// ── Chunker task ──────────────────────────────────────────────────────────────

/// Spawn a chunker for `source` under `file_id`.
///
/// Returns the bounded event receiver and the task handle.
pub fn spawn_chunker(
    file_id: Uuid,
    mut source: ByteSource,
    chunk_size: usize,
    mut control: ChunkerControl,
) -> (mpsc::Receiver<ChunkerEvent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHUNK_READ_AHEAD);

    let handle = tokio::spawn(async move {
        let size = source.size();
        let total_chunks = match chunk_count(size, chunk_size) {
            Ok(n) => n,
            Err(e) => {
                warn!(event = "chunk_count_invalid", %file_id, error = %e, "Cannot chunk source");
                let _ = tx
                    .send(ChunkerEvent::Error {
                        file_id,
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        let mut hasher = Sha3_256::new();

        for index in 0..total_chunks {
            if !control.wait_while_paused().await {
                debug!(event = "chunker_stopped", %file_id, index, "Chunker stopped before read");
                return;
            }

            let offset = index as u64 * chunk_size as u64;
            let len = chunk_len(index, size, chunk_size);
            let data = match source.read_slice(offset, len).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(event = "chunk_read_failure", %file_id, index, error = %e, "Failed to read chunk");
                    let _ = tx
                        .send(ChunkerEvent::Error {
                            file_id,
                            message: format!("Failed to read chunk {index}: {e}"),
                        })
                        .await;
                    return;
                }
            };
            hasher.update(&data);

            // Stop if the consumer (send loop) has been dropped.
            if tx
                .send(ChunkerEvent::ChunkReady(Chunk {
                    file_id,
                    index,
                    data,
                }))
                .await
                .is_err()
            {
                return;
            }

            let percent = (index + 1) as f64 / total_chunks as f64 * 100.0;
            if tx
                .send(ChunkerEvent::Progress { file_id, percent })
                .await
                .is_err()
            {
                return;
            }
        }

        if control.stop.cancelled() {
            return;
        }
        let _ = tx
            .send(ChunkerEvent::Complete {
                file_id,
                sha3_256: hex::encode(hasher.finalize()),
            })
            .await;
    });

    (rx, handle)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
