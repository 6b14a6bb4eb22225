//! Chunk data structures and the receive-side accumulator.
//!
//! Each chunk carries:
//! - file_id: identifies the transfer it belongs to
//! - index: zero-based position within the file
//! - data: the raw bytes of that slice
//!
//! Chunks may arrive in any order and more than once. The accumulator keys
//! them by index, so completion is decided by cardinality, never by which
//! index happened to arrive last.

use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// One indexed slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_id: Uuid,
    pub index: u32,
    pub data: Bytes,
}

/// A file that cannot be split into at most `u32::MAX + 1` chunks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{total_size} bytes cannot be split into chunks of {chunk_size} bytes")]
pub struct ChunkCountError {
    pub total_size: u64,
    pub chunk_size: usize,
}

/// Number of chunks needed for `total_size` bytes.
///
/// A zero-byte file has zero chunks; both the chunker and the completion
/// check rely on this. Fails for a zero chunk size or when the count does
/// not fit the `u32` chunk index.
pub fn chunk_count(total_size: u64, chunk_size: usize) -> Result<u32, ChunkCountError> {
    let err = ChunkCountError {
        total_size,
        chunk_size,
    };
    if chunk_size == 0 {
        return Err(err);
    }
    u32::try_from(total_size.div_ceil(chunk_size as u64)).map_err(|_| err)
}

/// Length of chunk `index` for a file of `total_size` bytes.
pub fn chunk_len(index: u32, total_size: u64, chunk_size: usize) -> usize {
    let offset = index as u64 * chunk_size as u64;
    (chunk_size as u64).min(total_size.saturating_sub(offset)) as usize
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk index {index} out of range (total_chunks {total_chunks})")]
    OutOfRange { index: u32, total_chunks: u32 },
    #[error("chunk {index} re-delivered with conflicting data")]
    Conflict { index: u32 },
    #[error("chunk {index} exceeds declared file size ({received} > {total_size} bytes)")]
    Oversize {
        index: u32,
        received: u64,
        total_size: u64,
    },
}

/// Result of a successful [`ChunkAccumulator::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First delivery of this index.
    Inserted,
    /// Same index with identical data; nothing changed.
    Duplicate,
}

/// Accumulates incoming chunks of one transfer, keyed by index.
#[derive(Debug, Clone)]
pub struct ChunkAccumulator {
    total_chunks: u32,
    total_size: u64,
    chunks: HashMap<u32, Bytes>,
    received_bytes: u64,
}

impl ChunkAccumulator {
    pub fn new(total_chunks: u32, total_size: u64) -> Self {
        Self {
            total_chunks,
            total_size,
            chunks: HashMap::with_capacity(total_chunks.min(4096) as usize),
            received_bytes: 0,
        }
    }

    /// Insert a chunk.
    ///
    /// Re-delivery of an index with identical bytes is a no-op. Re-delivery
    /// with different bytes is rejected, as is anything that would push the
    /// accumulated size past the declared file size.
    pub fn insert(&mut self, index: u32, data: Bytes) -> Result<InsertOutcome, ChunkError> {
        if index >= self.total_chunks {
            return Err(ChunkError::OutOfRange {
                index,
                total_chunks: self.total_chunks,
            });
        }

        if let Some(existing) = self.chunks.get(&index) {
            return if *existing == data {
                Ok(InsertOutcome::Duplicate)
            } else {
                Err(ChunkError::Conflict { index })
            };
        }

        let received = self.received_bytes + data.len() as u64;
        if received > self.total_size {
            return Err(ChunkError::Oversize {
                index,
                received,
                total_size: self.total_size,
            });
        }

        self.received_bytes = received;
        self.chunks.insert(index, data);
        Ok(InsertOutcome::Inserted)
    }

    /// Number of distinct indices received.
    pub fn received_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Percentage of distinct chunks received, `100.0` once complete.
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.received_count() as f64 / self.total_chunks as f64 * 100.0
    }

    /// Hand the accumulated chunks over for assembly.
    pub fn into_chunks(self) -> HashMap<u32, Bytes> {
        self.chunks
    }
}
