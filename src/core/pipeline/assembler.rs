//! Assembler: rebuilds a received file from its complete chunk set.
//!
//! Chunks are laid out by index: each one is written at the offset equal to
//! the summed lengths of all lower-indexed chunks. The receiver never assumes
//! the sender's chunk size; only `total_chunks` and `total_size` from the
//! metadata are trusted.
//!
//! Assembly runs on the blocking pool so a large copy never stalls the task
//! that ingests chunks for other transfers. Any inconsistency yields an
//! [`AssemblyError`] tagged with the file ID; partial output is never
//! returned.

use crate::core::protocol::FileMetadata;
use crate::utils::atomic_write::atomic_write;
use crate::utils::paths::{sanitize_file_name, unique_path};
use bytes::Bytes;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("assembly of {file_id} failed: {reason}")]
pub struct AssemblyError {
    pub file_id: Uuid,
    pub reason: String,
}

impl AssemblyError {
    fn new(file_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            file_id,
            reason: reason.into(),
        }
    }
}

/// A reconstructed file: contiguous bytes plus the type they were sent as.
#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub file_id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
    /// Hex SHA3-256 of `data`.
    pub sha3_256: String,
}

impl AssembledFile {
    /// Write the file into `dir` under its sanitized name, never overwriting
    /// an existing file. Returns the final path.
    pub fn save_into(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = unique_path(&dir.join(sanitize_file_name(&self.name)));
        atomic_write(&path, &self.data)?;
        Ok(path)
    }
}

/// Rebuild the original bytes from a complete chunk mapping.
///
/// The caller must only invoke this once `chunks.len() == total_chunks`.
pub fn assemble(
    metadata: &FileMetadata,
    mut chunks: HashMap<u32, Bytes>,
) -> Result<AssembledFile, AssemblyError> {
    let file_id = metadata.id;

    if chunks.len() != metadata.total_chunks as usize {
        return Err(AssemblyError::new(
            file_id,
            format!(
                "expected {} chunks, got {}",
                metadata.total_chunks,
                chunks.len()
            ),
        ));
    }

    let declared = metadata.total_size;
    let total: u64 = chunks.values().map(|c| c.len() as u64).sum();
    if total != declared {
        return Err(AssemblyError::new(
            file_id,
            format!("chunk lengths sum to {total} bytes, metadata declares {declared}"),
        ));
    }

    let data = if chunks.len() == 1 {
        // Single chunk: hand the buffer over without copying.
        chunks
            .remove(&0)
            .ok_or_else(|| AssemblyError::new(file_id, "missing chunk 0"))?
    } else {
        let mut buf = Vec::with_capacity(declared as usize);
        for index in 0..metadata.total_chunks {
            let chunk = chunks
                .get(&index)
                .ok_or_else(|| AssemblyError::new(file_id, format!("missing chunk {index}")))?;
            buf.extend_from_slice(chunk);
        }
        Bytes::from(buf)
    };

    Ok(AssembledFile {
        file_id,
        name: metadata.name.clone(),
        mime_type: metadata.mime_type.clone(),
        sha3_256: hex::encode(Sha3_256::digest(&data)),
        data,
    })
}

/// Run [`assemble`] on the blocking pool.
pub async fn spawn_assembly(
    metadata: FileMetadata,
    chunks: HashMap<u32, Bytes>,
) -> Result<AssembledFile, AssemblyError> {
    let file_id = metadata.id;
    tokio::task::spawn_blocking(move || assemble(&metadata, chunks))
        .await
        .map_err(|e| AssemblyError::new(file_id, format!("assembly task failed: {e}")))?
}
