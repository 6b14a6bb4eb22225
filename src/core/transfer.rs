//! Per-transfer record and its lifecycle.
//!
//! A [`TransferRecord`] tracks one file moving in one direction. It owns:
//! - State management (lifecycle transitions)
//! - Progress and byte accounting
//! - The receive-side chunk accumulator
//!
//! Records are only ever mutated by the [`TransferRegistry`](super::registry::TransferRegistry).

use crate::core::pipeline::chunk::ChunkAccumulator;
use crate::core::protocol::FileMetadata;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ── Transfer State Machine ───────────────────────────────────────────────────

/// All possible states a transfer can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Metadata built, chunking not yet started (sender only).
    Preparing,
    /// Chunks are flowing.
    Transferring,
    /// Suspended by either peer; received chunks are still accepted.
    Paused,
    /// All chunks sent or received.
    Completed,
    /// Cancelled by either peer.
    Cancelled,
    /// Unrecoverable failure, see `error_message`.
    Error,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Error
        )
    }
}

impl Display for TransferStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Preparing => "preparing",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

// ── Transfer Direction ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// We are sending the file to the peer.
    Sending,
    /// We are receiving the file from the peer.
    Receiving,
}

impl Display for TransferDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sending => f.write_str("sending"),
            Self::Receiving => f.write_str("receiving"),
        }
    }
}

// ── Transfer Record ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub metadata: FileMetadata,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    /// Bytes sent, or distinct bytes received.
    pub transferred_bytes: u64,
    /// Percentage in `[0, 100]`, never decreasing.
    pub progress: f64,
    pub started_at: Instant,
    pub paused_at: Option<Instant>,
    /// Accumulated time spent paused, excluded from speed.
    paused_total: Duration,
    /// When the record reached a terminal status.
    pub finished_at: Option<Instant>,
    pub error_message: Option<String>,
    /// Receive side only; taken when the transfer completes.
    pub(crate) accumulator: Option<ChunkAccumulator>,
    /// Receive side: chunks handed to the assembler, file not yet saved.
    pub(crate) assembling: bool,
}

impl TransferRecord {
    /// Outgoing transfer, created when chunking is about to start.
    pub fn new_outgoing(metadata: FileMetadata, now: Instant) -> Self {
        Self::new(metadata, TransferDirection::Sending, TransferStatus::Preparing, None, now)
    }

    /// Incoming transfer, created on the first metadata observation.
    pub fn new_incoming(metadata: FileMetadata, now: Instant) -> Self {
        let acc = ChunkAccumulator::new(metadata.total_chunks, metadata.total_size);
        Self::new(
            metadata,
            TransferDirection::Receiving,
            TransferStatus::Transferring,
            Some(acc),
            now,
        )
    }

    fn new(
        metadata: FileMetadata,
        direction: TransferDirection,
        status: TransferStatus,
        accumulator: Option<ChunkAccumulator>,
        now: Instant,
    ) -> Self {
        Self {
            metadata,
            direction,
            status,
            transferred_bytes: 0,
            progress: 0.0,
            started_at: now,
            paused_at: None,
            paused_total: Duration::ZERO,
            finished_at: None,
            error_message: None,
            accumulator,
            assembling: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.metadata.id
    }

    // ── State transitions ────────────────────────────────────────────────
    //
    // Each returns whether the transition was applied. Terminal states are
    // never left, except the receive-side Completed -> Error on a failed
    // assembly.

    /// Preparing -> Transferring.
    pub fn activate(&mut self) -> bool {
        if self.status == TransferStatus::Preparing {
            self.status = TransferStatus::Transferring;
            return true;
        }
        false
    }

    /// Transferring -> Paused.
    pub fn pause(&mut self, now: Instant) -> bool {
        if self.status == TransferStatus::Transferring {
            self.status = TransferStatus::Paused;
            self.paused_at = Some(now);
            return true;
        }
        false
    }

    /// Paused -> Transferring.
    pub fn resume(&mut self, now: Instant) -> bool {
        if self.status != TransferStatus::Paused {
            return false;
        }
        self.end_pause(now);
        self.status = TransferStatus::Transferring;
        true
    }

    /// Transferring | Paused -> Completed.
    pub fn complete(&mut self, now: Instant) -> bool {
        if !matches!(
            self.status,
            TransferStatus::Transferring | TransferStatus::Paused
        ) {
            return false;
        }
        self.end_pause(now);
        self.status = TransferStatus::Completed;
        self.progress = 100.0;
        self.finished_at = Some(now);
        true
    }

    /// Any non-terminal -> Cancelled. Partial data is discarded.
    pub fn cancel(&mut self, now: Instant) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.end_pause(now);
        self.status = TransferStatus::Cancelled;
        self.finished_at = Some(now);
        self.accumulator = None;
        true
    }

    /// Any non-terminal -> Error.
    pub fn fail(&mut self, message: impl Into<String>, now: Instant) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.end_pause(now);
        self.enter_error(message.into(), now);
        true
    }

    /// Completed -> Error, when the received chunks could not be assembled.
    pub fn fail_assembly(&mut self, message: impl Into<String>, now: Instant) -> bool {
        if self.status != TransferStatus::Completed || self.direction != TransferDirection::Receiving
        {
            return false;
        }
        self.assembling = false;
        self.enter_error(message.into(), now);
        true
    }

    fn enter_error(&mut self, message: String, now: Instant) {
        self.status = TransferStatus::Error;
        self.error_message = Some(message);
        self.finished_at = Some(now);
        self.accumulator = None;
    }

    fn end_pause(&mut self, now: Instant) {
        if let Some(since) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    // ── Progress ─────────────────────────────────────────────────────────

    /// Record new totals. Progress never moves backwards.
    pub fn update_progress(&mut self, transferred_bytes: u64, progress: f64) {
        self.transferred_bytes = self.transferred_bytes.max(transferred_bytes);
        self.progress = self.progress.max(progress.clamp(0.0, 100.0));
    }

    /// Time spent actively transferring.
    pub fn active_elapsed(&self, now: Instant) -> Duration {
        let end = self.finished_at.unwrap_or(now);
        let mut paused = self.paused_total;
        if let Some(since) = self.paused_at {
            paused += end.saturating_duration_since(since);
        }
        end.saturating_duration_since(self.started_at)
            .saturating_sub(paused)
    }

    /// Bytes per second over the active time; display only.
    pub fn speed(&self, now: Instant) -> f64 {
        let secs = self.active_elapsed(now).as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / secs
    }

    /// Remaining time at the current speed, `None` while speed is zero.
    pub fn eta(&self, now: Instant) -> Option<Duration> {
        if self.status.is_terminal() {
            return Some(Duration::ZERO);
        }
        let speed = self.speed(now);
        if speed <= 0.0 {
            return None;
        }
        let remaining = self.metadata.total_size.saturating_sub(self.transferred_bytes);
        // Unknown rather than unbounded when the quotient overflows.
        Duration::try_from_secs_f64(remaining as f64 / speed).ok()
    }

    pub fn snapshot(&self, now: Instant) -> TransferSnapshot {
        TransferSnapshot {
            id: self.metadata.id,
            name: self.metadata.name.clone(),
            mime_type: self.metadata.mime_type.clone(),
            total_size: self.metadata.total_size,
            direction: self.direction,
            status: self.status,
            progress: self.progress,
            transferred_bytes: self.transferred_bytes,
            speed: self.speed(now),
            eta: self.eta(now),
            error_message: self.error_message.clone(),
        }
    }
}

// ── Snapshot / events ────────────────────────────────────────────────────────

/// Point-in-time view of a transfer, handed out to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub progress: f64,
    pub transferred_bytes: u64,
    /// Bytes per second.
    pub speed: f64,
    pub eta: Option<Duration>,
    pub error_message: Option<String>,
}

/// Notifications emitted by the engine as transfers evolve.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started(TransferSnapshot),
    Progress {
        file_id: Uuid,
        progress: f64,
        transferred_bytes: u64,
    },
    StatusChanged {
        file_id: Uuid,
        status: TransferStatus,
    },
    /// Sent, or received, assembled and saved. `location` is the saved path
    /// for received files and the source path for sent ones, if any.
    Completed {
        file_id: Uuid,
        direction: TransferDirection,
        location: Option<PathBuf>,
    },
    Failed {
        file_id: Uuid,
        message: String,
    },
    /// Dropped from the active set after the grace delay.
    Removed {
        file_id: Uuid,
    },
    /// The peer channel closed. Not tied to a single transfer.
    Disconnected {
        reason: String,
    },
}

impl TransferEvent {
    /// Transfer this event refers to, if any.
    pub fn file_id(&self) -> Option<Uuid> {
        match self {
            Self::Started(snap) => Some(snap.id),
            Self::Progress { file_id, .. }
            | Self::StatusChanged { file_id, .. }
            | Self::Completed { file_id, .. }
            | Self::Failed { file_id, .. }
            | Self::Removed { file_id } => Some(*file_id),
            Self::Disconnected { .. } => None,
        }
    }
}
