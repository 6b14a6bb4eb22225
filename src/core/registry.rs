//! TransferRegistry: sole owner of transfer state.
//!
//! This is the single source of truth for:
//! - Transfer lifecycle (one record per `file_id`, either direction)
//! - Incoming chunk accumulation and completion detection
//! - Pause / resume / cancel from either peer
//! - Pre-metadata chunk buffering and retired-ID tracking
//!
//! The registry is a pure state machine: every entry point takes the current
//! `Instant` and returns declarative [`RegistryAction`]s that the engine
//! executes (send a control frame, spawn assembly, pause a chunker...).

use crate::core::config::{
    MAX_FRAME_SIZE, MAX_PENDING_CHUNKS_PER_FILE, MAX_PENDING_FILE_IDS, PENDING_CHUNK_TTL,
    RETIRED_ID_CAPACITY, TERMINAL_GRACE_DELAY,
};
use crate::core::pipeline::chunk::{Chunk, ChunkAccumulator, InsertOutcome};
use crate::core::protocol::{ControlAction, ControlMessage, FileMetadata, TransferMessage};
use crate::core::transfer::{
    TransferDirection, TransferEvent, TransferRecord, TransferSnapshot, TransferStatus,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

// ── Errors / actions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("transfer {0} is already active")]
    DuplicateTransfer(Uuid),
    #[error("transfer {0} has already finished")]
    RetiredTransfer(Uuid),
    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),
    #[error("invalid metadata for transfer {file_id}: {reason}")]
    InvalidMetadata { file_id: Uuid, reason: String },
}

/// Side effects the engine must carry out after a registry call.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryAction {
    /// Forward an event to subscribers.
    Notify(TransferEvent),
    /// All chunks are in: rebuild the file off the ingestion path.
    Assemble {
        metadata: FileMetadata,
        chunks: HashMap<u32, Bytes>,
    },
    /// Tell the peer about a local control decision.
    SendControl(ControlMessage),
    /// Suspend or release the chunker of an outgoing transfer.
    PauseChunker { file_id: Uuid, paused: bool },
    /// Stop the chunker of an outgoing transfer for good.
    StopChunker(Uuid),
}

// ── Internal bookkeeping ─────────────────────────────────────────────────────

/// Chunks that arrived before their metadata.
#[derive(Debug)]
struct PendingChunks {
    first_seen: Instant,
    chunks: Vec<Chunk>,
}

/// Bounded FIFO set of IDs whose records were reaped or rejected.
#[derive(Debug)]
struct RetiredIds {
    order: VecDeque<Uuid>,
    set: HashSet<Uuid>,
    capacity: usize,
}

impl RetiredIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: Uuid) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.set.contains(id)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TransferRegistry {
    transfers: HashMap<Uuid, TransferRecord>,
    pending: HashMap<Uuid, PendingChunks>,
    retired: RetiredIds,
    grace_delay: Duration,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new(TERMINAL_GRACE_DELAY)
    }
}

impl TransferRegistry {
    pub fn new(grace_delay: Duration) -> Self {
        Self {
            transfers: HashMap::new(),
            pending: HashMap::new(),
            retired: RetiredIds::new(RETIRED_ID_CAPACITY),
            grace_delay,
        }
    }

    pub fn get(&self, file_id: &Uuid) -> Option<&TransferRecord> {
        self.transfers.get(file_id)
    }

    /// Snapshots of every live record, oldest first.
    pub fn snapshot(&self, now: Instant) -> Vec<TransferSnapshot> {
        let mut records: Vec<&TransferRecord> = self.transfers.values().collect();
        records.sort_by_key(|r| r.started_at);
        records.into_iter().map(|r| r.snapshot(now)).collect()
    }

    fn check_new_id(&self, file_id: Uuid) -> Result<(), RegistryError> {
        if self.transfers.contains_key(&file_id) {
            return Err(RegistryError::DuplicateTransfer(file_id));
        }
        if self.retired.contains(&file_id) {
            return Err(RegistryError::RetiredTransfer(file_id));
        }
        Ok(())
    }

    // ── Sending side ─────────────────────────────────────────────────────

    /// Register an outgoing transfer in `Preparing`.
    pub fn begin_outgoing(
        &mut self,
        metadata: FileMetadata,
        now: Instant,
    ) -> Result<Vec<RegistryAction>, RegistryError> {
        let file_id = metadata.id;
        self.check_new_id(file_id)?;

        info!(
            event = "transfer_outgoing",
            %file_id,
            name = %metadata.name,
            total_size = metadata.total_size,
            total_chunks = metadata.total_chunks,
            "Outgoing transfer registered"
        );
        let record = TransferRecord::new_outgoing(metadata, now);
        let started = TransferEvent::Started(record.snapshot(now));
        self.transfers.insert(file_id, record);
        Ok(vec![RegistryAction::Notify(started)])
    }

    /// Chunking has begun: `Preparing -> Transferring`.
    pub fn start_outgoing(&mut self, file_id: Uuid) -> Vec<RegistryAction> {
        if let Some(record) = self.transfers.get_mut(&file_id)
            && record.activate()
        {
            return vec![status_changed(record)];
        }
        Vec::new()
    }

    /// Account for chunks handed to the transport.
    pub fn record_sent(
        &mut self,
        file_id: Uuid,
        transferred_bytes: u64,
        progress: f64,
    ) -> Vec<RegistryAction> {
        let Some(record) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        if record.direction != TransferDirection::Sending || record.status.is_terminal() {
            return Vec::new();
        }
        record.update_progress(transferred_bytes, progress);
        vec![progress_event(record)]
    }

    /// The chunker reported `Complete`.
    pub fn complete_outgoing(&mut self, file_id: Uuid, now: Instant) -> Vec<RegistryAction> {
        let Some(record) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        if record.direction != TransferDirection::Sending || !record.complete(now) {
            return Vec::new();
        }
        info!(
            event = "transfer_sent",
            %file_id,
            bytes = record.metadata.total_size,
            "All chunks sent"
        );
        vec![status_changed(record)]
    }

    // ── Receiving side ───────────────────────────────────────────────────

    /// Apply one inbound message.
    ///
    /// Only a metadata protocol violation is surfaced as an error; stray
    /// chunks and controls are logged and dropped.
    pub fn handle_message(
        &mut self,
        msg: TransferMessage,
        now: Instant,
    ) -> Result<Vec<RegistryAction>, RegistryError> {
        match msg {
            TransferMessage::Metadata(metadata) => self.handle_metadata(metadata, now),
            TransferMessage::Chunk(chunk) => Ok(self.handle_chunk(chunk, now)),
            TransferMessage::Control(ctrl) => Ok(self.handle_remote_control(ctrl, now)),
        }
    }

    fn handle_metadata(
        &mut self,
        metadata: FileMetadata,
        now: Instant,
    ) -> Result<Vec<RegistryAction>, RegistryError> {
        let file_id = metadata.id;
        self.check_new_id(file_id)?;
        if let Err(reason) = check_chunk_layout(&metadata) {
            // Later chunks for this ID are dropped instead of buffered.
            self.retired.insert(file_id);
            self.pending.remove(&file_id);
            return Err(RegistryError::InvalidMetadata { file_id, reason });
        }

        info!(
            event = "transfer_incoming",
            %file_id,
            name = %metadata.name,
            total_size = metadata.total_size,
            total_chunks = metadata.total_chunks,
            "Incoming transfer registered"
        );
        let record = TransferRecord::new_incoming(metadata, now);
        let mut actions = vec![RegistryAction::Notify(TransferEvent::Started(
            record.snapshot(now),
        ))];
        self.transfers.insert(file_id, record);

        if let Some(pending) = self.pending.remove(&file_id) {
            debug!(
                event = "pending_chunks_replay",
                %file_id,
                count = pending.chunks.len(),
                "Replaying chunks buffered before metadata"
            );
            for chunk in pending.chunks {
                actions.extend(self.apply_chunk(chunk, now));
            }
        }

        // A zero-chunk file is complete as soon as it is announced.
        actions.extend(self.check_receive_complete(file_id, now));
        Ok(actions)
    }

    fn handle_chunk(&mut self, chunk: Chunk, now: Instant) -> Vec<RegistryAction> {
        let file_id = chunk.file_id;
        if self.transfers.contains_key(&file_id) {
            return self.apply_chunk(chunk, now);
        }
        if self.retired.contains(&file_id) {
            debug!(
                event = "chunk_retired_transfer",
                %file_id,
                index = chunk.index,
                "Dropping chunk for finished transfer"
            );
            return Vec::new();
        }
        self.buffer_pre_metadata_chunk(chunk, now);
        Vec::new()
    }

    fn buffer_pre_metadata_chunk(&mut self, chunk: Chunk, now: Instant) {
        let file_id = chunk.file_id;

        if !self.pending.contains_key(&file_id) && self.pending.len() >= MAX_PENDING_FILE_IDS {
            warn!(
                event = "pending_chunk_dropped",
                %file_id,
                index = chunk.index,
                "Dropping pre-metadata chunk: too many pending file IDs"
            );
            return;
        }

        let entry = self.pending.entry(file_id).or_insert_with(|| PendingChunks {
            first_seen: now,
            chunks: Vec::new(),
        });
        if entry.chunks.len() >= MAX_PENDING_CHUNKS_PER_FILE {
            warn!(
                event = "pending_chunk_dropped",
                %file_id,
                index = chunk.index,
                "Dropping pre-metadata chunk: pending buffer full"
            );
            return;
        }

        debug!(
            event = "pending_chunk_buffered",
            %file_id,
            index = chunk.index,
            "Chunk buffered, metadata not yet received"
        );
        entry.chunks.push(chunk);
    }

    fn apply_chunk(&mut self, chunk: Chunk, now: Instant) -> Vec<RegistryAction> {
        let file_id = chunk.file_id;
        let Some(record) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        if record.status.is_terminal() {
            debug!(
                event = "chunk_terminal_transfer",
                %file_id,
                index = chunk.index,
                status = %record.status,
                "Dropping chunk for terminal transfer"
            );
            return Vec::new();
        }
        if record.direction != TransferDirection::Receiving {
            warn!(
                event = "chunk_for_outgoing",
                %file_id,
                index = chunk.index,
                "Peer sent a chunk for one of our outgoing transfers"
            );
            return Vec::new();
        }
        let Some(acc) = record.accumulator.as_mut() else {
            return Vec::new();
        };

        match acc.insert(chunk.index, chunk.data) {
            Ok(InsertOutcome::Inserted) => {
                let (bytes, progress) = (acc.received_bytes(), acc.progress());
                record.update_progress(bytes, progress);
                let mut actions = vec![progress_event(record)];
                actions.extend(self.check_receive_complete(file_id, now));
                actions
            }
            Ok(InsertOutcome::Duplicate) => {
                trace!(event = "chunk_duplicate", %file_id, index = chunk.index);
                Vec::new()
            }
            Err(e) => {
                warn!(event = "chunk_rejected", %file_id, error = %e, "Rejecting chunk");
                self.fail(file_id, e.to_string(), now, true)
            }
        }
    }

    /// `Transferring/Paused -> Completed` the moment the accumulator holds
    /// `total_chunks` distinct indices.
    fn check_receive_complete(&mut self, file_id: Uuid, now: Instant) -> Vec<RegistryAction> {
        let Some(record) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        let ready = record.direction == TransferDirection::Receiving
            && record
                .accumulator
                .as_ref()
                .is_some_and(ChunkAccumulator::is_complete);
        if !ready || !record.complete(now) {
            return Vec::new();
        }

        let chunks = record
            .accumulator
            .take()
            .map(ChunkAccumulator::into_chunks)
            .unwrap_or_default();
        record.assembling = true;
        info!(
            event = "transfer_received",
            %file_id,
            chunks = chunks.len(),
            bytes = record.metadata.total_size,
            "All chunks received"
        );
        vec![
            status_changed(record),
            RegistryAction::Assemble {
                metadata: record.metadata.clone(),
                chunks,
            },
        ]
    }

    // ── Control ──────────────────────────────────────────────────────────

    fn handle_remote_control(&mut self, ctrl: ControlMessage, now: Instant) -> Vec<RegistryAction> {
        match self.apply_control(ctrl.file_id, ctrl.action, now) {
            Some(actions) => {
                if !actions.is_empty() {
                    info!(
                        event = "remote_control",
                        file_id = %ctrl.file_id,
                        action = %ctrl.action,
                        "Peer changed transfer state"
                    );
                }
                actions
            }
            None => {
                debug!(
                    event = "control_unknown_transfer",
                    file_id = %ctrl.file_id,
                    action = %ctrl.action,
                    "Ignoring control for unknown transfer"
                );
                Vec::new()
            }
        }
    }

    /// Pause, resume or cancel a transfer on behalf of the local user. The
    /// peer is told only when the transition actually applied.
    pub fn local_control(
        &mut self,
        file_id: Uuid,
        action: ControlAction,
        now: Instant,
    ) -> Result<Vec<RegistryAction>, RegistryError> {
        let mut actions = self
            .apply_control(file_id, action, now)
            .ok_or(RegistryError::UnknownTransfer(file_id))?;
        if !actions.is_empty() {
            actions.push(RegistryAction::SendControl(ControlMessage::new(
                file_id, action,
            )));
        }
        Ok(actions)
    }

    /// `None` when the transfer is unknown, empty when the transition does
    /// not apply in the current state.
    fn apply_control(
        &mut self,
        file_id: Uuid,
        action: ControlAction,
        now: Instant,
    ) -> Option<Vec<RegistryAction>> {
        let record = self.transfers.get_mut(&file_id)?;
        let applied = match action {
            ControlAction::Pause => record.pause(now),
            ControlAction::Resume => record.resume(now),
            ControlAction::Cancel => record.cancel(now),
        };
        if !applied {
            return Some(Vec::new());
        }

        let mut actions = vec![status_changed(record)];
        if record.direction == TransferDirection::Sending {
            actions.push(match action {
                ControlAction::Pause => RegistryAction::PauseChunker {
                    file_id,
                    paused: true,
                },
                ControlAction::Resume => RegistryAction::PauseChunker {
                    file_id,
                    paused: false,
                },
                ControlAction::Cancel => RegistryAction::StopChunker(file_id),
            });
        }
        Some(actions)
    }

    // ── Failures ─────────────────────────────────────────────────────────

    /// Move a live transfer to `Error`. With `notify_peer`, the peer is sent
    /// a `Cancel` so it stops as well.
    pub fn fail(
        &mut self,
        file_id: Uuid,
        message: impl Into<String>,
        now: Instant,
        notify_peer: bool,
    ) -> Vec<RegistryAction> {
        let message = message.into();
        let Some(record) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        if !record.fail(message.clone(), now) {
            return Vec::new();
        }

        warn!(event = "transfer_failed", %file_id, error = %message, "Transfer failed");
        let mut actions = vec![
            status_changed(record),
            RegistryAction::Notify(TransferEvent::Failed { file_id, message }),
        ];
        if record.direction == TransferDirection::Sending {
            actions.push(RegistryAction::StopChunker(file_id));
        }
        if notify_peer {
            actions.push(RegistryAction::SendControl(ControlMessage::new(
                file_id,
                ControlAction::Cancel,
            )));
        }
        actions
    }

    /// The assembler rejected a completed transfer.
    pub fn assembly_failed(
        &mut self,
        file_id: Uuid,
        message: impl Into<String>,
        now: Instant,
    ) -> Vec<RegistryAction> {
        let message = message.into();
        let Some(record) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        if !record.fail_assembly(message.clone(), now) {
            return Vec::new();
        }
        warn!(event = "assembly_failed", %file_id, error = %message, "Assembly failed");
        vec![
            status_changed(record),
            RegistryAction::Notify(TransferEvent::Failed { file_id, message }),
        ]
    }

    /// The received file was assembled and saved; the record may now be
    /// reaped.
    pub fn assembly_finished(&mut self, file_id: Uuid) {
        if let Some(record) = self.transfers.get_mut(&file_id) {
            record.assembling = false;
        }
    }

    /// The transport closed: every live transfer fails.
    pub fn connection_lost(&mut self, now: Instant) -> Vec<RegistryAction> {
        let live: Vec<Uuid> = self
            .transfers
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(TransferRecord::id)
            .collect();
        self.pending.clear();

        live.into_iter()
            .flat_map(|file_id| self.fail(file_id, "connection lost", now, false))
            .collect()
    }

    // ── Housekeeping ─────────────────────────────────────────────────────

    /// Remove terminal records older than the grace delay and expire stale
    /// pre-metadata buffers. Records still being assembled are kept so a
    /// late assembly failure can be reported.
    pub fn reap(&mut self, now: Instant) -> Vec<RegistryAction> {
        let grace = self.grace_delay;
        let expired: Vec<Uuid> = self
            .transfers
            .values()
            .filter(|r| {
                !r.assembling
                    && r.finished_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= grace)
            })
            .map(TransferRecord::id)
            .collect();

        let mut actions = Vec::with_capacity(expired.len());
        for file_id in expired {
            self.transfers.remove(&file_id);
            self.retired.insert(file_id);
            debug!(event = "transfer_removed", %file_id, "Transfer removed from active set");
            actions.push(RegistryAction::Notify(TransferEvent::Removed { file_id }));
        }

        self.pending.retain(|file_id, pending| {
            let keep = now.saturating_duration_since(pending.first_seen) < PENDING_CHUNK_TTL;
            if !keep {
                warn!(
                    event = "pending_chunks_expired",
                    %file_id,
                    count = pending.chunks.len(),
                    "Metadata never arrived, dropping buffered chunks"
                );
            }
            keep
        });

        actions
    }
}

/// Declared sizes a sender could actually have produced: no chunks for an
/// empty file, at least one byte per chunk and no chunk above the frame
/// limit.
fn check_chunk_layout(metadata: &FileMetadata) -> Result<(), String> {
    let chunks = u64::from(metadata.total_chunks);
    let size = metadata.total_size;
    if (chunks == 0) != (size == 0) {
        return Err(format!("{chunks} chunks for {size} bytes"));
    }
    if chunks > size {
        return Err(format!("{chunks} chunks cannot hold only {size} bytes"));
    }
    if size > chunks.saturating_mul(MAX_FRAME_SIZE as u64) {
        return Err(format!("{size} bytes do not fit in {chunks} chunks"));
    }
    Ok(())
}

fn status_changed(record: &TransferRecord) -> RegistryAction {
    RegistryAction::Notify(TransferEvent::StatusChanged {
        file_id: record.id(),
        status: record.status,
    })
}

fn progress_event(record: &TransferRecord) -> RegistryAction {
    RegistryAction::Notify(TransferEvent::Progress {
        file_id: record.id(),
        progress: record.progress,
        transferred_bytes: record.transferred_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::assembler::assemble;
    use crate::core::pipeline::chunk::chunk_len;

    const C: usize = 16_384;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    fn split(name: &str, data: &[u8]) -> (FileMetadata, Vec<Chunk>) {
        let meta = FileMetadata::new(
            name.into(),
            "application/octet-stream".into(),
            data.len() as u64,
            C,
        )
        .unwrap();
        let chunks = (0..meta.total_chunks)
            .map(|index| {
                let start = index as usize * C;
                let len = chunk_len(index, data.len() as u64, C);
                Chunk {
                    file_id: meta.id,
                    index,
                    data: Bytes::copy_from_slice(&data[start..start + len]),
                }
            })
            .collect();
        (meta, chunks)
    }

    fn feed(reg: &mut TransferRegistry, chunk: &Chunk, now: Instant) -> Vec<RegistryAction> {
        reg.handle_message(TransferMessage::Chunk(chunk.clone()), now)
            .unwrap()
    }

    fn open(reg: &mut TransferRegistry, meta: &FileMetadata, now: Instant) -> Vec<RegistryAction> {
        reg.handle_message(TransferMessage::Metadata(meta.clone()), now)
            .unwrap()
    }

    fn take_assembly(actions: &[RegistryAction]) -> Option<(FileMetadata, HashMap<u32, Bytes>)> {
        actions.iter().find_map(|a| match a {
            RegistryAction::Assemble { metadata, chunks } => {
                Some((metadata.clone(), chunks.clone()))
            }
            _ => None,
        })
    }

    fn progress_values(actions: &[RegistryAction]) -> Vec<f64> {
        actions
            .iter()
            .filter_map(|a| match a {
                RegistryAction::Notify(TransferEvent::Progress { progress, .. }) => Some(*progress),
                _ => None,
            })
            .collect()
    }

    /// Deliver chunks in `order` and return the assembled bytes.
    fn receive_in_order(data: &[u8], order: &[u32]) -> Vec<u8> {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let (meta, chunks) = split("f.bin", data);
        open(&mut reg, &meta, now);

        let mut assembly = None;
        for (n, &index) in order.iter().enumerate() {
            let actions = feed(&mut reg, &chunks[index as usize], now);
            if n + 1 < order.len() {
                assert!(take_assembly(&actions).is_none());
            } else {
                assembly = take_assembly(&actions);
            }
        }
        let (meta, chunks) = assembly.expect("assembly after last distinct chunk");
        assemble(&meta, chunks).unwrap().data.to_vec()
    }

    #[test]
    fn round_trip_at_size_boundaries() {
        for n in [0, 1, C - 1, C, C + 1, 10 * C + 7] {
            let data = pattern(n, 3);
            let now = Instant::now();
            let mut reg = TransferRegistry::default();
            let (meta, chunks) = split("f.bin", &data);

            let mut actions = open(&mut reg, &meta, now);
            for chunk in &chunks {
                actions.extend(feed(&mut reg, chunk, now));
            }
            let (meta, chunks) = take_assembly(&actions).expect("assembled");
            assert_eq!(assemble(&meta, chunks).unwrap().data.as_ref(), data.as_slice(), "size {n}");
        }
    }

    #[test]
    fn order_independence() {
        let data = pattern(5 * C + 11, 9);
        let forward = receive_in_order(&data, &[0, 1, 2, 3, 4, 5]);
        let shuffled = receive_in_order(&data, &[4, 0, 5, 2, 1, 3]);
        let reversed = receive_in_order(&data, &[5, 4, 3, 2, 1, 0]);
        assert_eq!(forward, data);
        assert_eq!(shuffled, data);
        assert_eq!(reversed, data);
    }

    #[test]
    fn random_delivery_orders() {
        use rand::seq::SliceRandom;

        let data = pattern(12 * C + 5, 4);
        let mut order: Vec<u32> = (0..13).collect();
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            order.shuffle(&mut rng);
            assert_eq!(receive_in_order(&data, &order), data, "order {order:?}");
        }
    }

    #[test]
    fn idempotent_insertion_and_completion_cardinality() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let data = pattern(3 * C, 1);
        let (meta, chunks) = split("dup.bin", &data);
        open(&mut reg, &meta, now);

        assert_eq!(progress_values(&feed(&mut reg, &chunks[1], now)).len(), 1);
        assert!(feed(&mut reg, &chunks[1], now).is_empty());
        assert!(feed(&mut reg, &chunks[1], now).is_empty());
        assert!(take_assembly(&feed(&mut reg, &chunks[0], now)).is_none());

        let record = reg.get(&meta.id).unwrap();
        assert_eq!(record.transferred_bytes, 2 * C as u64);
        assert_eq!(record.status, TransferStatus::Transferring);

        let actions = feed(&mut reg, &chunks[2], now);
        assert!(take_assembly(&actions).is_some());
        assert_eq!(reg.get(&meta.id).unwrap().status, TransferStatus::Completed);

        // Exactly once: a late duplicate does not re-trigger assembly.
        assert!(feed(&mut reg, &chunks[2], now).is_empty());
    }

    #[test]
    fn pause_does_not_drop_data() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let data = pattern(4 * C, 5);
        let (meta, chunks) = split("p.bin", &data);
        open(&mut reg, &meta, now);
        feed(&mut reg, &chunks[0], now);

        let ctrl = ControlMessage::new(meta.id, ControlAction::Pause);
        reg.handle_message(TransferMessage::Control(ctrl), now).unwrap();
        assert_eq!(reg.get(&meta.id).unwrap().status, TransferStatus::Paused);
        assert!(reg.get(&meta.id).unwrap().paused_at.is_some());

        feed(&mut reg, &chunks[1], now);
        feed(&mut reg, &chunks[2], now);
        assert_eq!(reg.get(&meta.id).unwrap().transferred_bytes, 3 * C as u64);

        let ctrl = ControlMessage::new(meta.id, ControlAction::Resume);
        reg.handle_message(TransferMessage::Control(ctrl), now).unwrap();
        assert_eq!(reg.get(&meta.id).unwrap().status, TransferStatus::Transferring);

        let (meta, chunks) = take_assembly(&feed(&mut reg, &chunks[3], now)).unwrap();
        assert_eq!(assemble(&meta, chunks).unwrap().data.as_ref(), data.as_slice());
    }

    #[test]
    fn progress_is_monotone_and_ends_at_100() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let data = pattern(7 * C + 1, 2);
        let (meta, chunks) = split("m.bin", &data);
        open(&mut reg, &meta, now);

        let mut seen = Vec::new();
        for &i in &[3usize, 0, 3, 7, 1, 0, 2, 6, 4, 5] {
            seen.extend(progress_values(&feed(&mut reg, &chunks[i], now)));
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(seen.last().copied(), Some(100.0));
        assert_eq!(reg.get(&meta.id).unwrap().progress, 100.0);
    }

    #[test]
    fn scenario_empty_file_completes_on_metadata() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let meta = FileMetadata::new("empty.txt".into(), "text/plain".into(), 0, C).unwrap();
        assert_eq!(meta.total_chunks, 0);

        let actions = open(&mut reg, &meta, now);
        let (meta, chunks) = take_assembly(&actions).expect("zero-chunk file assembles at once");
        let file = assemble(&meta, chunks).unwrap();
        assert!(file.data.is_empty());
        assert_eq!(file.name, "empty.txt");
        assert_eq!(reg.get(&meta.id).unwrap().status, TransferStatus::Completed);
        assert!(reg.get(&meta.id).unwrap().error_message.is_none());
    }

    #[test]
    fn scenario_fifty_thousand_bytes() {
        let data = pattern(50_000, 0);
        let (meta, chunks) = split("b.bin", &data);
        assert_eq!(meta.total_chunks, 4);
        let lens: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(lens, vec![16_384, 16_384, 16_384, 848]);

        assert_eq!(receive_in_order(&data, &[0, 1, 2, 3]), data);
        assert_eq!(receive_in_order(&data, &[2, 0, 3, 1]), data);
    }

    #[test]
    fn scenario_cancel_midway() {
        let t0 = Instant::now();
        let mut reg = TransferRegistry::new(Duration::from_secs(3));
        let data = pattern(50_000, 4);
        let (meta, chunks) = split("c.bin", &data);
        open(&mut reg, &meta, t0);
        feed(&mut reg, &chunks[0], t0);
        feed(&mut reg, &chunks[1], t0);

        let ctrl = ControlMessage::new(meta.id, ControlAction::Cancel);
        let actions = reg.handle_message(TransferMessage::Control(ctrl), t0).unwrap();
        assert!(actions.contains(&RegistryAction::Notify(TransferEvent::StatusChanged {
            file_id: meta.id,
            status: TransferStatus::Cancelled,
        })));
        // A remote cancel is never echoed back.
        assert!(!actions.iter().any(|a| matches!(a, RegistryAction::SendControl(_))));

        assert!(feed(&mut reg, &chunks[2], t0).is_empty());
        assert!(feed(&mut reg, &chunks[3], t0).is_empty());
        assert_eq!(reg.get(&meta.id).unwrap().status, TransferStatus::Cancelled);

        assert!(reg.reap(t0 + Duration::from_secs(2)).is_empty());
        let removed = reg.reap(t0 + Duration::from_secs(3));
        assert_eq!(
            removed,
            vec![RegistryAction::Notify(TransferEvent::Removed { file_id: meta.id })]
        );
        assert!(reg.get(&meta.id).is_none());
        assert!(reg.retired.contains(&meta.id));

        // Late traffic for the retired ID is dropped, not buffered.
        assert!(feed(&mut reg, &chunks[3], t0).is_empty());
        assert_eq!(reg.pending.len(), 0);
        assert_eq!(
            reg.handle_message(TransferMessage::Metadata(meta.clone()), t0),
            Err(RegistryError::RetiredTransfer(meta.id))
        );
    }

    #[test]
    fn scenario_interleaved_transfers() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let a = pattern(3 * C + 100, 10);
        let b = pattern(2 * C + 5, 20);
        let (meta_a, chunks_a) = split("a.bin", &a);
        let (meta_b, chunks_b) = split("b.bin", &b);

        open(&mut reg, &meta_a, now);
        open(&mut reg, &meta_b, now);

        let mut actions = Vec::new();
        actions.extend(feed(&mut reg, &chunks_b[2], now));
        actions.extend(feed(&mut reg, &chunks_a[0], now));
        actions.extend(feed(&mut reg, &chunks_a[3], now));
        actions.extend(feed(&mut reg, &chunks_b[0], now));
        actions.extend(feed(&mut reg, &chunks_a[1], now));
        actions.extend(feed(&mut reg, &chunks_b[1], now));
        actions.extend(feed(&mut reg, &chunks_a[2], now));

        let mut assembled: HashMap<Uuid, Vec<u8>> = HashMap::new();
        for action in actions {
            if let RegistryAction::Assemble { metadata, chunks } = action {
                let file = assemble(&metadata, chunks).unwrap();
                assembled.insert(metadata.id, file.data.to_vec());
            }
        }
        assert_eq!(assembled.len(), 2);
        assert_eq!(assembled[&meta_a.id], a);
        assert_eq!(assembled[&meta_b.id], b);
    }

    #[test]
    fn duplicate_metadata_is_rejected_not_merged() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let data = pattern(2 * C, 0);
        let (meta, chunks) = split("x.bin", &data);
        open(&mut reg, &meta, now);
        feed(&mut reg, &chunks[0], now);

        let mut other = meta.clone();
        other.total_size = 1;
        other.total_chunks = 1;
        assert_eq!(
            reg.handle_message(TransferMessage::Metadata(other), now),
            Err(RegistryError::DuplicateTransfer(meta.id))
        );
        let record = reg.get(&meta.id).unwrap();
        assert_eq!(record.metadata, meta);
        assert_eq!(record.transferred_bytes, C as u64);
    }

    #[test]
    fn conflicting_duplicate_fails_transfer() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let (meta, chunks) = split("conf.bin", &pattern(2 * C, 0));
        open(&mut reg, &meta, now);
        feed(&mut reg, &chunks[0], now);

        let mut forged = chunks[0].clone();
        forged.data = Bytes::from(vec![0xAA; C]);
        let actions = feed(&mut reg, &forged, now);

        assert_eq!(reg.get(&meta.id).unwrap().status, TransferStatus::Error);
        assert!(actions.iter().any(|a| matches!(
            a,
            RegistryAction::Notify(TransferEvent::Failed { .. })
        )));
        assert!(actions.contains(&RegistryAction::SendControl(ControlMessage::new(
            meta.id,
            ControlAction::Cancel
        ))));
    }

    #[test]
    fn pre_metadata_chunks_are_replayed() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let data = pattern(2 * C + 3, 8);
        let (meta, chunks) = split("early.bin", &data);

        for chunk in &chunks {
            assert!(feed(&mut reg, chunk, now).is_empty());
        }
        assert_eq!(reg.pending.len(), 1);

        let actions = open(&mut reg, &meta, now);
        assert_eq!(reg.pending.len(), 0);
        let (meta, chunks) = take_assembly(&actions).expect("replayed chunks complete the file");
        assert_eq!(assemble(&meta, chunks).unwrap().data.as_ref(), data.as_slice());
    }

    #[test]
    fn pre_metadata_buffer_is_bounded_and_expires() {
        let t0 = Instant::now();
        let mut reg = TransferRegistry::default();

        let mut ids = Vec::new();
        for _ in 0..MAX_PENDING_FILE_IDS + 2 {
            let id = Uuid::new_v4();
            ids.push(id);
            feed(
                &mut reg,
                &Chunk {
                    file_id: id,
                    index: 0,
                    data: Bytes::from_static(b"x"),
                },
                t0,
            );
        }
        assert_eq!(reg.pending.len(), MAX_PENDING_FILE_IDS);

        for index in 0..MAX_PENDING_CHUNKS_PER_FILE as u32 + 10 {
            feed(
                &mut reg,
                &Chunk {
                    file_id: ids[0],
                    index,
                    data: Bytes::from_static(b"y"),
                },
                t0,
            );
        }
        assert_eq!(
            reg.pending.get(&ids[0]).map(|p| p.chunks.len()),
            Some(MAX_PENDING_CHUNKS_PER_FILE)
        );

        reg.reap(t0 + PENDING_CHUNK_TTL - Duration::from_millis(1));
        assert_eq!(reg.pending.len(), MAX_PENDING_FILE_IDS);
        reg.reap(t0 + PENDING_CHUNK_TTL);
        assert_eq!(reg.pending.len(), 0);
    }

    #[test]
    fn control_for_unknown_transfer_is_noop() {
        let mut reg = TransferRegistry::default();
        let ctrl = ControlMessage::new(Uuid::new_v4(), ControlAction::Cancel);
        assert_eq!(
            reg.handle_message(TransferMessage::Control(ctrl), Instant::now()),
            Ok(Vec::new())
        );
        assert_eq!(
            reg.local_control(ctrl.file_id, ControlAction::Pause, Instant::now()),
            Err(RegistryError::UnknownTransfer(ctrl.file_id))
        );
    }

    #[test]
    fn outgoing_lifecycle_drives_chunker() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let meta = FileMetadata::new("out.bin".into(), "application/octet-stream".into(), 3 * C as u64, C).unwrap();
        let id = meta.id;

        let started = reg.begin_outgoing(meta.clone(), now).unwrap();
        assert!(matches!(&started[..], [RegistryAction::Notify(TransferEvent::Started(s))] if s.status == TransferStatus::Preparing));
        assert_eq!(
            reg.begin_outgoing(meta, now),
            Err(RegistryError::DuplicateTransfer(id))
        );
        reg.start_outgoing(id);
        assert_eq!(reg.get(&id).unwrap().status, TransferStatus::Transferring);

        let actions = reg.local_control(id, ControlAction::Pause, now).unwrap();
        assert!(actions.contains(&RegistryAction::PauseChunker { file_id: id, paused: true }));
        assert!(actions.contains(&RegistryAction::SendControl(ControlMessage::new(id, ControlAction::Pause))));
        // Already paused: nothing to do, nothing sent.
        assert!(reg.local_control(id, ControlAction::Pause, now).unwrap().is_empty());

        let ctrl = ControlMessage::new(id, ControlAction::Resume);
        let actions = reg.handle_message(TransferMessage::Control(ctrl), now).unwrap();
        assert!(actions.contains(&RegistryAction::PauseChunker { file_id: id, paused: false }));

        reg.record_sent(id, C as u64, 33.3);
        reg.record_sent(id, 3 * C as u64, 100.0);
        assert_eq!(reg.complete_outgoing(id, now).len(), 1);
        assert!(reg.complete_outgoing(id, now).is_empty());
        assert_eq!(reg.get(&id).unwrap().status, TransferStatus::Completed);
    }

    #[test]
    fn remote_cancel_stops_outgoing_chunker() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let meta = FileMetadata::new("o.bin".into(), "text/plain".into(), 10, C).unwrap();
        let id = meta.id;
        reg.begin_outgoing(meta, now).unwrap();
        reg.start_outgoing(id);

        let ctrl = ControlMessage::new(id, ControlAction::Cancel);
        let actions = reg.handle_message(TransferMessage::Control(ctrl), now).unwrap();
        assert!(actions.contains(&RegistryAction::StopChunker(id)));
        assert!(reg.complete_outgoing(id, now).is_empty());
        assert_eq!(reg.get(&id).unwrap().status, TransferStatus::Cancelled);
    }

    #[test]
    fn connection_lost_fails_live_transfers_only() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let (live, _) = split("live.bin", &pattern(2 * C, 0));
        let (done, done_chunks) = split("done.bin", &pattern(10, 0));
        open(&mut reg, &live, now);
        open(&mut reg, &done, now);
        feed(&mut reg, &done_chunks[0], now);

        let actions = reg.connection_lost(now);
        assert!(actions.contains(&RegistryAction::Notify(TransferEvent::Failed {
            file_id: live.id,
            message: "connection lost".into(),
        })));
        assert!(!actions.iter().any(|a| matches!(a, RegistryAction::SendControl(_))));
        assert_eq!(reg.get(&live.id).unwrap().status, TransferStatus::Error);
        assert_eq!(reg.get(&done.id).unwrap().status, TransferStatus::Completed);
        assert!(reg.transfers.values().all(|r| r.status.is_terminal()));
    }

    #[test]
    fn assembly_failure_moves_completed_to_error() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let (meta, chunks) = split("asm.bin", &pattern(10, 0));
        open(&mut reg, &meta, now);
        feed(&mut reg, &chunks[0], now);

        let actions = reg.assembly_failed(meta.id, "boom", now);
        assert_eq!(actions.len(), 2);
        let record = reg.get(&meta.id).unwrap();
        assert_eq!(record.status, TransferStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn reap_waits_for_outstanding_assembly() {
        let t0 = Instant::now();
        let mut reg = TransferRegistry::new(Duration::from_secs(3));
        let (meta, chunks) = split("late.bin", &pattern(2 * C, 5));
        open(&mut reg, &meta, t0);
        feed(&mut reg, &chunks[0], t0);
        assert!(take_assembly(&feed(&mut reg, &chunks[1], t0)).is_some());

        // Completed but still assembling: not reaped past the grace delay.
        assert!(reg.reap(t0 + Duration::from_secs(10)).is_empty());
        assert!(reg.get(&meta.id).is_some());

        let late = t0 + Duration::from_secs(11);
        let actions = reg.assembly_failed(meta.id, "disk full", late);
        assert!(actions.contains(&RegistryAction::Notify(TransferEvent::Failed {
            file_id: meta.id,
            message: "disk full".into(),
        })));
        assert!(reg.reap(late + Duration::from_secs(2)).is_empty());
        assert_eq!(
            reg.reap(late + Duration::from_secs(3)),
            vec![RegistryAction::Notify(TransferEvent::Removed { file_id: meta.id })]
        );
    }

    #[test]
    fn saved_transfer_is_reaped_after_grace() {
        let t0 = Instant::now();
        let mut reg = TransferRegistry::new(Duration::from_secs(3));
        let (meta, chunks) = split("ok.bin", &pattern(10, 5));
        open(&mut reg, &meta, t0);
        feed(&mut reg, &chunks[0], t0);

        assert!(reg.reap(t0 + Duration::from_secs(5)).is_empty());
        reg.assembly_finished(meta.id);
        assert_eq!(
            reg.reap(t0 + Duration::from_secs(5)),
            vec![RegistryAction::Notify(TransferEvent::Removed { file_id: meta.id })]
        );
    }

    #[test]
    fn inconsistent_metadata_is_rejected_and_retired() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let cases = [
            (u64::MAX, 1),
            (0, 1),
            (10, 0),
            (3, 4),
            (5 * MAX_FRAME_SIZE as u64, 4),
        ];
        for (total_size, total_chunks) in cases {
            let meta = FileMetadata {
                id: Uuid::new_v4(),
                name: "bogus.bin".into(),
                mime_type: "application/octet-stream".into(),
                total_size,
                total_chunks,
            };
            let err = reg
                .handle_message(TransferMessage::Metadata(meta.clone()), now)
                .unwrap_err();
            assert!(
                matches!(err, RegistryError::InvalidMetadata { file_id, .. } if file_id == meta.id),
                "{total_size} bytes in {total_chunks} chunks"
            );
            assert!(reg.get(&meta.id).is_none());
            assert!(reg.retired.contains(&meta.id));

            let chunk = Chunk {
                file_id: meta.id,
                index: 0,
                data: Bytes::from_static(b"x"),
            };
            assert!(feed(&mut reg, &chunk, now).is_empty());
            assert!(reg.pending.is_empty());
        }
        assert!(reg.snapshot(now).is_empty());
    }

    #[test]
    fn snapshot_lists_live_records() {
        let now = Instant::now();
        let mut reg = TransferRegistry::default();
        let (meta, _) = split("s.bin", &pattern(C, 0));
        open(&mut reg, &meta, now);
        let snaps = reg.snapshot(now);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].id, meta.id);
        assert_eq!(snaps[0].direction, TransferDirection::Receiving);
        assert_eq!(snaps[0].status, TransferStatus::Transferring);
    }
}
