//! TransferEngine: the task that owns all transfer state.
//!
//! The engine is the registry's single owner. It:
//! - Applies inbound transport messages to the registry, one at a time
//! - Spawns a chunker and a send pump per outgoing file
//! - Spawns assembly (and saving) for every completed incoming file
//! - Appends finished transfers to the history store
//! - Sweeps terminal records after the grace delay
//!
//! **Architecture rule**: the engine loop never awaits the transport. Bulk
//! sends happen in per-file pump tasks and control frames in short-lived
//! tasks, so a slow peer can never stall message ingestion.
//!
//! Callers talk to the engine through an [`EngineHandle`] (commands with
//! oneshot replies) and observe it through a stream of [`TransferEvent`]s.

use crate::core::config::{CHUNK_SIZE, REAP_INTERVAL, TERMINAL_GRACE_DELAY};
use crate::core::persistence::{HistoryStore, TransferHistoryRecord};
use crate::core::pipeline::assembler::spawn_assembly;
use crate::core::pipeline::chunker::{spawn_chunker, ByteSource, ChunkerControl, ChunkerEvent};
use crate::core::protocol::{ControlAction, FileMetadata, TransferMessage};
use crate::core::registry::{RegistryAction, TransferRegistry};
use crate::core::transfer::{TransferDirection, TransferEvent, TransferSnapshot};
use crate::core::transport::{Transport, TransportEvent};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size for outgoing files. Receivers never depend on it.
    pub chunk_size: usize,
    /// Time a terminal transfer stays visible before removal.
    pub grace_delay: Duration,
    pub reap_interval: Duration,
    /// Where received files are saved.
    pub downloads_dir: PathBuf,
}

impl EngineConfig {
    pub fn new(downloads_dir: PathBuf) -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            grace_delay: TERMINAL_GRACE_DELAY,
            reap_interval: REAP_INTERVAL,
            downloads_dir,
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

enum EngineCommand {
    Send {
        source: ByteSource,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    Control {
        file_id: Uuid,
        action: ControlAction,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> EngineCommand) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("transfer engine is not running"))?;
        rx.await.map_err(|_| anyhow!("transfer engine is not running"))
    }

    /// Start sending a file from disk. Returns the new transfer ID.
    pub async fn send_file(&self, path: &Path) -> Result<Uuid> {
        let source = ByteSource::open(path).await?;
        self.send_source(source).await
    }

    /// Start sending an in-memory buffer.
    pub async fn send_bytes(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Result<Uuid> {
        self.send_source(ByteSource::from_bytes(name, mime_type, data))
            .await
    }

    pub async fn send_source(&self, source: ByteSource) -> Result<Uuid> {
        self.request(|reply| EngineCommand::Send { source, reply })
            .await?
    }

    pub async fn pause(&self, file_id: Uuid) -> Result<()> {
        self.control(file_id, ControlAction::Pause).await
    }

    pub async fn resume(&self, file_id: Uuid) -> Result<()> {
        self.control(file_id, ControlAction::Resume).await
    }

    pub async fn cancel(&self, file_id: Uuid) -> Result<()> {
        self.control(file_id, ControlAction::Cancel).await
    }

    async fn control(&self, file_id: Uuid, action: ControlAction) -> Result<()> {
        self.request(|reply| EngineCommand::Control {
            file_id,
            action,
            reply,
        })
        .await?
    }

    /// Current view of every live transfer.
    pub async fn snapshot(&self) -> Result<Vec<TransferSnapshot>> {
        self.request(|reply| EngineCommand::Snapshot { reply }).await
    }

    /// Stop the engine and every chunker it owns.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }
}

/// Spawn an engine over `transport`, consuming its inbound `events`.
///
/// Returns the command handle, the transfer event stream and the task
/// handle. The engine stops on [`EngineHandle::shutdown`] or once every
/// handle has been dropped.
pub fn start_engine<T: Transport>(
    transport: T,
    inbound: mpsc::Receiver<TransportEvent>,
    history: Arc<dyn HistoryStore>,
    config: EngineConfig,
) -> (
    EngineHandle,
    mpsc::UnboundedReceiver<TransferEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();

    let engine = Engine {
        registry: TransferRegistry::new(config.grace_delay),
        transport: Arc::new(transport),
        history,
        config,
        outgoing: HashMap::new(),
        events: event_tx,
        workers: worker_tx,
    };
    let join = tokio::spawn(engine.run(cmd_rx, inbound, worker_rx));
    (EngineHandle { tx: cmd_tx }, event_rx, join)
}

// ── Engine task ──────────────────────────────────────────────────────────────

/// Reports from pump and assembly tasks back to the engine loop.
enum WorkerEvent {
    Sent {
        file_id: Uuid,
        transferred_bytes: u64,
        percent: f64,
    },
    SendComplete {
        file_id: Uuid,
        sha3_256: String,
    },
    SendFailed {
        file_id: Uuid,
        message: String,
        notify_peer: bool,
    },
    Saved {
        metadata: FileMetadata,
        path: PathBuf,
        sha3_256: String,
    },
    AssemblyFailed {
        file_id: Uuid,
        message: String,
    },
}

/// Controls of one running chunker.
struct Outgoing {
    stop: SignalOfStop,
    pause_tx: watch::Sender<bool>,
    location: Option<PathBuf>,
}

struct Engine<T: Transport> {
    registry: TransferRegistry,
    transport: Arc<T>,
    history: Arc<dyn HistoryStore>,
    config: EngineConfig,
    outgoing: HashMap<Uuid, Outgoing>,
    events: mpsc::UnboundedSender<TransferEvent>,
    workers: mpsc::UnboundedSender<WorkerEvent>,
}

impl<T: Transport> Engine<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut inbound: mpsc::Receiver<TransportEvent>,
        mut workers: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let mut reap = tokio::time::interval(self.config.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connected = true;
        let mut shutdown_reply = None;

        info!(event = "engine_started", downloads = %self.config.downloads_dir.display());

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(EngineCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                ev = inbound.recv(), if connected => match ev {
                    Some(TransportEvent::Message(msg)) => self.handle_inbound(msg),
                    Some(TransportEvent::Closed { reason }) => {
                        connected = false;
                        self.handle_disconnect(&reason);
                    }
                    None => {
                        connected = false;
                        self.handle_disconnect("transport dropped");
                    }
                },
                Some(ev) = workers.recv() => self.handle_worker(ev),
                _ = reap.tick() => {
                    let actions = self.registry.reap(Instant::now());
                    self.execute(actions);
                }
            }
        }

        for out in self.outgoing.values() {
            out.stop.cancel();
        }
        info!(event = "engine_stopped", "Transfer engine stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn emit(&self, event: TransferEvent) {
        trace!(event = "transfer_event", file_id = ?event.file_id(), detail = ?event);
        // No subscriber is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Send { source, reply } => {
                let _ = reply.send(self.start_send(source));
            }
            EngineCommand::Control {
                file_id,
                action,
                reply,
            } => {
                let result = self
                    .registry
                    .local_control(file_id, action, Instant::now())
                    .map(|actions| self.execute(actions))
                    .map_err(anyhow::Error::from);
                let _ = reply.send(result);
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot(Instant::now()));
            }
            // Handled by the loop.
            EngineCommand::Shutdown { .. } => {}
        }
    }

    fn start_send(&mut self, source: ByteSource) -> Result<Uuid> {
        let metadata = FileMetadata::new(
            source.name().to_string(),
            source.mime_type().to_string(),
            source.size(),
            self.config.chunk_size,
        )?;
        let file_id = metadata.id;
        let actions = self.registry.begin_outgoing(metadata.clone(), Instant::now())?;
        self.execute(actions);

        let (control, pause_tx) = ChunkerControl::new();
        let stop = control.stop.clone();
        let location = source.location().map(Path::to_path_buf);
        let (chunks, _) = spawn_chunker(file_id, source, self.config.chunk_size, control);
        tokio::spawn(pump(
            self.transport.clone(),
            metadata,
            chunks,
            stop.clone(),
            self.workers.clone(),
        ));
        self.outgoing.insert(
            file_id,
            Outgoing {
                stop,
                pause_tx,
                location,
            },
        );

        let actions = self.registry.start_outgoing(file_id);
        self.execute(actions);
        Ok(file_id)
    }

    fn handle_inbound(&mut self, msg: TransferMessage) {
        trace!(event = "inbound_message", kind = msg.kind(), file_id = %msg.file_id());
        match self.registry.handle_message(msg, Instant::now()) {
            Ok(actions) => self.execute(actions),
            Err(e) => warn!(event = "protocol_violation", error = %e, "Rejected message from peer"),
        }
    }

    fn handle_disconnect(&mut self, reason: &str) {
        warn!(event = "connection_lost", %reason, "Peer channel closed");
        let actions = self.registry.connection_lost(Instant::now());
        self.execute(actions);
        self.emit(TransferEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    fn handle_worker(&mut self, ev: WorkerEvent) {
        let now = Instant::now();
        match ev {
            WorkerEvent::Sent {
                file_id,
                transferred_bytes,
                percent,
            } => {
                let actions = self.registry.record_sent(file_id, transferred_bytes, percent);
                self.execute(actions);
            }
            WorkerEvent::SendComplete { file_id, sha3_256 } => {
                let actions = self.registry.complete_outgoing(file_id, now);
                let completed = !actions.is_empty();
                self.execute(actions);
                let location = self.outgoing.remove(&file_id).and_then(|o| o.location);
                if !completed {
                    return;
                }
                if let Some(metadata) = self.registry.get(&file_id).map(|r| r.metadata.clone()) {
                    self.record_history(TransferHistoryRecord::new(
                        &metadata,
                        TransferDirection::Sending,
                        location.clone(),
                        Some(sha3_256),
                    ));
                }
                self.emit(TransferEvent::Completed {
                    file_id,
                    direction: TransferDirection::Sending,
                    location,
                });
            }
            WorkerEvent::SendFailed {
                file_id,
                message,
                notify_peer,
            } => {
                let actions = self.registry.fail(file_id, message, now, notify_peer);
                self.execute(actions);
                if let Some(out) = self.outgoing.remove(&file_id) {
                    out.stop.cancel();
                }
            }
            WorkerEvent::Saved {
                metadata,
                path,
                sha3_256,
            } => {
                self.registry.assembly_finished(metadata.id);
                self.record_history(TransferHistoryRecord::new(
                    &metadata,
                    TransferDirection::Receiving,
                    Some(path.clone()),
                    Some(sha3_256),
                ));
                self.emit(TransferEvent::Completed {
                    file_id: metadata.id,
                    direction: TransferDirection::Receiving,
                    location: Some(path),
                });
            }
            WorkerEvent::AssemblyFailed { file_id, message } => {
                let actions = self.registry.assembly_failed(file_id, message, now);
                self.execute(actions);
            }
        }
    }

    fn record_history(&self, record: TransferHistoryRecord) {
        let id = record.id;
        if let Err(e) = self.history.append(record) {
            error!(event = "history_write_failure", %id, error = %e, "Failed to record transfer history");
        }
    }

    fn execute(&mut self, actions: Vec<RegistryAction>) {
        for action in actions {
            match action {
                RegistryAction::Notify(event) => self.emit(event),
                RegistryAction::Assemble { metadata, chunks } => {
                    self.spawn_assembly(metadata, chunks)
                }
                RegistryAction::SendControl(ctrl) => {
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.send(TransferMessage::Control(ctrl)).await {
                            debug!(
                                event = "control_send_failure",
                                file_id = %ctrl.file_id,
                                action = %ctrl.action,
                                error = %e,
                                "Could not deliver control to peer"
                            );
                        }
                    });
                }
                RegistryAction::PauseChunker { file_id, paused } => {
                    if let Some(out) = self.outgoing.get(&file_id) {
                        let _ = out.pause_tx.send(paused);
                    }
                }
                RegistryAction::StopChunker(file_id) => {
                    if let Some(out) = self.outgoing.remove(&file_id) {
                        out.stop.cancel();
                    }
                }
            }
        }
    }

    fn spawn_assembly(&self, metadata: FileMetadata, chunks: HashMap<u32, Bytes>) {
        let dir = self.config.downloads_dir.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let file_id = metadata.id;
            let event = match spawn_assembly(metadata.clone(), chunks).await {
                Ok(file) => {
                    let sha3_256 = file.sha3_256.clone();
                    match tokio::task::spawn_blocking(move || file.save_into(&dir)).await {
                        Ok(Ok(path)) => {
                            info!(event = "file_saved", %file_id, path = %path.display(), "Received file saved");
                            WorkerEvent::Saved {
                                metadata,
                                path,
                                sha3_256,
                            }
                        }
                        Ok(Err(e)) => WorkerEvent::AssemblyFailed {
                            file_id,
                            message: format!("failed to save file: {e}"),
                        },
                        Err(e) => WorkerEvent::AssemblyFailed {
                            file_id,
                            message: format!("save task failed: {e}"),
                        },
                    }
                }
                Err(e) => WorkerEvent::AssemblyFailed {
                    file_id,
                    message: e.to_string(),
                },
            };
            let _ = workers.send(event);
        });
    }
}

/// Forward one file's chunker output to the transport, metadata first.
async fn pump<T: Transport>(
    transport: Arc<T>,
    metadata: FileMetadata,
    mut chunks: mpsc::Receiver<ChunkerEvent>,
    stop: SignalOfStop,
    workers: mpsc::UnboundedSender<WorkerEvent>,
) {
    let file_id = metadata.id;
    let fail = |message: String, notify_peer| WorkerEvent::SendFailed {
        file_id,
        message,
        notify_peer,
    };

    if let Err(e) = transport.send(TransferMessage::Metadata(metadata)).await {
        let _ = workers.send(fail(format!("failed to send metadata: {e}"), false));
        return;
    }

    let mut sent: u64 = 0;
    while let Some(ev) = chunks.recv().await {
        if stop.cancelled() {
            debug!(event = "pump_stopped", %file_id, sent, "Send pump stopped");
            return;
        }
        let report = match ev {
            ChunkerEvent::ChunkReady(chunk) => {
                let len = chunk.data.len() as u64;
                let index = chunk.index;
                if let Err(e) = transport.send(TransferMessage::Chunk(chunk)).await {
                    warn!(event = "chunk_send_failure", %file_id, index, error = %e, "Failed to send chunk");
                    let _ = workers.send(fail(format!("failed to send chunk {index}: {e}"), false));
                    return;
                }
                sent += len;
                continue;
            }
            ChunkerEvent::Progress { percent, .. } => WorkerEvent::Sent {
                file_id,
                transferred_bytes: sent,
                percent,
            },
            ChunkerEvent::Complete { sha3_256, .. } => WorkerEvent::SendComplete { file_id, sha3_256 },
            ChunkerEvent::Error { message, .. } => fail(message, true),
        };
        if workers.send(report).is_err() {
            return;
        }
    }
}
