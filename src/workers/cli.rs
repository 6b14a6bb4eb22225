//! Command runners behind the `peershare` subcommands.
//!
//! Each runner wires a transport to a transfer engine, prints what the
//! engine reports and decides when the process may exit.

use crate::core::config::DOWNLOADS_DIR_NAME;
use crate::core::engine::{start_engine, EngineConfig, EngineHandle};
use crate::core::persistence::{HistoryStore, JsonHistoryStore, MemoryHistoryStore};
use crate::core::transfer::{TransferDirection, TransferEvent, TransferStatus};
use crate::core::transport::{MemoryTransport, TcpTransport};
use crate::utils::data_dir;
use crate::utils::formatters::{
    format_eta, format_file_size, format_speed, short_id, truncate_filename,
};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{Args, Command, HistoryCommand};
use anyhow::{bail, Context, Result};
use sha3::{Digest, Sha3_256};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

/// How often live transfers are printed.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for queued frames to reach the socket at exit.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered between the two in-process engines of `selftest`.
const SELFTEST_QUEUE: usize = 64;

const NAME_WIDTH: usize = 32;

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    match args.command.clone() {
        Command::Receive { listen } => receive(&args, Args::listen_addr(listen)?, sos).await,
        Command::Send { addr, files } => send(&args, addr, &files, sos).await,
        Command::Selftest { files } => selftest(&args, &files).await,
        Command::History { action } => history(action, data_dir::get()),
    }
}

fn engine_config(args: &Args) -> Result<EngineConfig> {
    let downloads = args
        .downloads_dir
        .clone()
        .unwrap_or_else(|| data_dir::get().join(DOWNLOADS_DIR_NAME));
    with_chunk_size(args, downloads)
}

fn with_chunk_size(args: &Args, downloads_dir: PathBuf) -> Result<EngineConfig> {
    let mut config = EngineConfig::new(downloads_dir);
    config.chunk_size = args.chunk_size()?;
    Ok(config)
}

fn ticker() -> tokio::time::Interval {
    let mut tick = tokio::time::interval(PROGRESS_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

// ── Receive ──────────────────────────────────────────────────────────────────

async fn receive(args: &Args, addr: SocketAddr, sos: SignalOfStop) -> Result<()> {
    let config = engine_config(args)?;
    let history = Arc::new(JsonHistoryStore::open_in(data_dir::get())?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    println!("Listening on {}", listener.local_addr()?);
    println!("Saving files to {}", config.downloads_dir.display());

    let stream = tokio::select! {
        accepted = listener.accept() => accepted.context("failed to accept peer")?.0,
        _ = sos.wait() => return Ok(()),
    };
    // One peer per session.
    drop(listener);

    let (transport, inbound) = TcpTransport::from_stream(stream)?;
    println!("Peer connected from {}", transport.peer_addr());
    let (handle, mut events, join) = start_engine(transport, inbound, history, config);

    let mut reporter = Reporter::default();
    // Fully received, still being assembled or saved.
    let mut saving = HashSet::new();
    let mut disconnected = false;
    let mut tick = ticker();

    loop {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                reporter.event(&ev);
                match ev {
                    TransferEvent::StatusChanged { file_id, status: TransferStatus::Completed } => {
                        saving.insert(file_id);
                    }
                    TransferEvent::Completed { file_id, .. } | TransferEvent::Failed { file_id, .. } => {
                        saving.remove(&file_id);
                    }
                    TransferEvent::Disconnected { .. } => disconnected = true,
                    _ => {}
                }
                if disconnected && saving.is_empty() {
                    break;
                }
            }
            _ = tick.tick() => reporter.progress(&handle).await,
            _ = sos.wait() => {
                info!(event = "receive_interrupted", "Stopping receiver");
                break;
            }
        }
    }

    handle.shutdown().await.ok();
    join.await.ok();
    println!("{} file(s) received", reporter.completed);
    Ok(())
}

// ── Send ─────────────────────────────────────────────────────────────────────

async fn send(args: &Args, addr: SocketAddr, files: &[PathBuf], sos: SignalOfStop) -> Result<()> {
    let config = engine_config(args)?;
    let history = Arc::new(JsonHistoryStore::open_in(data_dir::get())?);

    let (transport, inbound) = TcpTransport::connect(addr).await?;
    println!("Connected to {}", transport.peer_addr());
    let flushed = transport.writer_done();
    let (handle, mut events, join) = start_engine(transport, inbound, history, config);

    let mut pending = HashSet::new();
    let mut failures = 0usize;
    for file in files {
        match handle.send_file(file).await {
            Ok(id) => {
                pending.insert(id);
            }
            Err(e) => {
                eprintln!("Skipping {}: {e:#}", file.display());
                failures += 1;
            }
        }
    }

    let mut reporter = Reporter::default();
    let mut tick = ticker();
    while !pending.is_empty() {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                reporter.event(&ev);
                match ev {
                    TransferEvent::Completed { file_id, direction: TransferDirection::Sending, .. } => {
                        pending.remove(&file_id);
                    }
                    TransferEvent::Failed { file_id, .. }
                    | TransferEvent::StatusChanged { file_id, status: TransferStatus::Cancelled } => {
                        if pending.remove(&file_id) {
                            failures += 1;
                        }
                    }
                    TransferEvent::Disconnected { .. } => {
                        failures += pending.len();
                        pending.clear();
                    }
                    _ => {}
                }
            }
            _ = tick.tick() => reporter.progress(&handle).await,
            _ = sos.wait() => {
                info!(event = "send_interrupted", remaining = pending.len(), "Cancelling outgoing transfers");
                for id in pending.drain() {
                    handle.cancel(id).await.ok();
                    failures += 1;
                }
            }
        }
    }

    handle.shutdown().await.ok();
    join.await.ok();
    // The writer exits once the last transport clone is gone.
    if tokio::time::timeout(FLUSH_TIMEOUT, flushed.wait()).await.is_err() {
        warn!(event = "flush_timeout", "Peer did not drain outgoing frames in time");
    }

    if failures > 0 {
        bail!("{failures} of {} file(s) were not sent", files.len());
    }
    println!("{} file(s) sent", reporter.completed);
    Ok(())
}

// ── Selftest ─────────────────────────────────────────────────────────────────

/// Push `files` through two engines joined by an in-memory link and compare
/// the saved copies with the originals.
async fn selftest(args: &Args, files: &[PathBuf]) -> Result<()> {
    let scratch = std::env::temp_dir().join(format!("peershare-selftest-{}", Uuid::new_v4()));
    let result = run_selftest(args, files, &scratch).await;
    let _ = std::fs::remove_dir_all(&scratch);
    result
}

async fn run_selftest(args: &Args, files: &[PathBuf], scratch: &Path) -> Result<()> {
    let sender_config = with_chunk_size(args, scratch.join("sender"))?;
    let receiver_config = with_chunk_size(args, scratch.join("received"))?;

    let ((ta, ra), (tb, rb)) = MemoryTransport::pair(SELFTEST_QUEUE);
    let received = MemoryHistoryStore::default();
    let (sender, _sender_events, sender_join) = start_engine(
        ta,
        ra,
        Arc::new(MemoryHistoryStore::default()),
        sender_config,
    );
    let (receiver, mut events, receiver_join) =
        start_engine(tb, rb, Arc::new(received.clone()), receiver_config);

    let mut expected = HashMap::new();
    for file in files {
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let digest = hex::encode(Sha3_256::digest(&data));
        let id = sender.send_file(file).await?;
        expected.insert(id, (file.clone(), digest));
    }

    let outcome = verify_received(&mut events, &receiver, &expected).await;

    sender.shutdown().await.ok();
    receiver.shutdown().await.ok();
    sender_join.await.ok();
    receiver_join.await.ok();

    let mismatches = outcome?;
    let recorded = received.load_all()?;
    if recorded.len() != expected.len() {
        bail!(
            "history holds {} record(s) for {} file(s)",
            recorded.len(),
            expected.len()
        );
    }
    if mismatches > 0 {
        bail!("{mismatches} of {} file(s) failed verification", expected.len());
    }
    println!("All {} file(s) verified", expected.len());
    Ok(())
}

async fn verify_received(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    receiver: &EngineHandle,
    expected: &HashMap<Uuid, (PathBuf, String)>,
) -> Result<usize> {
    let mut reporter = Reporter::default();
    let mut tick = ticker();
    let mut remaining: HashSet<Uuid> = expected.keys().copied().collect();
    let mut mismatches = 0;

    while !remaining.is_empty() {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else {
                    bail!("receiving engine stopped early");
                };
                reporter.event(&ev);
                match ev {
                    TransferEvent::Completed { file_id, location: Some(path), .. } => {
                        remaining.remove(&file_id);
                        let Some((source, digest)) = expected.get(&file_id) else { continue };
                        let copy = tokio::fs::read(&path).await?;
                        if hex::encode(Sha3_256::digest(&copy)) == *digest {
                            println!("OK        {}", source.display());
                        } else {
                            println!("MISMATCH  {}", source.display());
                            mismatches += 1;
                        }
                    }
                    TransferEvent::Failed { file_id, .. } => {
                        if remaining.remove(&file_id) {
                            mismatches += 1;
                        }
                    }
                    _ => {}
                }
            }
            _ = tick.tick() => reporter.progress(receiver).await,
        }
    }
    Ok(mismatches)
}

// ── History ──────────────────────────────────────────────────────────────────

fn history(action: HistoryCommand, data_dir: &Path) -> Result<()> {
    let store = JsonHistoryStore::open_in(data_dir)?;
    match action {
        HistoryCommand::List => {
            let records = store.load_all()?;
            if records.is_empty() {
                println!("No transfers recorded");
            }
            for r in records {
                println!(
                    "{}  {:<9}  {:>10}  {}  {}",
                    short_id(&r.id.to_string()),
                    r.direction,
                    format_file_size(r.size),
                    r.timestamp
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M"),
                    truncate_filename(&r.name, NAME_WIDTH * 2),
                );
            }
        }
        HistoryCommand::Remove { id } => {
            if !store.remove(&id)? {
                bail!("no history record with id {id}");
            }
            println!("Removed {id}");
        }
        HistoryCommand::Clear => {
            store.clear()?;
            println!("History cleared");
        }
    }
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Prints transfer events as one-line messages.
#[derive(Default)]
struct Reporter {
    names: HashMap<Uuid, String>,
    completed: usize,
}

impl Reporter {
    fn name(&self, id: &Uuid) -> String {
        self.names
            .get(id)
            .cloned()
            .unwrap_or_else(|| short_id(&id.to_string()).to_string())
    }

    fn event(&mut self, ev: &TransferEvent) {
        match ev {
            TransferEvent::Started(snap) => {
                println!(
                    "{} {} ({}, {})",
                    snap.direction,
                    snap.name,
                    format_file_size(snap.total_size),
                    snap.mime_type
                );
                self.names.insert(snap.id, snap.name.clone());
            }
            TransferEvent::StatusChanged { file_id, status } => match status {
                TransferStatus::Paused | TransferStatus::Cancelled => {
                    println!("{}: {status}", self.name(file_id));
                }
                _ => {}
            },
            TransferEvent::Completed {
                file_id, location, ..
            } => {
                self.completed += 1;
                match location {
                    Some(path) => println!("{}: done ({})", self.name(file_id), path.display()),
                    None => println!("{}: done", self.name(file_id)),
                }
            }
            TransferEvent::Failed { file_id, message } => {
                eprintln!("{}: failed: {message}", self.name(file_id));
            }
            TransferEvent::Disconnected { reason } => println!("Peer disconnected: {reason}"),
            TransferEvent::Progress { .. } | TransferEvent::Removed { .. } => {}
        }
    }

    async fn progress(&self, handle: &EngineHandle) {
        let Ok(snapshots) = handle.snapshot().await else {
            return;
        };
        for s in snapshots
            .iter()
            .filter(|s| s.status == TransferStatus::Transferring)
        {
            println!(
                "  {:<width$} {:>5.1}%  {:>12}  eta {}",
                truncate_filename(&s.name, NAME_WIDTH),
                s.progress,
                format_speed(s.speed),
                format_eta(s.eta),
                width = NAME_WIDTH,
            );
        }
    }
}
