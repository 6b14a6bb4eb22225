//! Centralized configuration constants for peershare.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame type bytes) stay in
//! `core::protocol::frame`.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KiB).
///
/// Sized for peer data channels whose per-message ceiling is commonly 16 KiB
/// when talking to browser peers. The value is private to the sender: the
/// receiver only ever trusts `total_chunks` from the metadata message.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Read-ahead depth between a chunker task and the send loop.
/// Bounds memory per outgoing file to `CHUNK_READ_AHEAD × CHUNK_SIZE`.
pub const CHUNK_READ_AHEAD: usize = 32;

// ── Transfer lifecycle ───────────────────────────────────────────────────────

/// How long a transfer stays in the active set after reaching a terminal
/// status, so observers can display the final state before it disappears.
pub const TERMINAL_GRACE_DELAY: Duration = Duration::from_secs(3);

/// Interval at which the engine sweeps terminal records and stale buffers.
pub const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Number of retired transfer IDs remembered after removal from the active
/// set. Late chunks and duplicate metadata for these IDs are dropped instead
/// of being buffered or re-registered.
pub const RETIRED_ID_CAPACITY: usize = 1024;

// ── Safety / Abuse Prevention ────────────────────────────────────────────────

/// Maximum chunks buffered per file before its Metadata message arrives.
/// Prevents a peer from flooding pre-metadata chunks to exhaust memory.
pub const MAX_PENDING_CHUNKS_PER_FILE: usize = 64;

/// Maximum number of distinct file IDs in the pending-chunk buffer.
/// Limits memory exposure from bogus file IDs sent before Metadata.
pub const MAX_PENDING_FILE_IDS: usize = 16;

/// Pre-metadata buffers older than this are discarded on the next sweep.
pub const PENDING_CHUNK_TTL: Duration = Duration::from_secs(30);

/// Largest frame accepted by the stream transport (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ── Persistence ──────────────────────────────────────────────────────────────

/// Maximum number of records kept in the transfer history file.
/// The oldest entries are evicted first.
pub const MAX_HISTORY_ENTRIES: usize = 500;

/// File name of the transfer history inside the data directory.
pub const HISTORY_FILE_NAME: &str = "history.json";

/// Directory (inside the data directory) where received files are saved.
pub const DOWNLOADS_DIR_NAME: &str = "downloads";

// ── Command line ─────────────────────────────────────────────────────────────

/// Address `receive` listens on when none is configured.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7878";

/// Config file read from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
