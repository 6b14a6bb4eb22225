//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml`, or `--config <path>`)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{CHUNK_SIZE, DEFAULT_CONFIG_FILE, DEFAULT_LISTEN_ADDR, MAX_FRAME_SIZE};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// peershare - reliable chunked file transfer between two peers.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path of a TOML config file. Defaults to ./config.toml if present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for all persistent data (history, logs, downloads).
    /// Defaults to ~/.peershare/
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Where received files are saved. Defaults to <data-dir>/downloads.
    #[clap(long, global = true)]
    pub downloads_dir: Option<PathBuf>,

    /// Chunk size in bytes for outgoing files.
    #[clap(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Wait for a peer to connect and save every file it sends.
    Receive {
        /// Address to listen on.
        #[clap(long)]
        listen: Option<SocketAddr>,
    },
    /// Connect to a receiving peer and send files.
    Send {
        /// Address of the receiving peer.
        addr: SocketAddr,
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
    /// Send files through an in-process loopback and verify the result.
    Selftest {
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
    /// Inspect or edit the transfer history.
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum HistoryCommand {
    /// List finished transfers, oldest first.
    List,
    /// Remove one record.
    Remove { id: Uuid },
    /// Remove every record.
    Clear,
}

/// Settings accepted from the TOML config file.
#[derive(Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub chunk_size: Option<usize>,
    pub verbose: Option<u8>,
    pub listen: Option<SocketAddr>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let mut cli_args = Args::parse();

        // Resolve relative paths before anything changes the working directory.
        cli_args.data_dir = cli_args.data_dir.map(Self::resolve_path);
        cli_args.downloads_dir = cli_args.downloads_dir.map(Self::resolve_path);

        let file_args = match &cli_args.config {
            Some(path) => Some(Self::from_file(path)?),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Some(Self::from_file(&default_path)?)
                } else {
                    None
                }
            }
        };

        let args = match file_args {
            Some(file) => Self::merge(file, cli_args),
            None => cli_args,
        };
        args.chunk_size()?;
        Ok(args)
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load settings from a TOML file.
    fn from_file(path: &Path) -> Result<FileConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str::<FileConfig>(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Merge file settings with CLI args (CLI takes precedence).
    fn merge(file: FileConfig, mut cli: Args) -> Args {
        if cli.data_dir.is_none() {
            cli.data_dir = file.data_dir;
        }
        if cli.downloads_dir.is_none() {
            cli.downloads_dir = file.downloads_dir;
        }
        if cli.chunk_size.is_none() {
            cli.chunk_size = file.chunk_size;
        }
        if cli.verbose == 0 {
            cli.verbose = file.verbose.unwrap_or(0);
        }
        if let Command::Receive { listen } = &mut cli.command
            && listen.is_none()
        {
            *listen = file.listen;
        }
        cli
    }

    /// Effective outgoing chunk size, validated against the frame limit.
    pub fn chunk_size(&self) -> Result<usize> {
        let size = self.chunk_size.unwrap_or(CHUNK_SIZE);
        // Frame type byte + uuid + index.
        let max = MAX_FRAME_SIZE - 21;
        if size == 0 || size > max {
            bail!("chunk size must be between 1 and {max} bytes, got {size}");
        }
        Ok(size)
    }

    /// Address for `receive`, falling back to the built-in default.
    pub fn listen_addr(listen: Option<SocketAddr>) -> Result<SocketAddr> {
        match listen {
            Some(addr) => Ok(addr),
            None => DEFAULT_LISTEN_ADDR
                .parse()
                .context("invalid default listen address"),
        }
    }
}
