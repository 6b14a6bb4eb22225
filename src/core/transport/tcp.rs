//! TCP stream transport.
//!
//! Each frame travels as `[u32 BE length][frame bytes]`, where the frame is
//! the binary envelope from `core::protocol::frame`. A reader task decodes
//! inbound frames into [`TransportEvent`]s; a writer task drains an
//! outbound queue so `send` never blocks on the socket directly.

use super::{Transport, TransportEvent};
use crate::core::config::MAX_FRAME_SIZE;
use crate::core::protocol::{frame, TransferMessage};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound queue depth, in frames.
const OUTBOUND_QUEUE: usize = 64;

/// Inbound event queue depth.
const INBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct TcpTransport {
    outbound: mpsc::Sender<Vec<u8>>,
    peer_addr: SocketAddr,
    writer_done: watch::Receiver<()>,
}

/// Resolves once the writer task has flushed its queue and exited, which
/// happens after every clone of the transport has been dropped.
#[derive(Debug)]
pub struct WriterDone(watch::Receiver<()>);

impl WriterDone {
    pub async fn wait(mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

impl TcpTransport {
    /// Connect to a listening peer.
    pub async fn connect(
        addr: impl ToSocketAddrs,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to peer")?;
        Self::from_stream(stream)
    }

    /// Wrap an established stream (e.g. one returned by `TcpListener::accept`).
    pub fn from_stream(stream: TcpStream) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        info!(event = "tcp_connected", peer = %peer_addr, "Peer channel open");

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let (done_tx, done_rx) = watch::channel(());

        tokio::spawn(async move {
            write_loop(BufWriter::new(write_half), out_rx, peer_addr).await;
            drop(done_tx);
        });
        tokio::spawn(read_loop(read_half, in_tx, peer_addr));

        Ok((
            Self {
                outbound: out_tx,
                peer_addr,
                writer_done: done_rx,
            },
            in_rx,
        ))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle to await the end of the writer task without keeping it alive.
    pub fn writer_done(&self) -> WriterDone {
        WriterDone(self.writer_done.clone())
    }
}

impl Transport for TcpTransport {
    async fn send(&self, msg: TransferMessage) -> Result<()> {
        let wire = frame::encode(&msg)?;
        if wire.len() > MAX_FRAME_SIZE {
            bail!("frame of {} bytes exceeds limit of {MAX_FRAME_SIZE}", wire.len());
        }
        self.outbound
            .send(wire)
            .await
            .map_err(|_| anyhow!("connection to {} closed", self.peer_addr))
    }
}

async fn write_framed<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await
}

/// Read one length-prefixed frame. `Ok(None)` on a clean EOF between frames.
async fn read_framed<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}");
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("stream ended mid-frame")?;
    Ok(Some(Bytes::from(buf)))
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    peer: SocketAddr,
) {
    while let Some(frame) = outbound.recv().await {
        let mut result = write_framed(&mut writer, &frame).await;
        // Coalesce whatever is already queued before flushing.
        while result.is_ok() {
            match outbound.try_recv() {
                Ok(next) => result = write_framed(&mut writer, &next).await,
                Err(_) => break,
            }
        }
        if let Err(e) = result.and(writer.flush().await) {
            warn!(event = "tcp_write_error", %peer, error = %e, "Write to peer failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
    debug!(event = "tcp_writer_done", %peer);
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    events: mpsc::Sender<TransportEvent>,
    peer: SocketAddr,
) {
    let reason = loop {
        match read_framed(&mut reader).await {
            Ok(Some(bytes)) => match frame::decode(bytes) {
                Ok(msg) => {
                    if events.send(TransportEvent::Message(msg)).await.is_err() {
                        debug!(event = "tcp_reader_unsubscribed", %peer);
                        return;
                    }
                }
                Err(e) => {
                    warn!(event = "frame_decode_error", %peer, error = %e, "Dropping malformed frame");
                }
            },
            Ok(None) => break "peer closed the connection".to_string(),
            Err(e) => {
                warn!(event = "tcp_read_error", %peer, error = %e, "Read from peer failed");
                break e.to_string();
            }
        }
    };

    info!(event = "tcp_closed", %peer, %reason, "Peer channel closed");
    let _ = events.send(TransportEvent::Closed { reason }).await;
}
