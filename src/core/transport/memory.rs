//! In-process transport pair.
//!
//! Messages pass through the binary frame codec exactly as they would on a
//! stream transport, so loopback runs exercise the real wire format.

use super::{Transport, TransportEvent};
use crate::core::protocol::{frame, TransferMessage};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    peer: mpsc::Sender<TransportEvent>,
}

impl MemoryTransport {
    /// Two connected endpoints, each with the receiver of its inbound events.
    ///
    /// `capacity` bounds the number of in-flight messages per direction.
    pub fn pair(
        capacity: usize,
    ) -> (
        (Self, mpsc::Receiver<TransportEvent>),
        (Self, mpsc::Receiver<TransportEvent>),
    ) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        ((Self { peer: b_tx }, a_rx), (Self { peer: a_tx }, b_rx))
    }

    /// Tell the peer the channel is closed.
    pub async fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(event = "memory_transport_close", %reason);
        let _ = self.peer.send(TransportEvent::Closed { reason }).await;
    }
}

impl Transport for MemoryTransport {
    async fn send(&self, msg: TransferMessage) -> Result<()> {
        let wire = frame::encode(&msg)?;
        let decoded = frame::decode(Bytes::from(wire))?;
        self.peer
            .send(TransportEvent::Message(decoded))
            .await
            .map_err(|_| anyhow!("peer channel closed"))
    }
}
