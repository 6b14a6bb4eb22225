//! Transport adapters carrying [`TransferMessage`]s between peers.
//!
//! A transport is a single shared channel multiplexing every transfer.
//! Sending is fire-and-forget; inbound traffic is delivered as a stream of
//! [`TransportEvent`]s that the engine subscribes to. Delivery is
//! at-least-once and not necessarily ordered, so nothing above this layer
//! relies on ordering.

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

use crate::core::protocol::TransferMessage;

/// Inbound notification from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(TransferMessage),
    /// The channel is gone; no further messages will arrive.
    Closed { reason: String },
}

/// Outbound half of a peer channel.
pub trait Transport: Send + Sync + 'static {
    /// Queue `msg` for delivery. Fails only when the channel is closed.
    fn send(&self, msg: TransferMessage) -> impl Future<Output = anyhow::Result<()>> + Send;
}
