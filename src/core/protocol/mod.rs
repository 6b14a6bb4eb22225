//! Peer protocol: message kinds and their binary framing.
//!
//! - `message`: `FileMetadata`, `ControlMessage` and the `TransferMessage` envelope
//! - `frame`: compact `[type][payload]` encoding used by stream transports

pub mod frame;
pub mod message;

pub use message::{ControlAction, ControlMessage, FileMetadata, TransferMessage};
