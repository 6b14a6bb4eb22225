pub mod config;
pub mod engine;
pub mod persistence;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod transport;
